use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::disk::fs::FileSystem;

use lru_cache::LruCache;

/// Shared, lockable handle to a file of the wrapped file system.
type SharedFile<T> = Arc<Mutex<T>>;

/// Bounded cache of open handles layered over another `FileSystem`.
///
/// Opening a file can cost far more than the read or write behind it, so
/// handles stay open and shared until capacity pushes the least recently
/// used one out. Each handle carries its own mutex, letting workers hit
/// the same file through a single cached entry.
pub struct FileHandleCache<F>
where
    F: FileSystem,
{
    handles: Mutex<LruCache<PathBuf, SharedFile<F::File>>>,
    inner: F,
}

impl<F> FileHandleCache<F>
where
    F: FileSystem,
{
    /// Create a new `FileHandleCache` holding at most `capacity` handles
    /// over the given inner `FileSystem`.
    pub fn new(inner: F, capacity: usize) -> FileHandleCache<F> {
        FileHandleCache {
            handles: Mutex::new(LruCache::new(capacity)),
            inner,
        }
    }

    fn handles(&self) -> MutexGuard<LruCache<PathBuf, SharedFile<F::File>>> {
        self.handles.lock().expect("bep_disk: FileHandleCache Poisoned Handle Map")
    }

    /// Forget the cached handle for one path, if any.
    fn evict<P>(&self, path: P)
    where
        P: AsRef<Path>,
    {
        self.handles().remove(path.as_ref());
    }
}

impl<F> FileSystem for FileHandleCache<F>
where
    F: FileSystem,
{
    type File = SharedFile<F::File>;

    fn open_file<P>(&self, path: P) -> io::Result<Self::File>
    where
        P: AsRef<Path> + Send + 'static,
    {
        if let Some(cached) = self.handles().get_mut(path.as_ref()) {
            return Ok(cached.clone());
        }

        // Open without holding the map lock; if two workers race here the
        // later insert wins and both handles stay usable.
        let key = path.as_ref().to_path_buf();
        let opened = Arc::new(Mutex::new(self.inner.open_file(path)?));

        self.handles().insert(key, opened.clone());

        Ok(opened)
    }

    fn sync_file<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path> + Send + 'static,
    {
        // The inner sync must see its own fresh handle, not our cached one.
        self.evict(path.as_ref());

        self.inner.sync_file(path)
    }

    fn remove_file<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path> + Send + 'static,
    {
        self.evict(path.as_ref());

        self.inner.remove_file(path)
    }

    fn rename_file<P, Q>(&self, from: P, to: Q) -> io::Result<()>
    where
        P: AsRef<Path> + Send + 'static,
        Q: AsRef<Path> + Send + 'static,
    {
        self.evict(from.as_ref());
        self.evict(to.as_ref());

        self.inner.rename_file(from, to)
    }

    fn release_file<P>(&self, path: P)
    where
        P: AsRef<Path> + Send + 'static,
    {
        self.evict(path.as_ref());
    }

    fn file_size(&self, file: &Self::File) -> io::Result<u64> {
        let locked = file.lock().expect("bep_disk: FileHandleCache Poisoned File Handle");

        self.inner.file_size(&*locked)
    }

    fn read_file(&self, file: &mut Self::File, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        let mut locked = file.lock().expect("bep_disk: FileHandleCache Poisoned File Handle");

        self.inner.read_file(&mut *locked, offset, buffer)
    }

    fn write_file(&self, file: &mut Self::File, offset: u64, buffer: &[u8]) -> io::Result<usize> {
        let mut locked = file.lock().expect("bep_disk: FileHandleCache Poisoned File Handle");

        self.inner.write_file(&mut *locked, offset, buffer)
    }
}
