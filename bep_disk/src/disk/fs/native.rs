use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use crate::disk::fs::FileSystem;

/// File opened on the local disk.
pub struct NativeFile {
    file: File,
}

/// `FileSystem` backed by the OS, rooted at a base directory.
///
/// Every relative path is resolved against the base directory. Parent
/// components that would climb out of the base are rejected, so a hostile
/// layout cannot address files above it.
pub struct NativeFileSystem {
    base_dir: PathBuf,
}

impl NativeFileSystem {
    /// Create a NativeFileSystem rooted at the given directory.
    pub fn with_directory<P>(base: P) -> NativeFileSystem
    where
        P: AsRef<Path>,
    {
        NativeFileSystem { base_dir: base.as_ref().to_path_buf() }
    }

    /// Resolve a caller supplied path under the base directory.
    ///
    /// Absolute paths are trusted as given. Relative paths are walked
    /// component by component; `..` may only undo pieces of the relative
    /// path itself, never the base.
    fn resolve<P>(&self, path: P) -> io::Result<PathBuf>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }

        let mut resolved = self.base_dir.clone();
        let mut depth = 0u32;

        for component in path.components() {
            match component {
                Component::Normal(piece) => {
                    resolved.push(piece);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            "Path Escapes The Base Directory",
                        ));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                _ => {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "Unsupported Path Component"));
                }
            }
        }

        Ok(resolved)
    }
}

impl FileSystem for NativeFileSystem {
    type File = NativeFile;

    fn open_file<P>(&self, path: P) -> io::Result<Self::File>
    where
        P: AsRef<Path> + Send + 'static,
    {
        let full_path = self.resolve(path)?;

        if let Some(parent_dir) = full_path.parent() {
            fs::create_dir_all(parent_dir)?;
        }
        let file = OpenOptions::new().read(true).write(true).create(true).open(&full_path)?;

        Ok(NativeFile { file })
    }

    fn sync_file<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path> + Send + 'static,
    {
        let full_path = self.resolve(path)?;

        File::open(&full_path)?.sync_all()
    }

    fn remove_file<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path> + Send + 'static,
    {
        let full_path = self.resolve(path)?;

        fs::remove_file(&full_path)
    }

    fn rename_file<P, Q>(&self, from: P, to: Q) -> io::Result<()>
    where
        P: AsRef<Path> + Send + 'static,
        Q: AsRef<Path> + Send + 'static,
    {
        let full_from = self.resolve(from)?;
        let full_to = self.resolve(to)?;

        if let Some(parent_dir) = full_to.parent() {
            fs::create_dir_all(parent_dir)?;
        }

        fs::rename(&full_from, &full_to)
    }

    fn file_size(&self, file: &NativeFile) -> io::Result<u64> {
        file.file.metadata().map(|metadata| metadata.len())
    }

    fn read_file(&self, file: &mut NativeFile, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        file.file.seek(SeekFrom::Start(offset))?;

        // Read until the buffer is full or the file runs out; storage
        // spans expect whole regions, not partial chunks.
        let mut total = 0;
        while total < buffer.len() {
            let count = file.file.read(&mut buffer[total..])?;
            if count == 0 {
                break;
            }
            total += count;
        }

        Ok(total)
    }

    fn write_file(&self, file: &mut NativeFile, offset: u64, buffer: &[u8]) -> io::Result<usize> {
        file.file.seek(SeekFrom::Start(offset))?;
        file.file.write_all(buffer)?;

        Ok(buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use super::NativeFileSystem;

    #[test]
    fn positive_resolve_joins_relative_paths() {
        let fs = NativeFileSystem::with_directory("/downloads");

        let resolved = fs.resolve("torrent/data.bin").unwrap();
        assert_eq!(std::path::PathBuf::from("/downloads/torrent/data.bin"), resolved);
    }

    #[test]
    fn positive_resolve_allows_internal_parents() {
        let fs = NativeFileSystem::with_directory("/downloads");

        let resolved = fs.resolve("torrent/../other/data.bin").unwrap();
        assert_eq!(std::path::PathBuf::from("/downloads/other/data.bin"), resolved);
    }

    #[test]
    fn negative_resolve_rejects_escape() {
        let fs = NativeFileSystem::with_directory("/downloads");

        assert!(fs.resolve("../etc/passwd").is_err());
        assert!(fs.resolve("torrent/../../etc/passwd").is_err());
    }
}
