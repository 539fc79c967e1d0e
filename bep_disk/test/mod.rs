extern crate bep_disk;
extern crate bep_util;
extern crate bytes;
extern crate futures;
extern crate rand;
extern crate tokio_core;

use std::cmp;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bep_disk::{BlockMetadata, FileSystem, IDiskMessage, ODiskMessage, StorageFile, StorageLayout};
use bep_util::bt::InfoHash;
use bytes::BytesMut;
use futures::future::Future;
use futures::sink::{Sink, Wait};
use futures::stream::Stream;
use rand::Rng;
use tokio_core::reactor::{Core, Timeout};

mod add_torrent;
mod load_block;
mod process_block;
mod remove_torrent;

/// Generate a buffer of size random bytes.
fn random_buffer(size: usize) -> Vec<u8> {
    let mut rng = rand::weak_rng();

    (0..size).map(|_| rng.gen()).collect()
}

/// Build a single file layout backed by the given content length.
fn simple_layout(seed: u8, piece_length: u64, file_length: u64) -> StorageLayout {
    let hash: InfoHash = [seed; 20].into();

    StorageLayout::new(
        hash,
        piece_length,
        vec![StorageFile { path: "data/file_a.bin".into(), length: file_length }],
    )
}

/// Pull the next completion off the stream, panicking on timeout.
fn next_message<S>(core: &mut Core, stream: S, timeout_ms: u64) -> (ODiskMessage, S)
where
    S: Stream<Item = ODiskMessage, Error = ()>,
{
    let deadline = Timeout::new(Duration::from_millis(timeout_ms), &core.handle())
        .unwrap()
        .then(|_| Err(()));

    let (opt_msg, stream) = core
        .run(
            stream
                .into_future()
                .map_err(|_| ())
                .select(deadline)
                .map(|(next, _)| next)
                .map_err(|_| ()),
        )
        .unwrap_or_else(|_| panic!("Timed Out Waiting For A Disk Message"));

    (opt_msg.unwrap_or_else(|| panic!("Disk Message Stream Ended")), stream)
}

/// Send a block with the given metadata and data.
fn send_block<S>(blocking_send: &mut Wait<S>, data: &[u8], hash: InfoHash, piece_index: u64, block_offset: u64)
where
    S: Sink<SinkItem = IDiskMessage>,
{
    let mut bytes = BytesMut::new();
    bytes.extend_from_slice(data);

    let block = bep_disk::Block::new(
        BlockMetadata::new(hash, piece_index, block_offset, data.len()),
        bytes.freeze(),
    );

    blocking_send
        .send(IDiskMessage::ProcessBlock(block))
        .unwrap_or_else(|_| panic!("Failed To Send Process Block Message"));
}

/// Request a block load for the given metadata.
fn send_load<S>(blocking_send: &mut Wait<S>, hash: InfoHash, piece_index: u64, block_offset: u64, length: usize)
where
    S: Sink<SinkItem = IDiskMessage>,
{
    let mut buffer = BytesMut::with_capacity(length);
    buffer.extend_from_slice(&vec![0u8; length]);

    let block = bep_disk::BlockMut::new(BlockMetadata::new(hash, piece_index, block_offset, length), buffer);

    blocking_send
        .send(IDiskMessage::LoadBlock(block))
        .unwrap_or_else(|_| panic!("Failed To Send Load Block Message"));
}

//----------------------------------------------------------------------------//

/// File system living entirely in a shared map, for the tests.
///
/// Handles carry their own reference to the map, so file operations go
/// through the handle rather than back through the file system object.
#[derive(Clone, Default)]
struct InMemoryFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

struct InMemoryFile {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    path: PathBuf,
}

impl InMemoryFileSystem {
    fn new() -> InMemoryFileSystem {
        InMemoryFileSystem::default()
    }

    /// Inspect the stored files, for assertions.
    fn with_files<C, R>(&self, call: C) -> R
    where
        C: FnOnce(&mut HashMap<PathBuf, Vec<u8>>) -> R,
    {
        call(&mut *self.files.lock().unwrap())
    }
}

impl FileSystem for InMemoryFileSystem {
    type File = InMemoryFile;

    fn open_file<P>(&self, path: P) -> io::Result<Self::File>
    where
        P: AsRef<Path> + Send + 'static,
    {
        let file_path = path.as_ref().to_path_buf();

        self.with_files(|files| {
            files.entry(file_path.clone()).or_insert_with(Vec::new);
        });

        Ok(InMemoryFile { files: self.files.clone(), path: file_path })
    }

    fn sync_file<P>(&self, _path: P) -> io::Result<()>
    where
        P: AsRef<Path> + Send + 'static,
    {
        Ok(())
    }

    fn remove_file<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path> + Send + 'static,
    {
        self.with_files(|files| {
            files
                .remove(path.as_ref())
                .map(|_| ())
                .ok_or(io::Error::new(io::ErrorKind::NotFound, "No Such In Memory File"))
        })
    }

    fn rename_file<P, Q>(&self, from: P, to: Q) -> io::Result<()>
    where
        P: AsRef<Path> + Send + 'static,
        Q: AsRef<Path> + Send + 'static,
    {
        self.with_files(|files| match files.remove(from.as_ref()) {
            Some(contents) => {
                files.insert(to.as_ref().to_path_buf(), contents);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "No Such In Memory File")),
        })
    }

    fn file_size(&self, file: &Self::File) -> io::Result<u64> {
        let files = file.files.lock().unwrap();

        files
            .get(&file.path)
            .map(|contents| contents.len() as u64)
            .ok_or(io::Error::new(io::ErrorKind::NotFound, "No Such In Memory File"))
    }

    fn read_file(&self, file: &mut Self::File, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        let files = file.files.lock().unwrap();
        let contents = files
            .get(&file.path)
            .ok_or(io::Error::new(io::ErrorKind::NotFound, "No Such In Memory File"))?;

        let offset = offset as usize;
        if offset >= contents.len() {
            return Ok(0);
        }

        let count = cmp::min(buffer.len(), contents.len() - offset);
        buffer[..count].copy_from_slice(&contents[offset..offset + count]);

        Ok(count)
    }

    fn write_file(&self, file: &mut Self::File, offset: u64, buffer: &[u8]) -> io::Result<usize> {
        let mut files = file.files.lock().unwrap();
        let contents = files
            .get_mut(&file.path)
            .ok_or(io::Error::new(io::ErrorKind::NotFound, "No Such In Memory File"))?;

        let end = offset as usize + buffer.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[end - buffer.len()..end].copy_from_slice(buffer);

        Ok(buffer.len())
    }
}
