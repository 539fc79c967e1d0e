use std::path::PathBuf;

use crate::cache::hash::PieceHash;
use crate::disk::storage::{FastresumeStatus, ResumeData, StorageLayout};
use crate::error::{BlockError, TorrentError};
use crate::memory::block::{Block, BlockMut};

use bep_util::bt::InfoHash;

pub mod builder;
pub mod fence;
pub mod fs;
pub mod job;
pub mod manager;
pub mod pool;
pub mod storage;
mod tasks;

//----------------------------------------------------------------------------//

/// Hints passed down to the file system for a single I/O operation.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct FileFlags(u8);

impl FileFlags {
    const RANDOM_ACCESS: u8 = 0x01;
    const COALESCE_BUFFERS: u8 = 0x02;
    const SEQUENTIAL: u8 = 0x04;

    /// No hints.
    pub fn empty() -> FileFlags {
        FileFlags(0)
    }

    /// Hint that access follows no predictable pattern.
    pub fn random_access() -> FileFlags {
        FileFlags(FileFlags::RANDOM_ACCESS)
    }

    /// Hint that scattered buffers should be written as one span.
    pub fn coalesce_buffers() -> FileFlags {
        FileFlags(FileFlags::COALESCE_BUFFERS)
    }

    /// Hint that access is sequential.
    pub fn sequential() -> FileFlags {
        FileFlags(FileFlags::SEQUENTIAL)
    }

    /// Combine two sets of hints.
    pub fn union(self, other: FileFlags) -> FileFlags {
        FileFlags(self.0 | other.0)
    }

    pub fn is_random_access(&self) -> bool {
        self.0 & FileFlags::RANDOM_ACCESS != 0
    }

    pub fn is_coalesce_buffers(&self) -> bool {
        self.0 & FileFlags::COALESCE_BUFFERS != 0
    }

    pub fn is_sequential(&self) -> bool {
        self.0 & FileFlags::SEQUENTIAL != 0
    }
}

//----------------------------------------------------------------------------//

/// Operation a completion or error originated from.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DiskOperation {
    AddTorrent,
    StopTorrent,
    Read,
    Write,
    Hash,
    CachePiece,
    FlushPiece,
    FlushStorage,
    TrimCache,
    MoveStorage,
    RenameFile,
    DeleteFiles,
    ReleaseFiles,
    CheckFastresume,
    SaveResumeData,
    FilePriority,
    ClearPiece,
    Tick,
}

//----------------------------------------------------------------------------//

/// Messages that can be sent to the `DiskManager`.
#[derive(Debug)]
pub enum IDiskMessage {
    /// Message to add a torrent to the disk manager.
    ///
    /// The layout is the flattened file list of the torrent; metainfo
    /// parsing happens above the disk layer.
    AddTorrent(StorageLayout),
    /// Message to stop a torrent and drop it from the disk manager.
    ///
    /// Dirty cached blocks are flushed before the torrent is removed; the
    /// files themselves are left on the `FileSystem`.
    RemoveTorrent(InfoHash),
    /// Message to load the given block into memory.
    LoadBlock(BlockMut),
    /// Message to process the given block and persist it.
    ProcessBlock(Block),
    /// Message to compute the digest of a piece.
    HashPiece(InfoHash, u64),
    /// Message to pre load an entire piece into the cache.
    CachePiece(InfoHash, u64),
    /// Message to flush all dirty blocks of a piece.
    FlushPiece(InfoHash, u64),
    /// Message to flush all dirty blocks of a torrent.
    FlushStorage(InfoHash),
    /// Message to shrink the cache below its low watermark.
    TrimCache,
    /// Message to move all files of a torrent to a new directory.
    MoveStorage(InfoHash, PathBuf),
    /// Message to rename a single file of a torrent.
    RenameFile(InfoHash, usize, PathBuf),
    /// Message to delete all files of a torrent.
    DeleteFiles(InfoHash),
    /// Message to drop process held file resources of a torrent.
    ReleaseFiles(InfoHash),
    /// Message to validate on disk state against resume data.
    CheckFastresume(InfoHash, ResumeData),
    /// Message to snapshot on disk state as resume data.
    SaveResumeData(InfoHash),
    /// Message to update the download priorities of a torrent's files.
    SetFilePriority(InfoHash, Vec<u8>),
    /// Message to drop a piece from the cache, discarding dirty blocks.
    ClearPiece(InfoHash, u64),
    /// Message to give a torrent's storage a periodic tick.
    Tick(InfoHash),
}

/// Messages that can be received from the `DiskManager`.
#[derive(Debug)]
pub enum ODiskMessage {
    /// Message indicating that the torrent has been added.
    TorrentAdded(InfoHash),
    /// Message indicating that the torrent has been stopped and removed.
    TorrentRemoved(InfoHash),
    /// Message indicating that the torrent's files have been moved.
    TorrentMoved(InfoHash, PathBuf),
    /// Message indicating that a file of the torrent has been renamed.
    FileRenamed(InfoHash, usize, PathBuf),
    /// Message indicating that the torrent's files have been deleted.
    FilesDeleted(InfoHash),
    /// Message indicating that the torrent's file resources were dropped.
    FilesReleased(InfoHash),
    /// Message carrying the outcome of a fastresume check.
    FastresumeChecked(InfoHash, FastresumeStatus),
    /// Message carrying freshly written resume data.
    ResumeDataSaved(InfoHash, ResumeData),
    /// Message indicating that new file priorities have been recorded.
    FilePrioritySet(InfoHash),
    /// Message indicating that the given block has been loaded.
    BlockLoaded(BlockMut),
    /// Message indicating that the given block has been processed.
    BlockProcessed(Block),
    /// Message carrying the digest of a hashed piece.
    PieceHashed(InfoHash, u64, PieceHash),
    /// Message indicating that a piece has been pre loaded into the cache.
    PieceCached(InfoHash, u64),
    /// Message indicating that all dirty blocks of a piece were flushed.
    PieceFlushed(InfoHash, u64),
    /// Message indicating that all dirty blocks of a torrent were flushed.
    StorageFlushed(InfoHash),
    /// Message indicating that a piece was dropped from the cache.
    PieceCleared(InfoHash, u64),
    /// Message indicating that a trim pass freed the given block count.
    CacheTrimmed(usize),
    /// Error occurring from a torrent level job.
    TorrentError(InfoHash, DiskOperation, TorrentError),
    /// Error occurring from a `LoadBlock` message.
    LoadBlockError(BlockMut, BlockError),
    /// Error occurring from a `ProcessBlock` message.
    ProcessBlockError(Block, BlockError),
}
