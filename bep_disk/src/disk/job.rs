use std::path::PathBuf;

use crate::disk::storage::{ResumeData, StorageLayout};
use crate::disk::{DiskOperation, FileFlags, IDiskMessage, ODiskMessage};
use crate::error::{BlockError, BlockErrorKind, TorrentError, TorrentErrorKind};
use crate::memory::block::{Block, BlockMut};

use bep_util::bt::InfoHash;

/// Internal unit of work executed by the disk workers.
///
/// One to one with `IDiskMessage` except for the internal variants which
/// the pool schedules on its own behalf and which post no completion.
#[derive(Debug)]
pub enum DiskJob {
    AddTorrent(StorageLayout),
    StopTorrent(InfoHash),
    LoadBlock { block: BlockMut, flags: FileFlags },
    ProcessBlock { block: Block, flags: FileFlags },
    HashPiece { hash: InfoHash, piece: u64 },
    CachePiece { hash: InfoHash, piece: u64 },
    FlushPiece { hash: InfoHash, piece: u64 },
    /// Internal: flush the hashed dirty prefix of a piece.
    FlushHashed { hash: InfoHash, piece: u64 },
    FlushStorage { hash: InfoHash, internal: bool },
    TrimCache,
    MoveStorage { hash: InfoHash, new_dir: PathBuf },
    RenameFile { hash: InfoHash, index: usize, new_name: PathBuf },
    DeleteFiles { hash: InfoHash },
    ReleaseFiles { hash: InfoHash },
    CheckFastresume { hash: InfoHash, resume: ResumeData },
    SaveResumeData { hash: InfoHash },
    SetFilePriority { hash: InfoHash, priorities: Vec<u8> },
    ClearPiece { hash: InfoHash, piece: u64 },
    Tick { hash: InfoHash },
}

impl DiskJob {
    /// Storage this job operates on, if it targets one.
    pub fn storage(&self) -> Option<InfoHash> {
        match self {
            DiskJob::AddTorrent(layout) => Some(*layout.info_hash()),
            DiskJob::StopTorrent(hash) => Some(*hash),
            DiskJob::LoadBlock { block, .. } => Some(*block.metadata().info_hash()),
            DiskJob::ProcessBlock { block, .. } => Some(*block.metadata().info_hash()),
            DiskJob::HashPiece { hash, .. }
            | DiskJob::CachePiece { hash, .. }
            | DiskJob::FlushPiece { hash, .. }
            | DiskJob::FlushHashed { hash, .. }
            | DiskJob::FlushStorage { hash, .. }
            | DiskJob::MoveStorage { hash, .. }
            | DiskJob::RenameFile { hash, .. }
            | DiskJob::DeleteFiles { hash }
            | DiskJob::ReleaseFiles { hash }
            | DiskJob::CheckFastresume { hash, .. }
            | DiskJob::SaveResumeData { hash }
            | DiskJob::SetFilePriority { hash, .. }
            | DiskJob::ClearPiece { hash, .. }
            | DiskJob::Tick { hash } => Some(*hash),
            DiskJob::TrimCache => None,
        }
    }

    /// True if the job mutates storage and must run behind a fence.
    pub fn is_fence(&self) -> bool {
        match self {
            DiskJob::StopTorrent(..)
            | DiskJob::MoveStorage { .. }
            | DiskJob::RenameFile { .. }
            | DiskJob::DeleteFiles { .. }
            | DiskJob::ReleaseFiles { .. } => true,
            _ => false,
        }
    }

    /// True if the job belongs on the dedicated hash queue.
    pub fn is_hash(&self) -> bool {
        match self {
            DiskJob::HashPiece { .. } => true,
            _ => false,
        }
    }

    /// Operation tag for completions and errors.
    pub fn operation(&self) -> DiskOperation {
        match self {
            DiskJob::AddTorrent(..) => DiskOperation::AddTorrent,
            DiskJob::StopTorrent(..) => DiskOperation::StopTorrent,
            DiskJob::LoadBlock { .. } => DiskOperation::Read,
            DiskJob::ProcessBlock { .. } => DiskOperation::Write,
            DiskJob::HashPiece { .. } => DiskOperation::Hash,
            DiskJob::CachePiece { .. } => DiskOperation::CachePiece,
            DiskJob::FlushPiece { .. } | DiskJob::FlushHashed { .. } => DiskOperation::FlushPiece,
            DiskJob::FlushStorage { .. } => DiskOperation::FlushStorage,
            DiskJob::TrimCache => DiskOperation::TrimCache,
            DiskJob::MoveStorage { .. } => DiskOperation::MoveStorage,
            DiskJob::RenameFile { .. } => DiskOperation::RenameFile,
            DiskJob::DeleteFiles { .. } => DiskOperation::DeleteFiles,
            DiskJob::ReleaseFiles { .. } => DiskOperation::ReleaseFiles,
            DiskJob::CheckFastresume { .. } => DiskOperation::CheckFastresume,
            DiskJob::SaveResumeData { .. } => DiskOperation::SaveResumeData,
            DiskJob::SetFilePriority { .. } => DiskOperation::FilePriority,
            DiskJob::ClearPiece { .. } => DiskOperation::ClearPiece,
            DiskJob::Tick { .. } => DiskOperation::Tick,
        }
    }

    /// Convert an unexecuted job into its operation aborted completion.
    ///
    /// Internal jobs abort silently and yield no completion.
    pub fn into_aborted(self) -> Option<ODiskMessage> {
        let operation = self.operation();

        match self {
            DiskJob::LoadBlock { block, .. } => Some(ODiskMessage::LoadBlockError(
                block,
                BlockError::from_kind(BlockErrorKind::OperationAborted),
            )),
            DiskJob::ProcessBlock { block, .. } => Some(ODiskMessage::ProcessBlockError(
                block,
                BlockError::from_kind(BlockErrorKind::OperationAborted),
            )),
            DiskJob::FlushHashed { .. } | DiskJob::FlushStorage { internal: true, .. } => None,
            DiskJob::TrimCache => None,
            other => other.storage().map(|hash| {
                ODiskMessage::TorrentError(
                    hash,
                    operation,
                    TorrentError::from_kind(TorrentErrorKind::OperationAborted),
                )
            }),
        }
    }
}

impl From<IDiskMessage> for DiskJob {
    fn from(msg: IDiskMessage) -> DiskJob {
        match msg {
            IDiskMessage::AddTorrent(layout) => DiskJob::AddTorrent(layout),
            IDiskMessage::RemoveTorrent(hash) => DiskJob::StopTorrent(hash),
            IDiskMessage::LoadBlock(block) => DiskJob::LoadBlock { block, flags: FileFlags::empty() },
            IDiskMessage::ProcessBlock(block) => DiskJob::ProcessBlock { block, flags: FileFlags::empty() },
            IDiskMessage::HashPiece(hash, piece) => DiskJob::HashPiece { hash, piece },
            IDiskMessage::CachePiece(hash, piece) => DiskJob::CachePiece { hash, piece },
            IDiskMessage::FlushPiece(hash, piece) => DiskJob::FlushPiece { hash, piece },
            IDiskMessage::FlushStorage(hash) => DiskJob::FlushStorage { hash, internal: false },
            IDiskMessage::TrimCache => DiskJob::TrimCache,
            IDiskMessage::MoveStorage(hash, new_dir) => DiskJob::MoveStorage { hash, new_dir },
            IDiskMessage::RenameFile(hash, index, new_name) => DiskJob::RenameFile { hash, index, new_name },
            IDiskMessage::DeleteFiles(hash) => DiskJob::DeleteFiles { hash },
            IDiskMessage::ReleaseFiles(hash) => DiskJob::ReleaseFiles { hash },
            IDiskMessage::CheckFastresume(hash, resume) => DiskJob::CheckFastresume { hash, resume },
            IDiskMessage::SaveResumeData(hash) => DiskJob::SaveResumeData { hash },
            IDiskMessage::SetFilePriority(hash, priorities) => DiskJob::SetFilePriority { hash, priorities },
            IDiskMessage::ClearPiece(hash, piece) => DiskJob::ClearPiece { hash, piece },
            IDiskMessage::Tick(hash) => DiskJob::Tick { hash },
        }
    }
}
