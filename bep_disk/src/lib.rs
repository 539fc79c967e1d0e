extern crate bep_util;
extern crate bytes;
extern crate crossbeam;
#[macro_use]
extern crate error_chain;
extern crate futures;
#[macro_use]
extern crate log;
extern crate lru_cache;

mod cache;
mod disk;
mod memory;
mod settings;
mod stats;

/// Both `Block` and `Torrent` error types.
pub mod error;

pub use crate::disk::builder::DiskManagerBuilder;
pub use crate::disk::fs::FileSystem;
pub use crate::disk::manager::DiskManager;
pub use crate::disk::storage::{FastresumeStatus, ResumeData, StorageFile, StorageLayout};
pub use crate::disk::{DiskOperation, FileFlags, IDiskMessage, ODiskMessage};

pub use crate::cache::hash::{DigestKind, PieceHash};
pub use crate::memory::block::{Block, BlockMetadata, BlockMut};

pub use crate::settings::DiskSettings;
pub use crate::stats::DiskStatsSnapshot;

/// Built in objects implementing `FileSystem`.
pub mod fs {
    pub use crate::disk::fs::native::{NativeFile, NativeFileSystem};
}

/// Built in objects implementing `FileSystem` for caching.
pub mod fs_cache {
    pub use crate::disk::fs::cache::file_handle::FileHandleCache;
}

pub use bep_util::bt::InfoHash;

/// Size of a cache block, the fixed allocation unit.
pub const BLOCK_SIZE: usize = 16 * 1024;
