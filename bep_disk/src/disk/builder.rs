use crate::disk::fs::FileSystem;
use crate::disk::manager::DiskManager;
use crate::settings::DiskSettings;

const DEFAULT_COMPLETED_SIZE: usize = 10;

/// `DiskManagerBuilder` for building `DiskManager`s with different settings.
pub struct DiskManagerBuilder {
    settings: DiskSettings,
    completed_size: usize,
}

impl DiskManagerBuilder {
    /// Create a new `DiskManagerBuilder`.
    pub fn new() -> DiskManagerBuilder {
        DiskManagerBuilder {
            settings: DiskSettings::default(),
            completed_size: DEFAULT_COMPLETED_SIZE,
        }
    }

    /// Use the given worker thread count.
    pub fn with_worker_threads(mut self, threads: usize) -> DiskManagerBuilder {
        assert!(threads > 0);
        self.settings.worker_threads = threads;
        self
    }

    /// Use the given cache capacity, in 16 KiB blocks.
    pub fn with_cache_size(mut self, blocks: usize) -> DiskManagerBuilder {
        self.settings.cache_size = blocks;
        self
    }

    /// Replace the whole settings block.
    pub fn with_settings(mut self, settings: DiskSettings) -> DiskManagerBuilder {
        self.settings = settings;
        self
    }

    /// Specify the buffer capacity for completed `ODiskMessage`s.
    pub fn with_stream_buffer_capacity(mut self, size: usize) -> DiskManagerBuilder {
        self.completed_size = size;
        self
    }

    /// Retrieve the current settings.
    pub fn settings(&self) -> DiskSettings {
        self.settings
    }

    /// Retrieve the stream buffer capacity.
    pub fn stream_buffer_capacity(&self) -> usize {
        self.completed_size
    }

    /// Build a `DiskManager` with the given `FileSystem`.
    pub fn build<F>(self, fs: F) -> DiskManager<F>
    where
        F: FileSystem + Send + Sync + 'static,
    {
        DiskManager::from_builder(self, fs)
    }
}
