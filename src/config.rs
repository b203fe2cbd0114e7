//! Configuration for AtlasDB
//!
//! Centralized configuration with sensible defaults. Loading configuration
//! from files or the environment is left to the embedding application; it
//! builds a [`Config`] through [`Config::builder`].

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AtlasError, Result};

/// Smallest supported page size (bytes)
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size; slot offsets are u16
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Main configuration for an AtlasDB engine instance
#[derive(Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── wal.log          (write-ahead log)
    ///     ├── catalog.bin      (table descriptors)
    ///     └── tables/          (one file per table)
    pub data_dir: PathBuf,

    /// Size of a page in bytes (page-based tables)
    pub page_size: usize,

    /// Number of pages each page-based table may keep in memory
    pub page_cache_capacity: usize,

    /// Whether hash indexes declared in table descriptors are maintained
    pub hash_index_enabled: bool,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// When a commit counts as durable
    pub wal_durability: WalDurability,

    /// Max number of submissions flushed together
    pub wal_max_batch_size: usize,

    /// Max time the worker keeps a batch open after reading its first item
    pub wal_max_batch_delay: Duration,

    /// Bound on queued, not yet claimed submissions (backpressure)
    pub wal_queue_capacity: usize,

    /// Retries for a failed WAL write/sync before the batch fails
    pub flush_retry_limit: u32,

    // -------------------------------------------------------------------------
    // Security Configuration
    // -------------------------------------------------------------------------
    /// AES-256-GCM key for encryption at rest (pages and WAL payloads)
    pub encryption_key: Option<[u8; 32]>,
}

/// WAL durability mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalDurability {
    /// fsync once per group-commit batch before releasing its handles
    FullSync,

    /// Release handles once written; fsync is deferred until the log is idle
    Async,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./atlasdb_data"),
            page_size: 4096,
            page_cache_capacity: 1024,
            hash_index_enabled: true,
            wal_durability: WalDurability::FullSync,
            wal_max_batch_size: 256,
            wal_max_batch_delay: Duration::from_micros(500),
            wal_queue_capacity: 4096,
            flush_retry_limit: 3,
            encryption_key: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("page_size", &self.page_size)
            .field("page_cache_capacity", &self.page_cache_capacity)
            .field("hash_index_enabled", &self.hash_index_enabled)
            .field("wal_durability", &self.wal_durability)
            .field("wal_max_batch_size", &self.wal_max_batch_size)
            .field("wal_max_batch_delay", &self.wal_max_batch_delay)
            .field("wal_queue_capacity", &self.wal_queue_capacity)
            .field("flush_retry_limit", &self.flush_retry_limit)
            .field("encrypted", &self.encryption_key.is_some())
            .finish()
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that the values can be used together
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(AtlasError::Config(format!(
                "page_size must be within {}..={}, got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }
        if self.page_cache_capacity < 2 {
            return Err(AtlasError::Config(
                "page_cache_capacity must be at least 2".to_string(),
            ));
        }
        if self.wal_max_batch_size == 0 {
            return Err(AtlasError::Config(
                "wal_max_batch_size must be positive".to_string(),
            ));
        }
        if self.wal_queue_capacity == 0 {
            return Err(AtlasError::Config(
                "wal_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the page size (in bytes)
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the per-table page cache capacity (in pages)
    pub fn page_cache_capacity(mut self, pages: usize) -> Self {
        self.config.page_cache_capacity = pages;
        self
    }

    /// Enable or disable hash index maintenance
    pub fn hash_index_enabled(mut self, enabled: bool) -> Self {
        self.config.hash_index_enabled = enabled;
        self
    }

    /// Set the WAL durability mode
    pub fn wal_durability(mut self, durability: WalDurability) -> Self {
        self.config.wal_durability = durability;
        self
    }

    /// Set the maximum number of submissions per group-commit batch
    pub fn wal_max_batch_size(mut self, size: usize) -> Self {
        self.config.wal_max_batch_size = size;
        self
    }

    /// Set the maximum batch accumulation delay
    pub fn wal_max_batch_delay(mut self, delay: Duration) -> Self {
        self.config.wal_max_batch_delay = delay;
        self
    }

    /// Set the submission queue capacity
    pub fn wal_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.wal_queue_capacity = capacity;
        self
    }

    /// Set the number of retries for transient flush failures
    pub fn flush_retry_limit(mut self, retries: u32) -> Self {
        self.config.flush_retry_limit = retries;
        self
    }

    /// Enable encryption at rest with the given AES-256 key
    pub fn encryption_key(mut self, key: [u8; 32]) -> Self {
        self.config.encryption_key = Some(key);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
