//! File store configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default maximum size of a single block file: 64 MiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Subdirectory of the store dir holding block and index files.
pub(crate) const MSG_DIR: &str = "msgs";

/// Configuration for the file-backed message store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory; must exist. Block files live in a `msgs/`
    /// subdirectory which the store creates on open.
    pub store_dir: PathBuf,

    /// Maximum bytes per block file before rollover.
    pub block_size: u64,
}

impl Default for StoreConfig {
    /// Default block size with an unset store directory; callers must point
    /// `store_dir` at an existing directory before opening a store.
    fn default() -> Self {
        Self {
            store_dir: PathBuf::new(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl StoreConfig {
    /// Creates a config rooted at `store_dir` with the default block size.
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Overrides the block size.
    #[must_use]
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }
}
