//! Error types for store operations.

use std::io;
use std::path::PathBuf;

use silo_types::{Sequence, StorageKind};

/// Result alias used throughout the store.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Stream configuration carried an empty name.
    #[error("stream name must not be empty")]
    EmptyStreamName,

    /// The file store only handles file-backed streams.
    #[error("unsupported storage kind: {0:?}")]
    UnsupportedStorage(StorageKind),

    /// The configured store directory does not exist.
    #[error("store directory does not exist: {}", .0.display())]
    StoreDirMissing(PathBuf),

    /// Subject exceeded the 255-byte limit.
    #[error("subject too long: {0} bytes (max 255)")]
    SubjectTooLong(usize),

    /// Filesystem I/O error.
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),

    /// The data was truncated (not enough bytes for a full record).
    #[error("unexpected end of file")]
    UnexpectedEof,

    /// Checksum or framing mismatch - the record data is corrupted.
    #[error("corrupted record: checksum mismatch")]
    CorruptRecord,

    /// The sequence is not live: never stored, removed, erased, or expired.
    #[error("message not found: sequence {0}")]
    NotFound(Sequence),

    /// Operation attempted on a closed store.
    #[error("store is closed")]
    Closed,

    /// Index sidecar has invalid magic bytes.
    #[error("invalid block index magic bytes")]
    InvalidIndexMagic,

    /// Index sidecar has an unsupported version.
    #[error("unsupported block index version: {0}")]
    UnsupportedIndexVersion(u8),

    /// Index sidecar checksum mismatch.
    #[error("block index checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    IndexChecksumMismatch { expected: u32, actual: u32 },

    /// Index sidecar is truncated.
    #[error("truncated block index: expected {expected} bytes, got {actual}")]
    IndexTruncated { expected: usize, actual: usize },

    /// Index sidecar does not describe the block file next to it.
    #[error("block index does not match block file: {0}")]
    IndexStale(&'static str),
}
