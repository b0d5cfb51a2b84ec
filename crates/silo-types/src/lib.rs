//! # silo-types: Core types for Silo
//!
//! This crate contains shared types used across the Silo message log:
//! - Entity IDs ([`Sequence`], [`BlockId`])
//! - Storage backend selection ([`StorageKind`])
//! - Stream configuration ([`StreamConfig`])
//! - Aggregate counters ([`StoreStats`])

use std::{
    fmt::Display,
    ops::{Add, AddAssign, Sub},
    time::Duration,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs - All Copy (cheap 8-byte values)
// ============================================================================

/// Monotonic identifier assigned to a message at store time.
///
/// Sequences are one-indexed: the first message stored gets sequence 1.
/// A sequence is never reused and never reset, not even by a purge.
/// Sequence 0 is reserved for erased-record tombstones on disk and is
/// never assigned to a live message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Sequence(u64);

impl Sequence {
    /// The tombstone sequence; never assigned to a live message.
    pub const ZERO: Sequence = Sequence(0);

    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next sequence.
    #[must_use]
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the previous sequence, saturating at zero.
    #[must_use]
    pub fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Sequence {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Sequence {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Sequence {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Sequence> for u64 {
    fn from(seq: Sequence) -> Self {
        seq.0
    }
}

/// Unique identifier for a message block file.
///
/// Block IDs are monotonic and start at 1; the ID doubles as the block's
/// filename stem (`<id>.blk` / `<id>.idx`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(u64);

impl BlockId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next block ID.
    #[must_use]
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<BlockId> for u64 {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

// ============================================================================
// Stream Name - Clone (contains String, but rarely cloned)
// ============================================================================

/// Human-readable name for a stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamName(String);

impl StreamName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StreamName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for StreamName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<StreamName> for String {
    fn from(value: StreamName) -> Self {
        value.0
    }
}

// ============================================================================
// Storage Kind - Copy (simple enum, no heap data)
// ============================================================================

/// Storage backend for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    /// Durable file-backed storage.
    File,
    /// Volatile in-memory storage (handled by a different store).
    Memory,
}

// ============================================================================
// Stream Configuration
// ============================================================================

/// Configuration of a single message stream.
///
/// Retention limits use zero to mean "disabled": a `max_msgs` of 0 places
/// no bound on message count, a `max_bytes` of 0 no bound on total size,
/// and a `max_age` of zero duration disables age-based expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name; must be non-empty.
    pub name: StreamName,
    /// Storage backend; the file store only accepts [`StorageKind::File`].
    pub storage: StorageKind,
    /// Maximum number of live messages retained (0 = unlimited).
    pub max_msgs: u64,
    /// Maximum total live bytes retained (0 = unlimited).
    pub max_bytes: u64,
    /// Maximum age of a live message (zero = unlimited).
    pub max_age: Duration,
}

impl StreamConfig {
    /// Creates a file-backed stream config with no retention limits.
    pub fn file(name: impl Into<StreamName>) -> Self {
        Self {
            name: name.into(),
            storage: StorageKind::File,
            max_msgs: 0,
            max_bytes: 0,
            max_age: Duration::ZERO,
        }
    }
}

// ============================================================================
// Aggregate Stats
// ============================================================================

/// Aggregate counters for a message store.
///
/// Maintained incrementally by the store so reads are O(1). `first_seq` is
/// the smallest live sequence, or `last_seq + 1` when the store is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of live messages.
    pub msgs: u64,
    /// Total size in bytes of live messages, counting full record framing.
    pub bytes: u64,
    /// Smallest live sequence (`last_seq + 1` when empty).
    pub first_seq: Sequence,
    /// Largest sequence ever assigned.
    pub last_seq: Sequence,
}
