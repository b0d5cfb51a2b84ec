//! silo-store: Persistent append-only message log for Silo
//!
//! This crate implements the durable message store: a monotonically
//! numbered sequence of opaque messages, each tagged with a subject and an
//! origin timestamp, stored in fixed-size block files with per-record
//! checksums. It serves random-access lookup by sequence, enforces
//! count/bytes/age retention, supports selective removal and secure
//! erasure, and rebuilds its full in-memory index from disk on restart,
//! tolerating partial writes and bit rot.
//!
//! # Record Format
//!
//! Each message is stored as one record:
//! ```text
//! [total_len:u32][seq:u64][timestamp_ns:i64][subject_len:u16][subject][payload][xxh3:u64]
//!      4B           8B          8B               2B             N B      M B       8B
//! ```
//!
//! - **`total_len`**: record length excluding this field
//! - **seq**: the assigned sequence; 0 marks an erased tombstone
//! - **xxh3**: seeded 64-bit checksum of the record body
//!   (`seq || timestamp || subject_len || subject || payload`)
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//!   msgs/
//!     1.blk   # block files: concatenated records, capped at block_size
//!     1.idx   # index sidecar: live-record summary for fast recovery
//!     2.blk
//!     2.idx
//!     ...
//! ```
//!
//! # Example
//!
//! ```ignore
//! use silo_store::{FileStore, StoreConfig};
//! use silo_types::StreamConfig;
//!
//! let store = FileStore::open(
//!     StoreConfig::new("/data/silo"),
//!     StreamConfig::file("orders"),
//! )?;
//!
//! let seq = store.append("orders.created", b"order 7421")?;
//! let msg = store.lookup(seq)?;
//! assert_eq!(msg.payload.as_ref(), b"order 7421");
//!
//! store.close()?;
//! ```

// Modules
mod block;
mod config;
mod error;
mod expiry;
mod index;
mod record;
mod registry;
mod store;

// Re-exports
pub use config::{StoreConfig, DEFAULT_BLOCK_SIZE};
pub use error::{Result, StoreError};
pub use record::{message_size, MAX_SUBJECT_BYTES};
pub use store::{FileStore, Message};

#[cfg(test)]
mod tests;
