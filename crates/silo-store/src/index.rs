//! Block index sidecar for fast recovery.
//!
//! Each block file `<id>.blk` is paired with a sidecar `<id>.idx` that
//! summarizes the block's live records so recovery can skip the full scan.
//!
//! # File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Offset  │  Size  │  Description                     │
//! ├──────────────────────────────────────────────────────┤
//! │  0       │  4     │  Magic bytes: "SLIX"             │
//! │  4       │  1     │  Version: 0x01                   │
//! │  5       │  3     │  Reserved (zero padding)         │
//! │  8       │  8     │  Block id (u64 LE)               │
//! │  16      │  8     │  First sequence                  │
//! │  24      │  8     │  Last sequence                   │
//! │  32      │  8     │  Live message count              │
//! │  40      │  8     │  Live byte count                 │
//! │  48      │  8     │  Block file length at snapshot   │
//! │  56      │  8     │  Entry count (u64 LE)            │
//! │  64      │  20*N  │  Entries (seq u64, off u64, u32) │
//! │  64+20*N │  4     │  CRC32 of all preceding bytes    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Recovery
//!
//! The sidecar is advisory: the block file is the source of truth. A sidecar
//! is adopted only when its magic, version and CRC verify and its recorded
//! file length matches the block file on disk; anything else falls back to a
//! full block scan.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

use silo_types::{BlockId, Sequence};

use crate::{Result, StoreError};

/// Magic bytes identifying a valid block index sidecar.
const MAGIC: &[u8; 4] = b"SLIX";

/// Current sidecar format version.
const VERSION: u8 = 0x01;

/// Reserved bytes for future use.
const RESERVED: [u8; 3] = [0u8; 3];

const MAGIC_SIZE: usize = 4;
const VERSION_SIZE: usize = 1;
const RESERVED_SIZE: usize = 3;
const U64_SIZE: usize = 8;
const ENTRY_SIZE: usize = 8 + 8 + 4; // seq + offset + size
const CRC_SIZE: usize = 4;

/// Header size: magic(4) + version(1) + reserved(3) + six u64 fields + count.
const HEADER_SIZE: usize = MAGIC_SIZE + VERSION_SIZE + RESERVED_SIZE + 7 * U64_SIZE;

/// One live record in a snapshot: where it lives and how big it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SnapshotSlot {
    pub seq: Sequence,
    pub offset: u64,
    pub size: u32,
}

/// Point-in-time summary of one message block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockSnapshot {
    pub block_id: BlockId,
    pub first_seq: Sequence,
    pub last_seq: Sequence,
    pub live_msgs: u64,
    pub live_bytes: u64,
    /// Length of the block file when the snapshot was taken.
    pub file_len: u64,
    /// Live records, ascending by sequence.
    pub slots: Vec<SnapshotSlot>,
}

impl BlockSnapshot {
    /// Persists the snapshot to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        let total_size = HEADER_SIZE + self.slots.len() * ENTRY_SIZE + CRC_SIZE;
        let mut buf: Vec<u8> = Vec::with_capacity(total_size);

        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&[VERSION]);
        buf.extend_from_slice(&RESERVED);
        buf.extend_from_slice(&self.block_id.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.first_seq.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.last_seq.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.live_msgs.to_le_bytes());
        buf.extend_from_slice(&self.live_bytes.to_le_bytes());
        buf.extend_from_slice(&self.file_len.to_le_bytes());
        buf.extend_from_slice(&(self.slots.len() as u64).to_le_bytes());

        for slot in &self.slots {
            buf.extend_from_slice(&slot.seq.as_u64().to_le_bytes());
            buf.extend_from_slice(&slot.offset.to_le_bytes());
            buf.extend_from_slice(&slot.size.to_le_bytes());
        }

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        debug_assert_eq!(buf.len(), total_size, "snapshot buffer size mismatch");

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&buf)?;
        writer.flush()?;

        Ok(())
    }

    /// Loads and validates a snapshot from disk.
    ///
    /// Validates magic bytes, version, size and CRC32 before returning.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;

        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(StoreError::IndexTruncated {
                expected: HEADER_SIZE + CRC_SIZE,
                actual: data.len(),
            });
        }

        let magic: [u8; MAGIC_SIZE] = data[0..MAGIC_SIZE]
            .try_into()
            .expect("slice length equals MAGIC_SIZE after bounds check");
        if &magic != MAGIC {
            return Err(StoreError::InvalidIndexMagic);
        }

        let version = data[MAGIC_SIZE];
        if version != VERSION {
            return Err(StoreError::UnsupportedIndexVersion(version));
        }

        let read_u64 = |at: usize| {
            u64::from_le_bytes(
                data[at..at + U64_SIZE]
                    .try_into()
                    .expect("slice length equals U64_SIZE after bounds check"),
            )
        };

        let fields_start = MAGIC_SIZE + VERSION_SIZE + RESERVED_SIZE;
        let block_id = BlockId::new(read_u64(fields_start));
        let first_seq = Sequence::new(read_u64(fields_start + U64_SIZE));
        let last_seq = Sequence::new(read_u64(fields_start + 2 * U64_SIZE));
        let live_msgs = read_u64(fields_start + 3 * U64_SIZE);
        let live_bytes = read_u64(fields_start + 4 * U64_SIZE);
        let file_len = read_u64(fields_start + 5 * U64_SIZE);
        let count = read_u64(fields_start + 6 * U64_SIZE) as usize;

        let expected_size = HEADER_SIZE + count * ENTRY_SIZE + CRC_SIZE;
        if data.len() < expected_size {
            return Err(StoreError::IndexTruncated {
                expected: expected_size,
                actual: data.len(),
            });
        }

        // Verify CRC32 before trusting any entry data
        let crc_start = HEADER_SIZE + count * ENTRY_SIZE;
        let stored_crc = u32::from_le_bytes(
            data[crc_start..crc_start + CRC_SIZE]
                .try_into()
                .expect("slice length equals CRC_SIZE after bounds check"),
        );
        let computed_crc = crc32fast::hash(&data[0..crc_start]);
        if stored_crc != computed_crc {
            return Err(StoreError::IndexChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        if count as u64 != live_msgs {
            return Err(StoreError::IndexStale("entry count != live message count"));
        }

        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            let at = HEADER_SIZE + i * ENTRY_SIZE;
            let seq = Sequence::new(read_u64(at));
            let offset = read_u64(at + U64_SIZE);
            let size = u32::from_le_bytes(
                data[at + 2 * U64_SIZE..at + ENTRY_SIZE]
                    .try_into()
                    .expect("slice length equals 4 after bounds check"),
            );
            slots.push(SnapshotSlot { seq, offset, size });
        }

        debug_assert_eq!(slots.len(), count, "slot count mismatch");

        Ok(Self {
            block_id,
            first_seq,
            last_seq,
            live_msgs,
            live_bytes,
            file_len,
            slots,
        })
    }
}
