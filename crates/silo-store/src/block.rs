//! One message block: a capped-size record file plus its index sidecar.
//!
//! A block owns `<id>.blk` and `<id>.idx` under the store's `msgs/`
//! directory. Records append to the block in sequence order until the
//! configured size cap is reached, at which point the block seals and a
//! successor takes over. Removal drops a record from the live map without
//! touching the file; erasure additionally overwrites the on-disk bytes in
//! place with a randomized tombstone of identical length.
//!
//! Appends are buffered in memory and flushed once the buffer crosses a
//! threshold, on seal, and on sync. A record never straddles the flush
//! boundary: a slot is either fully on disk or fully in the buffer.
//!
//! File I/O uses positioned reads and writes (`read_at`/`write_at`) so
//! concurrent readers never contend on a shared seek cursor.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use rand::Rng;
use silo_types::{BlockId, Sequence};
use tracing::{debug, warn};

use crate::index::{BlockSnapshot, SnapshotSlot};
use crate::record::Frame;
use crate::{Result, StoreError};

/// Buffered appends flush to disk once the buffer crosses this size.
const FLUSH_THRESHOLD_BYTES: usize = 256 * 1024;

/// Byte location and full framed size of one live record within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordSlot {
    pub offset: u64,
    pub size: u32,
}

/// Returns the path of a block's record file.
pub(crate) fn block_file_path(msg_dir: &Path, id: BlockId) -> PathBuf {
    msg_dir.join(format!("{id}.blk"))
}

/// Returns the path of a block's index sidecar.
pub(crate) fn index_file_path(msg_dir: &Path, id: BlockId) -> PathBuf {
    msg_dir.join(format!("{id}.idx"))
}

/// A single message block and its in-memory live map.
pub(crate) struct MsgBlock {
    id: BlockId,
    blk_path: PathBuf,
    idx_path: PathBuf,
    file: File,
    /// Bytes already written to the block file.
    disk_len: u64,
    /// Encoded appends not yet written to the file; logically the bytes at
    /// `disk_len..disk_len + wbuf.len()`.
    wbuf: Vec<u8>,
    max_size: u64,
    sealed: bool,
    /// First sequence ever written to this block (or reserved for it).
    first_seq: Sequence,
    /// Last sequence ever written; `first_seq - 1` while empty.
    last_seq: Sequence,
    /// Live records only; removed and erased sequences are absent.
    slots: BTreeMap<Sequence, RecordSlot>,
    live_bytes: u64,
}

impl MsgBlock {
    /// Creates a fresh, empty block reserving `first_seq` for its first record.
    pub fn create(
        msg_dir: &Path,
        id: BlockId,
        first_seq: Sequence,
        max_size: u64,
    ) -> Result<Self> {
        let blk_path = block_file_path(msg_dir, id);
        let idx_path = index_file_path(msg_dir, id);

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&blk_path)?;

        let block = Self {
            id,
            blk_path,
            idx_path,
            file,
            disk_len: 0,
            wbuf: Vec::new(),
            max_size,
            sealed: false,
            first_seq,
            last_seq: first_seq.prev(),
            slots: BTreeMap::new(),
            live_bytes: 0,
        };

        // An empty sidecar pins the block's sequence range so a purge (or an
        // empty tail block) survives a restart without the store resetting
        // its sequence counter.
        block.persist_snapshot()?;

        Ok(block)
    }

    /// Opens an existing block file, adopting its index sidecar when it
    /// passes validation and rebuilding from a full scan otherwise.
    pub fn recover(msg_dir: &Path, id: BlockId, max_size: u64) -> Result<Self> {
        let blk_path = block_file_path(msg_dir, id);
        let idx_path = index_file_path(msg_dir, id);

        let file = OpenOptions::new().read(true).write(true).open(&blk_path)?;
        let file_len = file.metadata()?.len();

        match BlockSnapshot::load(&idx_path) {
            Ok(snap) if snapshot_matches(&snap, id, file_len) => {
                debug!(block = %id, msgs = snap.live_msgs, "adopted block index sidecar");
                let mut slots = BTreeMap::new();
                for slot in &snap.slots {
                    slots.insert(
                        slot.seq,
                        RecordSlot {
                            offset: slot.offset,
                            size: slot.size,
                        },
                    );
                }
                return Ok(Self {
                    id,
                    blk_path,
                    idx_path,
                    file,
                    disk_len: file_len,
                    wbuf: Vec::new(),
                    max_size,
                    sealed: false,
                    first_seq: snap.first_seq,
                    last_seq: snap.last_seq,
                    slots,
                    live_bytes: snap.live_bytes,
                });
            }
            Ok(_) => {
                warn!(block = %id, "block index sidecar is stale, rescanning block file");
            }
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!(block = %id, "no block index sidecar, scanning block file");
            }
            Err(e) => {
                warn!(block = %id, error = %e, "invalid block index sidecar, rescanning");
            }
        }

        Self::recover_by_scan(id, blk_path, idx_path, file, max_size)
    }

    /// Rebuilds the live map by walking every record frame in the file.
    ///
    /// Frames that fail their checksum are skipped, not indexed; tombstones
    /// are skipped; a torn trailing frame truncates the file back to the
    /// last good record boundary.
    fn recover_by_scan(
        id: BlockId,
        blk_path: PathBuf,
        idx_path: PathBuf,
        file: File,
        max_size: u64,
    ) -> Result<Self> {
        let data: Bytes = fs::read(&blk_path)?.into();

        let mut slots = BTreeMap::new();
        let mut first_seq = Sequence::ZERO;
        let mut last_seq = Sequence::ZERO;
        let mut live_bytes = 0u64;
        let mut corrupt = 0usize;
        let mut pos = 0usize;
        let mut good_end = 0usize;

        while pos < data.len() {
            match Frame::from_bytes(&data.slice(pos..)) {
                Ok((frame, consumed)) => {
                    if !frame.is_tombstone() {
                        let seq = Sequence::new(frame.seq());
                        slots.insert(
                            seq,
                            RecordSlot {
                                offset: pos as u64,
                                size: consumed as u32,
                            },
                        );
                        live_bytes += consumed as u64;
                        if first_seq == Sequence::ZERO || seq < first_seq {
                            first_seq = seq;
                        }
                        if seq > last_seq {
                            last_seq = seq;
                        }
                    }
                    pos += consumed;
                    good_end = pos;
                }
                Err(StoreError::CorruptRecord) => {
                    // The frame is damaged but its extent may still be
                    // walkable; skip it if the length prefix stays in bounds.
                    let Some(end) = frame_extent(&data, pos) else {
                        truncate_torn_tail(&file, &blk_path, good_end, data.len())?;
                        break;
                    };
                    corrupt += 1;
                    pos = end;
                    good_end = pos;
                }
                Err(StoreError::UnexpectedEof) => {
                    truncate_torn_tail(&file, &blk_path, good_end, data.len())?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if corrupt > 0 {
            warn!(
                block = %id,
                corrupt,
                "skipped unverifiable records during block scan"
            );
        }

        Ok(Self {
            id,
            blk_path,
            idx_path,
            file,
            disk_len: good_end as u64,
            wbuf: Vec::new(),
            max_size,
            sealed: false,
            first_seq,
            last_seq,
            slots,
            live_bytes,
        })
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn first_seq(&self) -> Sequence {
        self.first_seq
    }

    pub fn last_seq(&self) -> Sequence {
        self.last_seq
    }

    /// Number of live records.
    pub fn live_msgs(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Total framed bytes of live records.
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Logical size of the block: persisted bytes plus buffered appends.
    pub fn size(&self) -> u64 {
        self.disk_len + self.wbuf.len() as u64
    }

    pub fn is_live_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// True when `seq` falls in the range of sequences ever written here.
    pub fn covers(&self, seq: Sequence) -> bool {
        self.first_seq <= self.last_seq && self.first_seq <= seq && seq <= self.last_seq
    }

    /// Smallest live sequence in this block.
    pub fn min_live_seq(&self) -> Option<Sequence> {
        self.slots.keys().next().copied()
    }

    /// Used by recovery to pin the range of a block scanned as empty.
    pub fn reset_range(&mut self, first_seq: Sequence) {
        debug_assert!(self.slots.is_empty(), "range reset on non-empty block");
        self.first_seq = first_seq;
        self.last_seq = first_seq.prev();
    }

    /// Appends a record, returning its block-relative offset, or `None` when
    /// the block has no room for it (sealed or would exceed the size cap).
    ///
    /// A record larger than the cap is still accepted by a block nothing has
    /// been written to, so oversized messages remain storable.
    pub fn try_append(
        &mut self,
        seq: Sequence,
        timestamp_ns: i64,
        subject: &str,
        payload: &[u8],
    ) -> Result<Option<u64>> {
        if self.sealed {
            return Ok(None);
        }

        let frame = Frame::new(
            seq.as_u64(),
            timestamp_ns,
            Bytes::copy_from_slice(subject.as_bytes()),
            Bytes::copy_from_slice(payload),
        );
        let rec_len = frame.encoded_len() as u64;

        let offset = self.size();
        if offset > 0 && offset + rec_len > self.max_size {
            return Ok(None);
        }

        // Drain the buffer before registering the record: a flush failure
        // here leaves the block exactly as it was.
        if self.wbuf.len() >= FLUSH_THRESHOLD_BYTES {
            self.flush()?;
        }

        self.wbuf.extend_from_slice(&frame.to_bytes());
        self.slots.insert(
            seq,
            RecordSlot {
                offset,
                size: rec_len as u32,
            },
        );
        self.live_bytes += rec_len;
        self.last_seq = seq;

        Ok(Some(offset))
    }

    /// Reads and verifies the live record for `seq`.
    pub fn read(&self, seq: Sequence) -> Result<Frame> {
        let slot = *self.slots.get(&seq).ok_or(StoreError::NotFound(seq))?;
        let raw = self.read_raw(slot)?;
        let (frame, _) = Frame::from_bytes(&raw)?;

        if frame.seq() != seq.as_u64() {
            return Err(StoreError::CorruptRecord);
        }

        Ok(frame)
    }

    /// Drops `seq` from the live map. The record stays in the file.
    ///
    /// Returns the framed size of the record, or `None` if it was not live.
    pub fn remove(&mut self, seq: Sequence) -> Option<u32> {
        let slot = self.slots.remove(&seq)?;
        self.live_bytes -= slot.size as u64;
        Some(slot.size)
    }

    /// Removes `seq` and overwrites its on-disk bytes with a randomized
    /// tombstone of identical length (seq 0, timestamp 0, random subject and
    /// payload, recomputed checksum), then makes the overwrite durable.
    pub fn erase(&mut self, seq: Sequence, rng: &mut impl Rng) -> Result<Option<u32>> {
        let Some(slot) = self.slots.get(&seq).copied() else {
            return Ok(None);
        };

        // Recover the subject/payload split from the raw header so the
        // tombstone reproduces the exact record length. The checksum is not
        // consulted: even a damaged record gets shredded.
        let raw = self.read_raw(slot)?;
        let (subject_len, payload_len) = tombstone_dims(&raw, slot.size)?;

        let tombstone = Frame::tombstone(subject_len, payload_len, rng);
        let buf = tombstone.to_bytes();
        debug_assert_eq!(buf.len(), slot.size as usize, "tombstone length drift");

        if slot.offset >= self.disk_len {
            let start = (slot.offset - self.disk_len) as usize;
            self.wbuf[start..start + buf.len()].copy_from_slice(&buf);
        } else {
            self.file.write_all_at(&buf, slot.offset)?;
            self.file.sync_data()?;
        }

        self.slots.remove(&seq);
        self.live_bytes -= slot.size as u64;

        Ok(Some(slot.size))
    }

    /// Reads back and checksum-verifies every live record, returning the
    /// sequences that fail. Diagnostic only; nothing is mutated.
    pub fn verify(&self) -> Vec<Sequence> {
        let mut bad = Vec::new();

        for (&seq, &slot) in &self.slots {
            let ok = match self.read_raw(slot) {
                Ok(raw) => matches!(
                    Frame::from_bytes(&raw),
                    Ok((ref frame, _)) if frame.seq() == seq.as_u64()
                ),
                Err(_) => false,
            };
            if !ok {
                bad.push(seq);
            }
        }

        bad
    }

    /// Writes buffered appends to the block file. No fsync.
    pub fn flush(&mut self) -> Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }

        self.file.write_all_at(&self.wbuf, self.disk_len)?;
        self.disk_len += self.wbuf.len() as u64;
        self.wbuf.clear();

        Ok(())
    }

    /// Flushes and fsyncs the block file.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Marks the block closed to further appends and flushes it.
    pub fn seal(&mut self) -> Result<()> {
        self.sealed = true;
        self.flush()
    }

    /// Writes the index sidecar. Callers flush first; the snapshot describes
    /// the on-disk file, not the append buffer.
    pub fn persist_snapshot(&self) -> Result<()> {
        debug_assert!(self.wbuf.is_empty(), "snapshot with unflushed appends");

        let slots = self
            .slots
            .iter()
            .map(|(&seq, &slot)| SnapshotSlot {
                seq,
                offset: slot.offset,
                size: slot.size,
            })
            .collect();

        let snap = BlockSnapshot {
            block_id: self.id,
            first_seq: self.first_seq,
            last_seq: self.last_seq,
            live_msgs: self.live_msgs(),
            live_bytes: self.live_bytes,
            file_len: self.disk_len,
            slots,
        };

        snap.save(&self.idx_path)
    }

    /// Unlinks the block file and its sidecar.
    pub fn delete_files(&self) -> Result<()> {
        remove_file_if_exists(&self.blk_path)?;
        remove_file_if_exists(&self.idx_path)?;
        Ok(())
    }

    /// Path of the block's record file.
    #[cfg(test)]
    pub fn file_path(&self) -> &Path {
        &self.blk_path
    }

    /// Slot for a live sequence.
    #[cfg(test)]
    pub fn slot(&self, seq: Sequence) -> Option<RecordSlot> {
        self.slots.get(&seq).copied()
    }

    fn read_raw(&self, slot: RecordSlot) -> Result<Bytes> {
        if slot.offset >= self.disk_len {
            let start = (slot.offset - self.disk_len) as usize;
            let end = start + slot.size as usize;
            if end > self.wbuf.len() {
                return Err(StoreError::UnexpectedEof);
            }
            Ok(Bytes::copy_from_slice(&self.wbuf[start..end]))
        } else {
            let mut buf = vec![0u8; slot.size as usize];
            self.file.read_exact_at(&mut buf, slot.offset)?;
            Ok(buf.into())
        }
    }
}

/// Validates an adopted sidecar against the block file next to it.
fn snapshot_matches(snap: &BlockSnapshot, id: BlockId, file_len: u64) -> bool {
    if snap.block_id != id || snap.file_len != file_len {
        return false;
    }

    let mut prev_seq = Sequence::ZERO;
    let mut total = 0u64;
    for slot in &snap.slots {
        if slot.seq <= prev_seq
            || slot.seq < snap.first_seq
            || slot.seq > snap.last_seq
            || slot.offset + slot.size as u64 > file_len
        {
            return false;
        }
        prev_seq = slot.seq;
        total += slot.size as u64;
    }

    total == snap.live_bytes
}

/// End position of the frame starting at `pos`, if its length prefix keeps
/// it inside `data`.
fn frame_extent(data: &Bytes, pos: usize) -> Option<usize> {
    if pos + 4 > data.len() {
        return None;
    }
    let total_len =
        u32::from_le_bytes(data[pos..pos + 4].try_into().expect("4-byte slice")) as usize;
    let end = pos + 4 + total_len;
    (end <= data.len()).then_some(end)
}

/// Truncates a block file whose trailing record was torn by a crash.
fn truncate_torn_tail(file: &File, path: &Path, good_end: usize, file_len: usize) -> Result<()> {
    warn!(
        path = %path.display(),
        torn_bytes = file_len - good_end,
        "truncating partial record at end of block file"
    );
    file.set_len(good_end as u64)?;
    Ok(())
}

/// Subject and payload lengths from a raw frame, for tombstone construction.
fn tombstone_dims(raw: &Bytes, slot_size: u32) -> Result<(usize, usize)> {
    if raw.len() < 22 || raw.len() != slot_size as usize {
        return Err(StoreError::CorruptRecord);
    }

    let total_len = u32::from_le_bytes(raw[0..4].try_into().expect("4-byte slice")) as usize;
    let subject_len = u16::from_le_bytes(raw[20..22].try_into().expect("2-byte slice")) as usize;

    // 18 fixed body bytes + checksum(8) frame the subject and payload.
    if 4 + total_len != slot_size as usize || 18 + subject_len + 8 > total_len {
        return Err(StoreError::CorruptRecord);
    }
    let payload_len = total_len - 18 - subject_len - 8;

    Ok((subject_len, payload_len))
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
