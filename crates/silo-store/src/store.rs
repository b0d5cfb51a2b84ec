//! The store controller: public API, retention enforcement, recovery.
//!
//! [`FileStore`] is the entry point of the crate. All public operations are
//! safe to call from multiple threads: a single reader-writer lock guards
//! the block registry and the aggregate counters. Appends, removals, purges
//! and retention take it exclusive; lookups, stats and verification take it
//! shared. Sequence assignment is total and monotonic under the exclusive
//! lock, and stored timestamps are forced strictly increasing by advancing
//! each new timestamp past the previous one.
//!
//! Appends are buffered (see the block module); a crash may lose the
//! unflushed tail but never corrupts earlier records, and recovery truncates
//! any partial trailing record. `close` (and `sync`) flush, fsync and
//! persist index sidecars, so a closed store always reopens to the state it
//! closed with.

use std::fs;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use silo_types::{Sequence, StorageKind, StoreStats, StreamConfig};
use tracing::{info, warn};

use crate::config::{StoreConfig, DEFAULT_BLOCK_SIZE, MSG_DIR};
use crate::expiry::ExpiryHandle;
use crate::record::{message_size, MAX_SUBJECT_BYTES};
use crate::registry::BlockRegistry;
use crate::{Result, StoreError};

/// One message read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The subject the message was stored under.
    pub subject: String,
    /// The opaque message body.
    pub payload: Bytes,
    /// Origin timestamp in nanoseconds since the unix epoch. Strictly
    /// increasing across successively stored messages.
    pub timestamp_ns: i64,
}

/// A persistent, append-only message log backed by block files.
pub struct FileStore {
    inner: Arc<RwLock<StoreInner>>,
    expiry: Mutex<Option<ExpiryHandle>>,
}

impl FileStore {
    /// Opens a file store, recovering any existing state under
    /// `cfg.store_dir` or starting fresh at sequence 1.
    ///
    /// # Errors
    ///
    /// - [`StoreError::EmptyStreamName`] if the stream has no name
    /// - [`StoreError::UnsupportedStorage`] unless storage is `File`
    /// - [`StoreError::StoreDirMissing`] if the store directory does not exist
    pub fn open(cfg: StoreConfig, stream: StreamConfig) -> Result<Self> {
        if stream.name.is_empty() {
            return Err(StoreError::EmptyStreamName);
        }
        if stream.storage != StorageKind::File {
            return Err(StoreError::UnsupportedStorage(stream.storage));
        }
        if !cfg.store_dir.is_dir() {
            return Err(StoreError::StoreDirMissing(cfg.store_dir.clone()));
        }

        let msg_dir = cfg.store_dir.join(MSG_DIR);
        fs::create_dir_all(&msg_dir)?;

        let block_size = if cfg.block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            cfg.block_size
        };

        let registry = match BlockRegistry::recover(&msg_dir, block_size)? {
            Some(registry) => registry,
            None => BlockRegistry::create(&msg_dir, block_size, Sequence::new(1))?,
        };

        let next_seq = registry.last_seq().next();
        let mut msgs = 0u64;
        let mut bytes = 0u64;
        for block in registry.blocks() {
            msgs += block.live_msgs();
            bytes += block.live_bytes();
        }
        let first_seq = registry.first_live_seq().unwrap_or(next_seq);

        let age_enabled = stream.max_age > Duration::ZERO;
        let mut inner = StoreInner {
            stream,
            registry,
            next_seq,
            last_ts: 0,
            msgs,
            bytes,
            first_seq,
            expiry_armed: false,
            closed: false,
        };

        // Replay retention on the recovered state: a store reopened after
        // its messages aged out must come up empty.
        inner.enforce_limits();
        if age_enabled {
            inner.expire_aged(now_ns());
            inner.expiry_armed = true;
        }

        info!(
            stream = %inner.stream.name,
            msgs = inner.msgs,
            bytes = inner.bytes,
            blocks = inner.registry.block_count(),
            "message store opened"
        );

        let inner = Arc::new(RwLock::new(inner));
        let expiry = age_enabled.then(|| ExpiryHandle::spawn(Arc::clone(&inner)));

        Ok(Self {
            inner,
            expiry: Mutex::new(expiry),
        })
    }

    /// Stores a message, returning its assigned sequence.
    ///
    /// Retention limits are enforced before this returns, so a configured
    /// `max_msgs`/`max_bytes` bound holds at every return.
    pub fn append(&self, subject: &str, payload: &[u8]) -> Result<Sequence> {
        if subject.len() > MAX_SUBJECT_BYTES {
            return Err(StoreError::SubjectTooLong(subject.len()));
        }

        let mut rearm = false;
        let seq = {
            let mut inner = self.write();
            if inner.closed {
                return Err(StoreError::Closed);
            }

            let ts = now_ns().max(inner.last_ts + 1);
            let seq = inner.next_seq;

            inner.registry.append(seq, ts, subject, payload)?;
            inner.next_seq = seq.next();
            inner.last_ts = ts;
            inner.msgs += 1;
            inner.bytes += message_size(subject, payload);

            inner.enforce_limits();

            if inner.age_enabled() && !inner.expiry_armed {
                inner.expiry_armed = true;
                rearm = true;
            }

            seq
        };

        if rearm {
            if let Some(handle) = self.expiry.lock().expect("expiry lock poisoned").as_ref() {
                handle.rearm();
            }
        }

        Ok(seq)
    }

    /// Looks up a live message by sequence.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if `seq` is not live
    /// - [`StoreError::CorruptRecord`] if the stored copy fails its checksum
    pub fn lookup(&self, seq: Sequence) -> Result<Message> {
        let inner = self.read();
        let block = inner.registry.locate(seq).ok_or(StoreError::NotFound(seq))?;
        let frame = block.read(seq)?;

        let subject =
            String::from_utf8(frame.subject().to_vec()).map_err(|_| StoreError::CorruptRecord)?;

        Ok(Message {
            subject,
            payload: frame.payload().clone(),
            timestamp_ns: frame.timestamp_ns(),
        })
    }

    /// Removes a message from the live set. The record stays in its block
    /// file until the block is reclaimed.
    ///
    /// Returns `true` iff `seq` was live.
    pub fn remove(&self, seq: Sequence) -> Result<bool> {
        let mut inner = self.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.remove_seq(seq, false)
    }

    /// Removes a message and overwrites its on-disk bytes with a randomized
    /// tombstone so the subject and payload cannot be read back.
    ///
    /// Returns `true` iff `seq` was live.
    pub fn erase(&self, seq: Sequence) -> Result<bool> {
        let mut inner = self.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.remove_seq(seq, true)
    }

    /// Drops every live message and all block files, leaving one fresh empty
    /// block. Sequence numbering continues where it left off.
    ///
    /// Returns the number of messages purged.
    pub fn purge(&self) -> Result<u64> {
        let mut inner = self.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }

        let purged = inner.msgs;
        let first_seq = inner.next_seq;
        inner.registry.purge(first_seq)?;
        inner.msgs = 0;
        inner.bytes = 0;
        inner.first_seq = first_seq;

        info!(stream = %inner.stream.name, purged, "store purged");

        Ok(purged)
    }

    /// Aggregate counters. O(1).
    pub fn stats(&self) -> StoreStats {
        let inner = self.read();
        StoreStats {
            msgs: inner.msgs,
            bytes: inner.bytes,
            first_seq: inner.first_seq,
            last_seq: inner.next_seq.prev(),
        }
    }

    /// Number of block files currently backing the store.
    pub fn block_count(&self) -> usize {
        self.read().registry.block_count()
    }

    /// Reads back and checksum-verifies every live record, returning the
    /// sequences whose stored bytes no longer verify. Diagnostic only.
    pub fn verify(&self) -> Vec<Sequence> {
        let inner = self.read();
        let mut bad = Vec::new();
        for block in inner.registry.blocks() {
            bad.extend(block.verify());
        }
        bad
    }

    /// Flushes buffered appends, fsyncs every block and persists index
    /// sidecars. An explicit durability point.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.sync_all()
    }

    /// Flushes and fsyncs all state, persists index sidecars, and stops the
    /// expiry worker. Idempotent; also runs on drop.
    pub fn close(&self) -> Result<()> {
        let newly_closed = {
            let mut inner = self.write();
            if inner.closed {
                false
            } else {
                inner.sync_all()?;
                inner.closed = true;
                true
            }
        };

        if let Some(mut handle) = self.expiry.lock().expect("expiry lock poisoned").take() {
            handle.shutdown();
        }

        if newly_closed {
            info!("message store closed");
        }

        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().expect("store lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().expect("store lock poisoned")
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error closing store on drop");
        }
    }
}

#[cfg(test)]
impl FileStore {
    /// Path, offset and size of a live record, for raw-file inspection.
    pub(crate) fn raw_slot(&self, seq: Sequence) -> Option<(std::path::PathBuf, u64, u32)> {
        let inner = self.read();
        let block = inner.registry.locate(seq)?;
        let slot = block.slot(seq)?;
        Some((block.file_path().to_path_buf(), slot.offset, slot.size))
    }

    /// Path of the active block's record file.
    pub(crate) fn active_block_path(&self) -> std::path::PathBuf {
        self.read().registry.active().file_path().to_path_buf()
    }
}

/// Shared store state guarded by the controller lock.
pub(crate) struct StoreInner {
    stream: StreamConfig,
    registry: BlockRegistry,
    next_seq: Sequence,
    /// Timestamp of the most recently stored message; new timestamps are
    /// forced past it so callers never observe equal timestamps.
    last_ts: i64,
    msgs: u64,
    bytes: u64,
    /// Smallest live sequence; `next_seq` when the store is empty.
    first_seq: Sequence,
    /// Whether the expiry worker has a deadline scheduled.
    expiry_armed: bool,
    closed: bool,
}

impl StoreInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn disarm_expiry(&mut self) {
        self.expiry_armed = false;
    }

    fn age_enabled(&self) -> bool {
        self.stream.max_age > Duration::ZERO
    }

    fn max_age_ns(&self) -> i64 {
        i64::try_from(self.stream.max_age.as_nanos()).unwrap_or(i64::MAX)
    }

    fn remove_seq(&mut self, seq: Sequence, erase: bool) -> Result<bool> {
        let removed = if erase {
            let mut rng = rand::thread_rng();
            self.registry.erase(seq, &mut rng)?
        } else {
            self.registry.remove(seq)?
        };

        let Some(size) = removed else {
            return Ok(false);
        };

        self.msgs -= 1;
        self.bytes -= size as u64;
        if seq == self.first_seq {
            self.first_seq = self.registry.first_live_seq().unwrap_or(self.next_seq);
        }

        Ok(true)
    }

    /// Enforces the count and byte limits by removing oldest messages.
    ///
    /// A removal failing on I/O leaves the store over limit; the failure is
    /// reported and the next operation retries.
    fn enforce_limits(&mut self) {
        let max_msgs = self.stream.max_msgs;
        while max_msgs > 0 && self.msgs > max_msgs {
            if !self.remove_oldest() {
                break;
            }
        }

        let max_bytes = self.stream.max_bytes;
        while max_bytes > 0 && self.bytes > max_bytes {
            if !self.remove_oldest() {
                break;
            }
        }
    }

    fn remove_oldest(&mut self) -> bool {
        let seq = self.first_seq;
        match self.remove_seq(seq, false) {
            Ok(true) => true,
            Ok(false) => {
                warn!(seq = %seq, "retention found no live message at first sequence");
                false
            }
            Err(e) => {
                warn!(seq = %seq, error = %e, "retention failed to remove message");
                false
            }
        }
    }

    /// Removes every live message older than `max_age`, returning the
    /// wall-clock deadline (ns) when the next-oldest message expires, or
    /// `None` when no live messages remain.
    pub(crate) fn expire_aged(&mut self, now: i64) -> Option<i64> {
        let max_age = self.max_age_ns();
        if max_age <= 0 {
            return None;
        }

        loop {
            let seq = self.registry.first_live_seq()?;
            let ts = match self.registry.locate(seq).map(|b| b.read(seq)) {
                Some(Ok(frame)) => frame.timestamp_ns(),
                _ => {
                    warn!(seq = %seq, "could not read oldest message during age expiry");
                    return None;
                }
            };

            if ts > now.saturating_sub(max_age) {
                return Some(ts.saturating_add(max_age));
            }

            match self.remove_seq(seq, false) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(seq = %seq, "failed to expire aged message");
                    return None;
                }
            }
        }
    }

    fn sync_all(&mut self) -> Result<()> {
        for block in self.registry.blocks_mut() {
            block.sync()?;
            block.persist_snapshot()?;
        }
        Ok(())
    }
}

/// Current wall-clock time in nanoseconds since the unix epoch.
pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as i64
}
