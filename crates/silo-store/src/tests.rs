//! Unit tests for silo-store
//!
//! Tests for the record codec, the block index sidecar, and the file store
//! end to end: retention, recovery, erasure and bit-rot detection.

use bytes::Bytes;

use crate::record::Frame;
use crate::{message_size, StoreError};

// ============================================================================
// Record Frame Tests
// ============================================================================

#[test]
fn frame_to_bytes_produces_correct_format() {
    let frame = Frame::new(42, 1_700_000_000_000_000_000, Bytes::from("foo"), Bytes::from("hello"));
    let bytes = frame.to_bytes();

    // Total: 4 (len) + 8 (seq) + 8 (ts) + 2 (subject_len) + 3 + 5 + 8 (xxh3) = 38
    assert_eq!(bytes.len(), 38);
    assert_eq!(bytes.len() as u64, message_size("foo", b"hello"));

    // Length prefix excludes itself
    let total_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    assert_eq!(total_len, 34);

    let seq = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
    assert_eq!(seq, 42);

    let ts = i64::from_le_bytes(bytes[12..20].try_into().unwrap());
    assert_eq!(ts, 1_700_000_000_000_000_000);

    let subject_len = u16::from_le_bytes(bytes[20..22].try_into().unwrap());
    assert_eq!(subject_len, 3);

    assert_eq!(&bytes[22..25], b"foo");
    assert_eq!(&bytes[25..30], b"hello");
}

#[test]
fn frame_roundtrip_preserves_data() {
    let original = Frame::new(123, 456, Bytes::from("orders"), Bytes::from("test payload"));
    let bytes: Bytes = original.to_bytes().into();

    let (parsed, consumed) = Frame::from_bytes(&bytes).unwrap();

    assert_eq!(parsed.seq(), 123);
    assert_eq!(parsed.timestamp_ns(), 456);
    assert_eq!(parsed.subject().as_ref(), b"orders");
    assert_eq!(parsed.payload().as_ref(), b"test payload");
    assert_eq!(consumed, bytes.len());
    assert!(!parsed.is_tombstone());
}

#[test]
fn frame_from_bytes_detects_corruption() {
    let frame = Frame::new(1, 2, Bytes::from("foo"), Bytes::from("data"));
    let mut bytes: Vec<u8> = frame.to_bytes();

    // Corrupt one byte in the payload
    bytes[26] ^= 0xFF;

    let result = Frame::from_bytes(&Bytes::from(bytes));
    assert!(matches!(result, Err(StoreError::CorruptRecord)));
}

#[test]
fn frame_from_bytes_handles_truncated_input() {
    let frame = Frame::new(1, 2, Bytes::from("foo"), Bytes::from("data"));
    let bytes = frame.to_bytes();

    // Every strict prefix is truncated input
    let short: Bytes = bytes[..bytes.len() - 1].to_vec().into();
    assert!(matches!(
        Frame::from_bytes(&short),
        Err(StoreError::UnexpectedEof)
    ));

    let tiny: Bytes = bytes[..3].to_vec().into();
    assert!(matches!(
        Frame::from_bytes(&tiny),
        Err(StoreError::UnexpectedEof)
    ));
}

#[test]
fn frame_from_bytes_rejects_inconsistent_subject_len() {
    let frame = Frame::new(1, 2, Bytes::from("foo"), Bytes::from("data"));
    let mut bytes = frame.to_bytes();

    // Claim a subject longer than the whole record body
    bytes[20..22].copy_from_slice(&u16::MAX.to_le_bytes());

    let result = Frame::from_bytes(&Bytes::from(bytes));
    assert!(matches!(result, Err(StoreError::CorruptRecord)));
}

#[test]
fn frame_tombstone_matches_original_length_and_parses() {
    let original = Frame::new(7, 999, Bytes::from("secret.subject"), Bytes::from("secret payload"));
    let mut rng = rand::thread_rng();

    let tombstone = Frame::tombstone(14, 14, &mut rng);
    assert_eq!(tombstone.encoded_len(), original.encoded_len());
    assert!(tombstone.is_tombstone());
    assert_eq!(tombstone.timestamp_ns(), 0);

    // The tombstone still parses as a valid (but dead) record
    let bytes: Bytes = tombstone.to_bytes().into();
    let (parsed, _) = Frame::from_bytes(&bytes).unwrap();
    assert!(parsed.is_tombstone());
}

#[test]
fn frame_empty_subject_and_payload() {
    let frame = Frame::new(1, 1, Bytes::new(), Bytes::new());
    let bytes: Bytes = frame.to_bytes().into();

    assert_eq!(bytes.len() as u64, message_size("", b""));

    let (parsed, consumed) = Frame::from_bytes(&bytes).unwrap();
    assert!(parsed.subject().is_empty());
    assert!(parsed.payload().is_empty());
    assert_eq!(consumed, bytes.len());
}

#[test]
fn message_size_counts_full_framing() {
    // 4 + 8 + 8 + 2 + 3 + 11 + 8
    assert_eq!(message_size("foo", b"Hello World"), 44);
    assert_eq!(message_size("", b""), 30);
}

// ============================================================================
// Block Index Sidecar Tests
// ============================================================================

mod sidecar {
    use silo_types::{BlockId, Sequence};
    use tempfile::TempDir;

    use crate::index::{BlockSnapshot, SnapshotSlot};
    use crate::StoreError;

    fn sample_snapshot() -> BlockSnapshot {
        BlockSnapshot {
            block_id: BlockId::new(3),
            first_seq: Sequence::new(10),
            last_seq: Sequence::new(12),
            live_msgs: 2,
            live_bytes: 90,
            file_len: 135,
            slots: vec![
                SnapshotSlot {
                    seq: Sequence::new(10),
                    offset: 0,
                    size: 45,
                },
                SnapshotSlot {
                    seq: Sequence::new(12),
                    offset: 90,
                    size: 45,
                },
            ],
        }
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3.idx");

        let snap = sample_snapshot();
        snap.save(&path).unwrap();

        let loaded = BlockSnapshot::load(&path).unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn snapshot_load_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3.idx");

        let snap = sample_snapshot();
        snap.save(&path).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        data[0] = b'X';
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            BlockSnapshot::load(&path),
            Err(StoreError::InvalidIndexMagic)
        ));
    }

    #[test]
    fn snapshot_load_rejects_bad_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3.idx");

        sample_snapshot().save(&path).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        data[4] = 0x7F;
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            BlockSnapshot::load(&path),
            Err(StoreError::UnsupportedIndexVersion(0x7F))
        ));
    }

    #[test]
    fn snapshot_load_rejects_flipped_entry_byte() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3.idx");

        sample_snapshot().save(&path).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            BlockSnapshot::load(&path),
            Err(StoreError::IndexChecksumMismatch { .. })
        ));
    }

    #[test]
    fn snapshot_load_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3.idx");

        sample_snapshot().save(&path).unwrap();

        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 6]).unwrap();

        assert!(matches!(
            BlockSnapshot::load(&path),
            Err(StoreError::IndexTruncated { .. })
        ));
    }
}

// ============================================================================
// Store Integration Tests
// ============================================================================

mod integration {
    use std::thread;
    use std::time::Duration;

    use bytes::Bytes;
    use silo_types::{Sequence, StorageKind, StreamConfig};
    use tempfile::TempDir;

    use crate::record::Frame;
    use crate::{message_size, FileStore, StoreConfig, StoreError, DEFAULT_BLOCK_SIZE};

    fn open_store(dir: &TempDir) -> FileStore {
        open_store_with(dir, StreamConfig::file("zzz"))
    }

    fn open_store_with(dir: &TempDir, stream: StreamConfig) -> FileStore {
        FileStore::open(StoreConfig::new(dir.path()), stream).unwrap()
    }

    /// Polls `check` until it passes or the deadline elapses.
    fn check_for(total: Duration, interval: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + total;
        loop {
            if check() {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(interval);
        }
    }

    #[test]
    fn store_basics() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let (subj, msg) = ("foo", b"Hello World".as_slice());
        for i in 1..=5u64 {
            let seq = store.append(subj, msg).unwrap();
            assert_eq!(seq, Sequence::new(i));
        }

        let stats = store.stats();
        assert_eq!(stats.msgs, 5);
        assert_eq!(stats.bytes, 5 * message_size(subj, msg));
        assert_eq!(stats.first_seq, Sequence::new(1));
        assert_eq!(stats.last_seq, Sequence::new(5));

        let looked_up = store.lookup(Sequence::new(2)).unwrap();
        assert_eq!(looked_up.subject, subj);
        assert_eq!(looked_up.payload.as_ref(), msg);

        store.lookup(Sequence::new(3)).unwrap();
    }

    #[test]
    fn open_validates_config() {
        let dir = TempDir::new().unwrap();

        // Wrong storage kind
        let mut stream = StreamConfig::file("dlc");
        stream.storage = StorageKind::Memory;
        assert!(matches!(
            FileStore::open(StoreConfig::new(dir.path()), stream),
            Err(StoreError::UnsupportedStorage(StorageKind::Memory))
        ));

        // No name
        assert!(matches!(
            FileStore::open(StoreConfig::new(dir.path()), StreamConfig::file("")),
            Err(StoreError::EmptyStreamName)
        ));

        // Non-existent store directory
        let missing = dir.path().join("does-not-exist");
        assert!(matches!(
            FileStore::open(StoreConfig::new(&missing), StreamConfig::file("dlc")),
            Err(StoreError::StoreDirMissing(_))
        ));
    }

    #[test]
    fn write_msgs_and_restore() {
        let dir = TempDir::new().unwrap();
        let subj = "foo";
        let to_store = 100u64;

        let store = open_store(&dir);
        for i in 1..=to_store {
            let msg = format!("[{i:08}] Hello World!");
            let seq = store.append(subj, msg.as_bytes()).unwrap();
            assert_eq!(seq, Sequence::new(i));
        }

        let expected_size = to_store * message_size(subj, b"[00000022] Hello World!");
        let stats = store.stats();
        assert_eq!(stats.msgs, to_store);
        assert_eq!(stats.bytes, expected_size);

        // Close flushes to disk.
        store.close().unwrap();
        drop(store);

        let store = open_store(&dir);
        let stats = store.stats();
        assert_eq!(stats.msgs, to_store);
        assert_eq!(stats.bytes, expected_size);

        // Payloads survive the restart intact
        let msg22 = store.lookup(Sequence::new(22)).unwrap();
        assert_eq!(msg22.payload.as_ref(), b"[00000022] Hello World!");
    }

    #[test]
    fn msg_limit_removes_oldest() {
        let dir = TempDir::new().unwrap();
        let mut stream = StreamConfig::file("zzz");
        stream.max_msgs = 10;
        let store = open_store_with(&dir, stream);

        let (subj, msg) = ("foo", b"Hello World".as_slice());
        for _ in 0..10 {
            store.append(subj, msg).unwrap();
        }
        assert_eq!(store.stats().msgs, 10);

        store.append(subj, msg).unwrap();

        let stats = store.stats();
        assert_eq!(stats.msgs, 10);
        assert_eq!(stats.last_seq, Sequence::new(11));
        assert_eq!(stats.first_seq, Sequence::new(2));

        assert!(matches!(
            store.lookup(Sequence::new(1)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn bytes_limit_removes_oldest() {
        let (subj, msg) = ("foo", [0u8; 512].as_slice());
        let stored_msg_size = message_size(subj, msg);
        let to_store = 1024u64;

        let dir = TempDir::new().unwrap();
        let mut stream = StreamConfig::file("zzz");
        stream.max_bytes = stored_msg_size * to_store;
        let store = open_store_with(&dir, stream);

        for _ in 0..to_store {
            store.append(subj, msg).unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.msgs, to_store);
        assert_eq!(stats.bytes, stored_msg_size * to_store);

        // Ten more; the byte limit keeps evicting the oldest
        for _ in 0..10 {
            store.append(subj, msg).unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.msgs, to_store);
        assert_eq!(stats.bytes, stored_msg_size * to_store);
        assert_eq!(stats.first_seq, Sequence::new(11));
        assert_eq!(stats.last_seq, Sequence::new(to_store + 10));
    }

    #[test]
    fn age_limit_expires_and_rearms() {
        let max_age = Duration::from_millis(25);

        let dir = TempDir::new().unwrap();
        let mut stream = StreamConfig::file("zzz");
        stream.max_age = max_age;
        let store = open_store_with(&dir, stream);

        let (subj, msg) = ("foo", b"Hello World".as_slice());
        for _ in 0..100 {
            store.append(subj, msg).unwrap();
        }
        assert_eq!(store.stats().msgs, 100);

        let expired = check_for(Duration::from_secs(2), max_age, || {
            let stats = store.stats();
            stats.msgs == 0 && stats.bytes == 0
        });
        assert!(expired, "messages did not expire: {:?}", store.stats());

        // The timer must rearm for messages stored after the store drained.
        for _ in 0..100 {
            store.append(subj, msg).unwrap();
        }
        assert_eq!(store.stats().msgs, 100);

        let expired = check_for(Duration::from_secs(2), max_age, || {
            let stats = store.stats();
            stats.msgs == 0 && stats.bytes == 0
        });
        assert!(expired, "messages did not expire after rearm");
    }

    #[test]
    fn timestamps_strictly_increase() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        for _ in 0..10 {
            store.append("foo", b"Hello World").unwrap();
        }

        let mut last = 0i64;
        for seq in 1..=10u64 {
            let msg = store.lookup(Sequence::new(seq)).unwrap();
            assert!(
                msg.timestamp_ns > last,
                "timestamps must strictly increase: {} then {}",
                last,
                msg.timestamp_ns
            );
            last = msg.timestamp_ns;
        }
    }

    #[test]
    fn purge_resets_to_one_empty_block() {
        let dir = TempDir::new().unwrap();
        let cfg = StoreConfig::new(dir.path()).with_block_size(64 * 1024);
        let store = FileStore::open(cfg.clone(), StreamConfig::file("zzz")).unwrap();

        let (subj, msg) = ("foo", vec![0u8; 8 * 1024]);
        let stored_msg_size = message_size(subj, &msg);
        let to_store = 1024u64;

        for _ in 0..to_store {
            store.append(subj, &msg).unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.msgs, to_store);
        assert_eq!(stats.bytes, stored_msg_size * to_store);
        assert!(store.block_count() > 1, "expected multiple blocks");

        let purged = store.purge().unwrap();
        assert_eq!(purged, to_store);
        assert_eq!(store.block_count(), 1);

        let check_purge_stats = |store: &FileStore| {
            let stats = store.stats();
            assert_eq!(stats.msgs, 0);
            assert_eq!(stats.bytes, 0);
            assert_eq!(stats.last_seq, Sequence::new(to_store));
            assert_eq!(stats.first_seq, Sequence::new(to_store + 1));
        };
        check_purge_stats(&store);

        // Same state after a restart.
        store.close().unwrap();
        drop(store);

        let store = FileStore::open(cfg, StreamConfig::file("zzz")).unwrap();
        assert_eq!(store.block_count(), 1);
        check_purge_stats(&store);

        // Sequence numbering is never reset by a purge
        let seq = store.append(subj, &msg).unwrap();
        assert_eq!(seq, Sequence::new(to_store + 1));
    }

    #[test]
    fn remove_half_and_restore() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let to_store = 100u64;
        for _ in 0..to_store {
            store.append("foo", b"Hello World").unwrap();
        }

        for i in 1..=to_store / 2 {
            assert!(store.remove(Sequence::new(i)).unwrap());
        }

        let stats = store.stats();
        assert_eq!(stats.msgs, to_store / 2);
        assert_eq!(stats.first_seq, Sequence::new(to_store / 2 + 1));

        store.close().unwrap();
        drop(store);

        let store = open_store(&dir);
        assert_eq!(store.stats(), stats);
    }

    #[test]
    fn remove_out_of_order_and_restore() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let to_store = 100u64;
        for _ in 0..to_store {
            store.append("foo", b"Hello World").unwrap();
        }

        // Remove evens
        for i in (2..=to_store).step_by(2) {
            assert!(store.remove(Sequence::new(i)).unwrap(), "remove {i}");
        }

        let stats = store.stats();
        assert_eq!(stats.msgs, to_store / 2);

        let check_live = |store: &FileStore| {
            store.lookup(Sequence::new(1)).unwrap();
            for i in (2..=to_store).step_by(2) {
                assert!(
                    matches!(store.lookup(Sequence::new(i)), Err(StoreError::NotFound(_))),
                    "seq {i} should be deleted"
                );
            }
        };
        check_live(&store);

        store.close().unwrap();
        drop(store);

        let store = open_store(&dir);
        assert_eq!(store.stats(), stats);
        check_live(&store);
    }

    #[test]
    fn removal_survives_crash_without_close() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        for _ in 0..10 {
            store.append("foo", b"Hello World").unwrap();
        }
        store.sync().unwrap();

        assert!(store.remove(Sequence::new(3)).unwrap());
        assert!(store.erase(Sequence::new(5)).unwrap());
        let stats = store.stats();

        // Crash: no close(), no final sync. Leaking the store skips the
        // drop-time flush that would otherwise mask a stale sidecar.
        std::mem::forget(store);

        let store = open_store(&dir);
        assert_eq!(store.stats(), stats);
        assert!(matches!(
            store.lookup(Sequence::new(3)),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.lookup(Sequence::new(5)),
            Err(StoreError::NotFound(_))
        ));
        // The erased tombstone must not resurface as a phantom corruption
        assert!(store.verify().is_empty());
        store.lookup(Sequence::new(4)).unwrap();
    }

    #[test]
    fn store_config_default_leaves_dir_unset() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(cfg.store_dir, std::path::PathBuf::new());

        // An unset store directory fails open-time validation
        assert!(matches!(
            FileStore::open(cfg, StreamConfig::file("zzz")),
            Err(StoreError::StoreDirMissing(_))
        ));
    }

    #[test]
    fn remove_of_dead_sequence_returns_false() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.append("foo", b"Hello World").unwrap();

        // Never stored
        assert!(!store.remove(Sequence::new(22)).unwrap());
        assert!(!store.erase(Sequence::new(22)).unwrap());

        // Already removed
        assert!(store.remove(Sequence::new(1)).unwrap());
        assert!(!store.remove(Sequence::new(1)).unwrap());
        assert!(!store.erase(Sequence::new(1)).unwrap());
    }

    #[test]
    fn age_limit_applies_on_recovery() {
        let max_age = Duration::from_millis(25);

        let dir = TempDir::new().unwrap();
        let mut stream = StreamConfig::file("zzz");
        stream.max_age = max_age;

        let store = open_store_with(&dir, stream.clone());
        for _ in 0..100 {
            store.append("foo", b"Hello World").unwrap();
        }
        assert_eq!(store.stats().msgs, 100);
        store.close().unwrap();
        drop(store);

        thread::sleep(2 * max_age);

        // Everything aged out while the store was down.
        let store = open_store_with(&dir, stream);
        let stats = store.stats();
        assert_eq!(stats.msgs, 0);
        assert_eq!(stats.bytes, 0);
    }

    #[test]
    fn bit_rot_is_detected_and_survives_restart() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        for _ in 0..100 {
            store.append("foo", b"Hello World").unwrap();
        }
        assert!(store.verify().is_empty());

        // Push everything to disk, then twiddle a payload byte of record 50.
        store.sync().unwrap();
        let target = Sequence::new(50);
        let (path, offset, size) = store.raw_slot(target).unwrap();
        let mut contents = std::fs::read(&path).unwrap();
        contents[(offset + size as u64 - 10) as usize] ^= 0xFF;
        std::fs::write(&path, &contents).unwrap();

        let bad = store.verify();
        assert_eq!(bad, vec![target]);

        // Lookup of a damaged sequence surfaces the corruption
        assert!(matches!(
            store.lookup(bad[0]),
            Err(StoreError::CorruptRecord)
        ));

        // Same report after a restart.
        store.close().unwrap();
        drop(store);

        let store = open_store(&dir);
        assert_eq!(store.verify(), bad);
    }

    #[test]
    fn erase_destroys_record_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let (subj, msg) = ("foo", b"Hello World".as_slice());
        let seq = store.append(subj, msg).unwrap();
        assert_eq!(store.lookup(seq).unwrap().payload.as_ref(), msg);

        // Land the record on disk so the overwrite is observable in the file.
        store.sync().unwrap();
        let (path, offset, size) = store.raw_slot(seq).unwrap();
        assert_eq!(size as u64, message_size(subj, msg));

        assert!(store.erase(seq).unwrap());
        assert!(matches!(store.lookup(seq), Err(StoreError::NotFound(_))));

        // Raw read of the block file at the original offset: the record
        // still parses, but as an anonymized tombstone.
        let contents = std::fs::read(&path).unwrap();
        let raw: Bytes = contents[offset as usize..(offset + size as u64) as usize]
            .to_vec()
            .into();
        let (frame, consumed) = Frame::from_bytes(&raw).unwrap();

        assert_eq!(consumed, size as usize);
        assert!(frame.is_tombstone());
        assert_eq!(frame.timestamp_ns(), 0);
        assert_eq!(frame.subject().len(), subj.len());
        assert_eq!(frame.payload().len(), msg.len());
        assert_ne!(frame.subject().as_ref(), subj.as_bytes());
        assert_ne!(frame.payload().as_ref(), msg);

        // Stats no longer count the erased record
        assert_eq!(store.stats().msgs, 0);
        assert_eq!(store.stats().bytes, 0);
    }

    #[test]
    fn torn_trailing_record_is_truncated_on_recovery() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        for _ in 0..10 {
            store.append("foo", b"Hello World").unwrap();
        }
        store.close().unwrap();
        let path = store.active_block_path();
        drop(store);

        // Simulate a crash mid-append: a length prefix promising more bytes
        // than the file holds. Drop the sidecar so recovery must scan.
        let mut contents = std::fs::read(&path).unwrap();
        let clean_len = contents.len();
        contents.extend_from_slice(&1000u32.to_le_bytes());
        contents.extend_from_slice(&[0xAB; 7]);
        std::fs::write(&path, &contents).unwrap();
        std::fs::remove_file(path.with_extension("idx")).unwrap();

        let store = open_store(&dir);
        let stats = store.stats();
        assert_eq!(stats.msgs, 10);
        assert_eq!(stats.first_seq, Sequence::new(1));
        assert_eq!(stats.last_seq, Sequence::new(10));
        for i in 1..=10u64 {
            store.lookup(Sequence::new(i)).unwrap();
        }

        // The torn tail is gone from the file
        assert_eq!(std::fs::read(&path).unwrap().len(), clean_len);
    }

    #[test]
    fn recovery_scans_when_sidecar_is_missing() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        for _ in 0..25 {
            store.append("foo", b"Hello World").unwrap();
        }
        let stats = store.stats();
        store.close().unwrap();
        let path = store.active_block_path();
        drop(store);

        std::fs::remove_file(path.with_extension("idx")).unwrap();

        let store = open_store(&dir);
        assert_eq!(store.stats(), stats);
        store.lookup(Sequence::new(17)).unwrap();
    }

    #[test]
    fn oversized_message_still_stores() {
        let dir = TempDir::new().unwrap();
        let cfg = StoreConfig::new(dir.path()).with_block_size(1024);
        let store = FileStore::open(cfg, StreamConfig::file("zzz")).unwrap();

        // Payload alone exceeds the block size
        let big = vec![0u8; 4 * 1024];
        let seq = store.append("foo", &big).unwrap();
        assert_eq!(store.lookup(seq).unwrap().payload.len(), big.len());

        // The next message rolls into its own block
        let seq2 = store.append("foo", &big).unwrap();
        assert_eq!(seq2, Sequence::new(2));
        assert_eq!(store.block_count(), 2);
    }

    #[test]
    fn subject_too_long_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let subject = "x".repeat(256);
        assert!(matches!(
            store.append(&subject, b"payload"),
            Err(StoreError::SubjectTooLong(256))
        ));
    }

    #[test]
    fn closed_store_rejects_mutation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.append("foo", b"Hello World").unwrap();
        store.close().unwrap();
        // Idempotent
        store.close().unwrap();

        assert!(matches!(
            store.append("foo", b"x"),
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            store.remove(Sequence::new(1)),
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.purge(), Err(StoreError::Closed)));
    }

    #[test]
    fn concurrent_appends_assign_unique_sequences() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let threads = 4;
        let per_thread = 50u64;

        thread::scope(|s| {
            for t in 0..threads {
                let store = &store;
                s.spawn(move || {
                    let subject = format!("worker.{t}");
                    for _ in 0..per_thread {
                        store.append(&subject, b"Hello World").unwrap();
                    }
                });
            }
        });

        let total = threads as u64 * per_thread;
        let stats = store.stats();
        assert_eq!(stats.msgs, total);
        assert_eq!(stats.first_seq, Sequence::new(1));
        assert_eq!(stats.last_seq, Sequence::new(total));

        // Sequences are dense and timestamps strictly increase with them
        let mut last_ts = 0i64;
        for i in 1..=total {
            let msg = store.lookup(Sequence::new(i)).unwrap();
            assert!(msg.timestamp_ns > last_ts);
            last_ts = msg.timestamp_ns;
        }
    }
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptests {
    use bytes::Bytes;
    use proptest::prelude::*;

    use crate::record::Frame;
    use crate::message_size;

    proptest! {
        #[test]
        fn frame_roundtrip_any_message(
            seq in 1u64..u64::MAX,
            ts in 1i64..i64::MAX,
            subject in "[a-z.]{0,64}",
            payload in prop::collection::vec(any::<u8>(), 0..1000),
        ) {
            let frame = Frame::new(
                seq,
                ts,
                Bytes::from(subject.clone().into_bytes()),
                Bytes::from(payload.clone()),
            );
            let bytes: Bytes = frame.to_bytes().into();

            prop_assert_eq!(bytes.len() as u64, message_size(&subject, &payload));

            let (parsed, consumed) = Frame::from_bytes(&bytes).unwrap();
            prop_assert_eq!(parsed.seq(), seq);
            prop_assert_eq!(parsed.timestamp_ns(), ts);
            prop_assert_eq!(parsed.subject().as_ref(), subject.as_bytes());
            prop_assert_eq!(parsed.payload().as_ref(), payload.as_slice());
            prop_assert_eq!(consumed, bytes.len());
        }

        #[test]
        fn any_single_byte_flip_is_detected(
            payload in prop::collection::vec(any::<u8>(), 1..200),
            flip_pos in 0usize..1000,
        ) {
            let frame = Frame::new(9, 1_000, Bytes::from("foo"), Bytes::from(payload));
            let mut bytes = frame.to_bytes();

            let pos = flip_pos % bytes.len();
            bytes[pos] ^= 1;

            // Any error is acceptable: CorruptRecord for a checksum or
            // framing mismatch, UnexpectedEof when the flipped byte grew the
            // length prefix past the buffer.
            prop_assert!(Frame::from_bytes(&Bytes::from(bytes)).is_err());
        }
    }
}
