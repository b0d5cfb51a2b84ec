//! Record framing for the on-disk message log.
//!
//! Each message is stored as one length-prefixed record:
//!
//! ```text
//! [total_len:u32][seq:u64][timestamp_ns:i64][subject_len:u16][subject][payload][xxh3:u64]
//!      4B           8B          8B               2B             N B      M B       8B
//! ```
//!
//! - **`total_len`**: record length excluding this field
//! - **seq**: the message sequence; 0 marks an erased tombstone
//! - **`timestamp_ns`**: origin wall-clock time in nanoseconds; 0 when erased
//! - **subject**: the subject string the message was stored under
//! - **payload**: the opaque message body
//! - **xxh3**: seeded 64-bit XXH3 of
//!   `seq || timestamp || subject_len || subject || payload`
//!
//! All integers are little-endian. The checksum is a fast non-cryptographic
//! hash sized for bit-rot detection, not for adversarial tampering.

use bytes::Bytes;
use rand::Rng;
use xxhash_rust::xxh3::Xxh3;

use crate::{Result, StoreError};

/// Maximum subject length accepted by the store, in bytes.
pub const MAX_SUBJECT_BYTES: usize = 255;

// Byte sizes - typed constants prevent mismatch bugs between encode and decode
const LEN_PREFIX_BYTES: usize = 4;
const SEQ_BYTES: usize = 8;
const TIMESTAMP_BYTES: usize = 8;
const SUBJECT_LEN_BYTES: usize = 2;
const CHECKSUM_BYTES: usize = 8;

/// Fixed body bytes: seq(8) + timestamp(8) + subject_len(2) = 18.
const FIXED_BODY_BYTES: usize = SEQ_BYTES + TIMESTAMP_BYTES + SUBJECT_LEN_BYTES;

/// Smallest possible `total_len`: fixed body + checksum, empty subject/payload.
const MIN_BODY_BYTES: usize = FIXED_BODY_BYTES + CHECKSUM_BYTES;

/// Seed for the record checksum; fixed so records are portable across stores.
const CHECKSUM_SEED: u64 = 0x5349_4C4F_5349_4C4F;

/// Returns the full on-disk size of a record for the given subject and
/// payload, length prefix and checksum included.
pub fn message_size(subject: &str, payload: &[u8]) -> u64 {
    (LEN_PREFIX_BYTES + FIXED_BODY_BYTES + CHECKSUM_BYTES + subject.len() + payload.len()) as u64
}

/// Computes the record checksum over the decoded fields.
///
/// The subject length participates so that a flipped bit in the length
/// field cannot silently move the subject/payload split.
fn checksum(seq: u64, timestamp_ns: i64, subject: &[u8], payload: &[u8]) -> u64 {
    let mut hasher = Xxh3::with_seed(CHECKSUM_SEED);
    hasher.update(&seq.to_le_bytes());
    hasher.update(&timestamp_ns.to_le_bytes());
    hasher.update(&(subject.len() as u16).to_le_bytes());
    hasher.update(subject);
    hasher.update(payload);
    hasher.digest()
}

/// One decoded on-disk record.
///
/// A frame with `seq == 0` is a tombstone left behind by secure erasure: it
/// still carries a valid checksum so scans can walk over it, but it is never
/// indexed or returned to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    seq: u64,
    timestamp_ns: i64,
    subject: Bytes,
    payload: Bytes,
}

impl Frame {
    /// Creates a new frame for a live message.
    pub fn new(
        seq: u64,
        timestamp_ns: i64,
        subject: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            seq,
            timestamp_ns,
            subject: subject.into(),
            payload: payload.into(),
        }
    }

    /// Creates a tombstone frame with randomized subject and payload of the
    /// given lengths. The encoded size matches the record it replaces.
    pub fn tombstone(subject_len: usize, payload_len: usize, rng: &mut impl Rng) -> Self {
        let mut subject = vec![0u8; subject_len];
        rng.fill(subject.as_mut_slice());
        let mut payload = vec![0u8; payload_len];
        rng.fill(payload.as_mut_slice());

        Self {
            seq: 0,
            timestamp_ns: 0,
            subject: subject.into(),
            payload: payload.into(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }

    pub fn subject(&self) -> &Bytes {
        &self.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// True when this record was erased in place.
    pub fn is_tombstone(&self) -> bool {
        self.seq == 0
    }

    /// Full encoded size, length prefix included.
    pub fn encoded_len(&self) -> usize {
        LEN_PREFIX_BYTES
            + FIXED_BODY_BYTES
            + self.subject.len()
            + self.payload.len()
            + CHECKSUM_BYTES
    }

    /// Serializes the frame to its on-disk representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let total_len =
            FIXED_BODY_BYTES + self.subject.len() + self.payload.len() + CHECKSUM_BYTES;
        let mut buf = Vec::with_capacity(LEN_PREFIX_BYTES + total_len);

        buf.extend_from_slice(&(total_len as u32).to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        buf.extend_from_slice(&(self.subject.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.subject);
        buf.extend_from_slice(&self.payload);

        let sum = checksum(self.seq, self.timestamp_ns, &self.subject, &self.payload);
        buf.extend_from_slice(&sum.to_le_bytes());

        buf
    }

    /// Deserializes a frame from bytes starting at a length prefix.
    ///
    /// Returns the parsed frame and the number of bytes consumed. Payload and
    /// subject are zero-copy slices of `data`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::UnexpectedEof`] if `data` ends before the frame does
    /// - [`StoreError::CorruptRecord`] if the framing is inconsistent or the
    ///   checksum does not verify
    pub fn from_bytes(data: &Bytes) -> Result<(Self, usize)> {
        if data.len() < LEN_PREFIX_BYTES {
            return Err(StoreError::UnexpectedEof);
        }

        let total_len = u32::from_le_bytes(data[0..4].try_into().expect("4-byte slice")) as usize;
        if total_len < MIN_BODY_BYTES {
            return Err(StoreError::CorruptRecord);
        }

        let frame_end = LEN_PREFIX_BYTES + total_len;
        if data.len() < frame_end {
            return Err(StoreError::UnexpectedEof);
        }

        let seq = u64::from_le_bytes(data[4..12].try_into().expect("8-byte slice"));
        let timestamp_ns = i64::from_le_bytes(data[12..20].try_into().expect("8-byte slice"));
        let subject_len =
            u16::from_le_bytes(data[20..22].try_into().expect("2-byte slice")) as usize;

        if FIXED_BODY_BYTES + subject_len + CHECKSUM_BYTES > total_len {
            return Err(StoreError::CorruptRecord);
        }
        let payload_len = total_len - FIXED_BODY_BYTES - subject_len - CHECKSUM_BYTES;

        let subject_start = LEN_PREFIX_BYTES + FIXED_BODY_BYTES;
        let subject = data.slice(subject_start..subject_start + subject_len);
        let payload =
            data.slice(subject_start + subject_len..subject_start + subject_len + payload_len);

        let stored_sum =
            u64::from_le_bytes(data[frame_end - CHECKSUM_BYTES..frame_end].try_into().expect(
                "8-byte slice",
            ));
        let computed_sum = checksum(seq, timestamp_ns, &subject, &payload);

        if stored_sum != computed_sum {
            return Err(StoreError::CorruptRecord);
        }

        Ok((
            Self {
                seq,
                timestamp_ns,
                subject,
                payload,
            },
            frame_end,
        ))
    }
}
