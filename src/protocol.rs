//! Secure link frame codec, replay protection, and radio fragmentation
//!
//! Frame layout (big-endian):
//!
//! ```text
//! ┌──────────┬──────┬───────────┬──────────────────────────┬──────────────┐
//! │ DeviceID │ Seq# │ Timestamp │ IV + AES-CBC(payload)    │ HMAC-SHA256  │
//! │ 4 bytes  │ 2 B  │ 4 bytes   │ 16 + multiple of 16      │ 32 bytes     │
//! └──────────┴──────┴───────────┴──────────────────────────┴──────────────┘
//! ```
//!
//! The payload is canonical JSON (sorted keys, no whitespace), compressed
//! with zlib level 6 before encryption. The MAC covers everything before it
//! (header ‖ IV ‖ ciphertext). Decoding is the strict reverse and fails
//! closed: any length, MAC, decryption, decompression or JSON error yields
//! a [`FrameError`] and the frame is discarded by the caller.
//!
//! Replay discipline: sequences are per-source `u16` counters that wrap at
//! 2¹⁶. A received sequence `s` is accepted iff `(s − last) mod 2¹⁶` lies
//! in `[1, 32768]` and the frame timestamp is within ±300 s of local time.
//!
//! Fragmentation: frames larger than one radio packet (255 bytes) are split
//! into ≤252-byte pieces behind a 3-byte `group id | index | total` header.
//! Single-fragment messages bypass the reassembly buffer entirely; partial
//! groups are discarded after 10 s.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::time::Instant;

use crate::crypto::{self, CryptoError, IV_LEN, TAG_LEN};

// ===============================================================================================
// Constants
// ===============================================================================================

/// Header size: device_id(4) + seq(2) + timestamp(4).
pub const HEADER_LEN: usize = 10;
/// Largest payload one radio packet carries.
pub const MAX_RADIO_PAYLOAD: usize = 255;
/// Fragment header: group id(1) + index(1) + total(1).
pub const FRAGMENT_HEADER_LEN: usize = 3;
/// Largest fragment data slice.
pub const MAX_FRAGMENT_DATA: usize = MAX_RADIO_PAYLOAD - FRAGMENT_HEADER_LEN;
/// Frames older or newer than this are rejected as stale.
pub const TIMESTAMP_WINDOW_S: u32 = 300;
/// Partial fragment groups are dropped after this long.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Device id of the lab server.
pub const DEVICE_LAB: u32 = 0x0001;
/// Device id of the calibration bench.
pub const DEVICE_BENCH: u32 = 0x0002;

// ===============================================================================================
// Errors
// ===============================================================================================

/// Frame decode/encode failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("MAC verification failed (tampered frame or wrong key)")]
    BadMac,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("payload decompression failed: {0}")]
    Decompress(std::io::Error),
    #[error("payload is not a JSON object: {0}")]
    BadPayload(serde_json::Error),
    #[error("fragment too short: {0} bytes")]
    FragmentTooShort(usize),
    #[error("fragment data exceeds {MAX_FRAGMENT_DATA} bytes: {0}")]
    FragmentTooLarge(usize),
}

/// A frame rejected by replay protection.
#[derive(Debug, thiserror::Error)]
#[error("replay rejected: device=0x{device_id:04X} seq={seq} ({reason})")]
pub struct ReplayRejected {
    pub device_id: u32,
    pub seq: u16,
    pub reason: &'static str,
}

// ===============================================================================================
// Frame codec
// ===============================================================================================

/// A decoded link frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub device_id: u32,
    pub seq: u16,
    pub timestamp: u32,
    pub payload: serde_json::Value,
}

/// Encode a JSON payload into a complete frame.
///
/// `timestamp` is seconds since the Unix epoch; pass the current wall clock
/// for live traffic.
pub fn encode(
    payload: &serde_json::Value,
    device_id: u32,
    seq: u16,
    timestamp: u32,
    aes_key: &[u8],
    hmac_key: &[u8],
) -> Result<Vec<u8>, FrameError> {
    // Canonical JSON: serde_json objects serialize with sorted keys and no
    // whitespace, so byte-stable across encoders.
    let json = serde_json::to_vec(payload).map_err(FrameError::BadPayload)?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(6));
    encoder.write_all(&json).map_err(FrameError::Decompress)?;
    let compressed = encoder.finish().map_err(FrameError::Decompress)?;

    let encrypted = crypto::encrypt(&compressed, aes_key)?;

    let mut frame = Vec::with_capacity(HEADER_LEN + encrypted.len() + TAG_LEN);
    frame.extend_from_slice(&device_id.to_be_bytes());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&timestamp.to_be_bytes());
    frame.extend_from_slice(&encrypted);

    let tag = crypto::sign(&frame, hmac_key)?;
    frame.extend_from_slice(&tag);
    Ok(frame)
}

/// Decode and authenticate a frame.
pub fn decode(frame: &[u8], aes_key: &[u8], hmac_key: &[u8]) -> Result<Frame, FrameError> {
    // Header + IV + one cipher block + tag is the minimum well-formed frame.
    if frame.len() < HEADER_LEN + IV_LEN * 2 + TAG_LEN {
        return Err(FrameError::TooShort(frame.len()));
    }

    let (body, tag) = frame.split_at(frame.len() - TAG_LEN);
    if !crypto::verify(body, tag, hmac_key)? {
        return Err(FrameError::BadMac);
    }

    let device_id = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let seq = u16::from_be_bytes([body[4], body[5]]);
    let timestamp = u32::from_be_bytes([body[6], body[7], body[8], body[9]]);

    let compressed = crypto::decrypt(&body[HEADER_LEN..], aes_key)?;

    let mut json = Vec::new();
    ZlibDecoder::new(&compressed[..])
        .read_to_end(&mut json)
        .map_err(FrameError::Decompress)?;

    let payload = serde_json::from_slice(&json).map_err(FrameError::BadPayload)?;

    Ok(Frame {
        device_id,
        seq,
        timestamp,
        payload,
    })
}

// ===============================================================================================
// Sequence counter / replay protection
// ===============================================================================================

/// Monotonic 16-bit transmit counter plus per-source receive window.
///
/// Thread-safe; shared between the queue dispatcher (next sequence) and the
/// receive path (replay checks).
#[derive(Default)]
pub struct SequenceCounter {
    inner: Mutex<SeqInner>,
}

#[derive(Default)]
struct SeqInner {
    counter: u16,
    last_received: HashMap<u32, u16>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next outbound sequence (wraps at 2¹⁶). Never reused for retries.
    pub fn next(&self) -> u16 {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.counter;
        inner.counter = inner.counter.wrapping_add(1);
        seq
    }

    /// Validate a received (device, seq, timestamp) triple and advance the
    /// per-source window on acceptance.
    pub fn check_and_update(
        &self,
        device_id: u32,
        seq: u16,
        timestamp: u32,
        now_unix: u32,
    ) -> Result<(), ReplayRejected> {
        if now_unix.abs_diff(timestamp) > TIMESTAMP_WINDOW_S {
            return Err(ReplayRejected {
                device_id,
                seq,
                reason: "stale timestamp",
            });
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(&last) = inner.last_received.get(&device_id) {
            let diff = seq.wrapping_sub(last);
            if diff == 0 || diff > 32768 {
                return Err(ReplayRejected {
                    device_id,
                    seq,
                    reason: "duplicate or out-of-order sequence",
                });
            }
        }
        inner.last_received.insert(device_id, seq);
        Ok(())
    }
}

// ===============================================================================================
// Fragmentation
// ===============================================================================================

/// One radio-sized piece of a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    pub group_id: u8,
    pub index: u8,
    pub total: u8,
    pub data: Vec<u8>,
}

impl Fragment {
    /// Serialize for transmission: 3-byte header + data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.data.len());
        out.push(self.group_id);
        out.push(self.index);
        out.push(self.total);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse a received fragment.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < FRAGMENT_HEADER_LEN {
            return Err(FrameError::FragmentTooShort(raw.len()));
        }
        let data = raw[FRAGMENT_HEADER_LEN..].to_vec();
        if data.len() > MAX_FRAGMENT_DATA {
            return Err(FrameError::FragmentTooLarge(data.len()));
        }
        Ok(Fragment {
            group_id: raw[0],
            index: raw[1],
            total: raw[2],
            data,
        })
    }
}

/// Split a frame into fragments sharing `group_id`.
///
/// Frames that fit a single radio packet become one fragment with total=1.
pub fn fragment(frame: &[u8], group_id: u8) -> Vec<Fragment> {
    if frame.len() <= MAX_RADIO_PAYLOAD {
        return vec![Fragment {
            group_id,
            index: 0,
            total: 1,
            data: frame.to_vec(),
        }];
    }
    let chunks: Vec<&[u8]> = frame.chunks(MAX_FRAGMENT_DATA).collect();
    let total = chunks.len() as u8;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Fragment {
            group_id,
            index: i as u8,
            total,
            data: chunk.to_vec(),
        })
        .collect()
}

/// Collects fragments and emits complete frames.
///
/// Keeps per-group partial buffers keyed by group id; a group whose first
/// fragment is older than [`REASSEMBLY_TIMEOUT`] is discarded on the next
/// [`Reassembler::sweep`].
pub struct Reassembler {
    groups: HashMap<u8, Group>,
}

struct Group {
    parts: HashMap<u8, Vec<u8>>,
    total: u8,
    first_seen: Instant,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }

    /// Add a fragment; returns the reassembled frame once the group is
    /// complete. Single-fragment messages pass straight through.
    pub fn add(&mut self, frag: Fragment) -> Option<Vec<u8>> {
        if frag.total <= 1 {
            return Some(frag.data);
        }

        let group = self.groups.entry(frag.group_id).or_insert_with(|| Group {
            parts: HashMap::new(),
            total: frag.total,
            first_seen: Instant::now(),
        });
        group.parts.insert(frag.index, frag.data);

        if group.parts.len() == group.total as usize {
            let group = self.groups.remove(&frag.group_id)?;
            let mut frame = Vec::new();
            for i in 0..group.total {
                frame.extend_from_slice(group.parts.get(&i)?);
            }
            return Some(frame);
        }
        None
    }

    /// Drop partial groups older than the reassembly timeout.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.groups
            .retain(|_, g| now.duration_since(g.first_seen) <= REASSEMBLY_TIMEOUT);
    }

    /// Number of incomplete groups currently buffered.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const AES_KEY: [u8; 32] = [0x42; 32];
    const HMAC_KEY: [u8; 32] = [0x17; 32];

    fn sample_payload() -> serde_json::Value {
        json!({
            "command": "TEST_STATUS",
            "test_id": 7,
            "q_point": "Q2",
            "state": "MEASURE",
            "flow_rate_lph": 1000.5,
        })
    }

    #[test]
    fn encode_decode_roundtrip() {
        let payload = sample_payload();
        let frame = encode(&payload, DEVICE_BENCH, 12, 1_700_000_000, &AES_KEY, &HMAC_KEY).unwrap();
        let decoded = decode(&frame, &AES_KEY, &HMAC_KEY).unwrap();
        assert_eq!(decoded.device_id, DEVICE_BENCH);
        assert_eq!(decoded.seq, 12);
        assert_eq!(decoded.timestamp, 1_700_000_000);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn tampering_any_body_byte_breaks_the_mac() {
        let frame = encode(&sample_payload(), DEVICE_BENCH, 1, 1_700_000_000, &AES_KEY, &HMAC_KEY)
            .unwrap();
        for i in [0, HEADER_LEN, HEADER_LEN + 5, frame.len() - TAG_LEN - 1] {
            let mut bad = frame.clone();
            bad[i] ^= 0x80;
            assert!(
                matches!(decode(&bad, &AES_KEY, &HMAC_KEY), Err(FrameError::BadMac)),
                "byte {i} tamper not caught"
            );
        }
    }

    #[test]
    fn short_frame_rejected() {
        assert!(matches!(
            decode(&[0u8; 20], &AES_KEY, &HMAC_KEY),
            Err(FrameError::TooShort(20))
        ));
    }

    #[test]
    fn wrong_hmac_key_rejected() {
        let frame =
            encode(&sample_payload(), DEVICE_LAB, 1, 1_700_000_000, &AES_KEY, &HMAC_KEY).unwrap();
        let other = [0x99u8; 32];
        assert!(matches!(
            decode(&frame, &AES_KEY, &other),
            Err(FrameError::BadMac)
        ));
    }

    #[test]
    fn replay_window_accepts_forward_rejects_backward() {
        let sc = SequenceCounter::new();
        let now = 1_700_000_000u32;
        assert!(sc.check_and_update(DEVICE_LAB, 1, now, now).is_ok());
        assert!(sc.check_and_update(DEVICE_LAB, 2, now, now).is_ok());
        assert!(sc.check_and_update(DEVICE_LAB, 10, now, now).is_ok());
        // Duplicate.
        assert!(sc.check_and_update(DEVICE_LAB, 10, now, now).is_err());
        // Out of order.
        assert!(sc.check_and_update(DEVICE_LAB, 5, now, now).is_err());
        // Stale timestamp.
        assert!(sc.check_and_update(DEVICE_LAB, 11, now - 301, now).is_err());
        assert!(sc.check_and_update(DEVICE_LAB, 11, now + 301, now).is_err());
        // Window edge is inclusive.
        assert!(sc.check_and_update(DEVICE_LAB, 12, now - 300, now).is_ok());
    }

    #[test]
    fn replay_window_handles_wraparound() {
        let sc = SequenceCounter::new();
        let now = 1_700_000_000u32;
        assert!(sc.check_and_update(DEVICE_LAB, 65_530, now, now).is_ok());
        // Wraps forward by 10.
        assert!(sc.check_and_update(DEVICE_LAB, 4, now, now).is_ok());
        // Backward past the wrap.
        assert!(sc.check_and_update(DEVICE_LAB, 65_531, now, now).is_err());
    }

    #[test]
    fn transmit_counter_wraps() {
        let sc = SequenceCounter::new();
        for _ in 0..65_536 {
            sc.next();
        }
        assert_eq!(sc.next(), 0);
    }

    #[test]
    fn small_frame_is_single_fragment() {
        let frame = vec![0xABu8; 200];
        let frags = fragment(&frame, 3);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].total, 1);
        assert_eq!(frags[0].data, frame);

        let mut r = Reassembler::new();
        assert_eq!(r.add(frags[0].clone()), Some(frame));
        assert_eq!(r.pending_groups(), 0);
    }

    #[test]
    fn large_frame_reassembles_from_permuted_fragments() {
        let frame: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut frags = fragment(&frame, 7);
        assert_eq!(frags.len(), 4);
        assert!(frags.iter().all(|f| f.data.len() <= MAX_FRAGMENT_DATA));

        // Deliver out of order.
        frags.swap(0, 3);
        frags.swap(1, 2);
        let mut r = Reassembler::new();
        let mut out = None;
        for f in frags {
            out = r.add(f);
        }
        assert_eq!(out, Some(frame));
    }

    #[test]
    fn oversized_fragment_rejected() {
        let mut raw = vec![1u8, 0, 2];
        raw.extend_from_slice(&[0u8; MAX_FRAGMENT_DATA + 1]);
        assert!(matches!(
            Fragment::from_bytes(&raw),
            Err(FrameError::FragmentTooLarge(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_groups_swept_after_timeout() {
        let frame = vec![0u8; 600];
        let frags = fragment(&frame, 9);
        let mut r = Reassembler::new();
        r.add(frags[0].clone());
        assert_eq!(r.pending_groups(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        r.sweep();
        assert_eq!(r.pending_groups(), 0);
    }
}
