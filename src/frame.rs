//! Length-prefix framing of a byte stream into discrete messages
//!
//! The wire format is a fixed 4-byte network-byte-order length prefix followed
//! by exactly that many payload bytes of opaque binary content. The sender is
//! responsible for prefixing (see [`encode_frame`]); the receiving side feeds
//! whatever fragments the transport hands it through a [`Packetizer`], which
//! reassembles complete frames regardless of how the stream was split.
//!
//! # Guarantees
//!
//! - Fragmentation-independent: for any way of splitting a byte sequence
//!   across `write()` calls, the produced frame sequence is identical to
//!   feeding the whole sequence at once.
//! - Zero-length frames are valid payloads and are distinct from "no frame
//!   available yet".
//! - A length prefix above the configured maximum is a protocol framing
//!   error, rejected before any payload buffer is allocated.

use crate::error::FrameError;

/// Size of the length prefix preceding every frame, in bytes.
pub const LEN_PREFIX: usize = 4;

/// Default upper bound on a single frame's payload (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 20;

/// Stream-to-frame accumulator.
///
/// Internally a growable buffer plus a read cursor. `write()` appends raw
/// fragments, `next()` extracts complete frames, and `clean()` compacts
/// consumed bytes once no partially-received frame depends on them.
///
/// # Examples
///
/// ```rust
/// use lockstep_sockets::frame::{encode_frame, Packetizer};
///
/// let mut p = Packetizer::default();
/// let wire = encode_frame(b"hello");
///
/// // Arbitrary fragmentation: one byte at a time.
/// for b in &wire {
///     p.write(std::slice::from_ref(b));
/// }
/// assert_eq!(p.next().unwrap(), Some(b"hello".to_vec()));
/// assert_eq!(p.next().unwrap(), None);
/// ```
#[derive(Debug)]
pub struct Packetizer {
    buf: Vec<u8>,
    cursor: usize,
    max_frame_len: usize,
}

impl Packetizer {
    /// Creates a packetizer enforcing the given maximum payload length.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            cursor: 0,
            max_frame_len,
        }
    }

    /// Appends raw bytes from the stream, growing the buffer as needed.
    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extracts the next complete frame, if one is buffered.
    ///
    /// Returns `Ok(Some(payload))` for a complete frame (the payload may be
    /// empty), `Ok(None)` when the buffer does not yet hold a full prefix
    /// plus payload, and `Err` when the prefix itself is invalid.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let avail = self.buf.len() - self.cursor;
        if avail < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buf[self.cursor..self.cursor + LEN_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_len {
            // Reject before allocating anything: an adversarial prefix must
            // not turn into an allocation request.
            return Err(FrameError::Oversized {
                len,
                max: self.max_frame_len,
            });
        }
        if avail < LEN_PREFIX + len {
            return Ok(None);
        }
        let start = self.cursor + LEN_PREFIX;
        let payload = self.buf[start..start + len].to_vec();
        self.cursor = start + len;
        Ok(Some(payload))
    }

    /// Compacts the internal buffer, releasing consumed bytes.
    ///
    /// Bytes belonging to a partially-received frame are preserved.
    pub fn clean(&mut self) {
        if self.cursor > 0 {
            self.buf.drain(..self.cursor);
            self.cursor = 0;
        }
    }

    /// Number of unconsumed bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// The configured maximum payload length.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for Packetizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

/// Prefixes a payload with its 4-byte network-byte-order length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEN_PREFIX + payload.len());
    encode_frame_into(payload, &mut out);
    out
}

/// Appends a prefixed frame to an existing buffer.
pub fn encode_frame_into(payload: &[u8], out: &mut Vec<u8>) {
    debug_assert!(payload.len() <= u32::MAX as usize);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}
