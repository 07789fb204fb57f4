//! # Probe Packet Format
//!
//! Synthetic packets pushed over the data channel. Fixed 12-byte header,
//! big-endian, followed by random padding up to the frame size:
//!
//! ```text
//! offset  size  field
//! 0       4     sequence (u32, starts at 0, strictly increasing)
//! 4       8     send timestamp, nanoseconds since epoch (u64)
//! 12      ...   random payload, padding to the frame size
//! ```
//!
//! The client echoes nothing back over the data channel; it derives loss
//! from sequence gaps and jitter from timestamp spacing, and reports both
//! over signalling.

use bytes::{Buf, BufMut};

/// Header length in bytes: 4 (sequence) + 8 (timestamp).
pub const HEADER_LEN: usize = 12;

/// Default frame size in bytes, sized to a typical MTU.
pub const DEFAULT_FRAME_LEN: usize = 1200;

/// The fixed probe packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHeader {
    /// Per-session sequence number, starting at 0.
    pub sequence: u32,
    /// Send time in nanoseconds since the Unix epoch.
    pub sent_at_ns: u64,
}

impl ProbeHeader {
    /// Encode into a buffer. Panics if the buffer cannot hold
    /// [`HEADER_LEN`] bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sequence);
        buf.put_u64(self.sent_at_ns);
    }

    /// Decode from a buffer. Returns `None` if fewer than [`HEADER_LEN`]
    /// bytes remain.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < HEADER_LEN {
            return None;
        }
        Some(ProbeHeader {
            sequence: buf.get_u32(),
            sent_at_ns: buf.get_u64(),
        })
    }
}
