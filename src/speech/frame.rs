//! Length-prefixed frame demultiplexing
//!
//! Framed bodies are a sequence of `u32` big-endian length prefixes, each
//! followed by exactly that many payload bytes. Raw bodies pass every network
//! chunk through as its own unit.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Response header naming the framing scheme
pub const FRAMING_HEADER: &str = "x-audio-framing";

/// Header value for length-prefixed framing
pub const LENGTH_PREFIXED: &str = "length-prefixed";

/// Size of the frame length prefix in bytes
pub const PREFIX_LEN: usize = 4;

/// Framing convention declared by the synthesis backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `u32` big-endian length + payload, repeated
    LengthPrefixed,
    /// Unframed; each chunk is a unit
    Raw,
}

impl Framing {
    /// Interpret the value of [`FRAMING_HEADER`]; absence means raw
    #[must_use]
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case(LENGTH_PREFIXED) => Self::LengthPrefixed,
            _ => Self::Raw,
        }
    }
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LengthPrefixed => write!(f, "length-prefixed"),
            Self::Raw => write!(f, "raw"),
        }
    }
}

/// Splits an ordered byte stream into decode units
#[derive(Debug)]
pub struct Demuxer {
    framing: Framing,
    buf: BytesMut,
}

impl Demuxer {
    /// Create a demultiplexer for the declared framing
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buf: BytesMut::new(),
        }
    }

    /// Framing in effect
    #[must_use]
    pub const fn framing(&self) -> Framing {
        self.framing
    }

    /// Feed one network chunk; returns every unit it completes, in order
    pub fn push(&mut self, chunk: Bytes) -> Vec<Bytes> {
        match self.framing {
            Framing::Raw => {
                if chunk.is_empty() {
                    Vec::new()
                } else {
                    vec![chunk]
                }
            }
            Framing::LengthPrefixed => {
                self.buf.extend_from_slice(&chunk);
                let mut frames = Vec::new();
                while let Some(frame) = self.next_frame() {
                    frames.push(frame);
                }
                frames
            }
        }
    }

    /// Pop one complete frame from the accumulator, if available
    fn next_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < PREFIX_LEN {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if self.buf.len() - PREFIX_LEN < len {
            return None;
        }
        self.buf.advance(PREFIX_LEN);
        Some(self.buf.split_to(len).freeze())
    }

    /// Bytes received but not yet emitted
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// End of stream: discard any incomplete frame and return its size
    pub fn finish(&mut self) -> usize {
        let dropped = self.buf.len();
        if dropped > 0 {
            tracing::debug!(bytes = dropped, "discarding incomplete trailing frame");
        }
        self.buf.clear();
        dropped
    }
}

/// Append one length-prefixed frame to `out`
///
/// # Panics
///
/// Panics if `payload` is longer than `u32::MAX` bytes
pub fn encode_frame(payload: &[u8], out: &mut BytesMut) {
    let len = u32::try_from(payload.len()).expect("frame payload exceeds u32::MAX");
    out.reserve(PREFIX_LEN + payload.len());
    out.put_u32(len);
    out.put_slice(payload);
}
