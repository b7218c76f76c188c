//! Record Codec
//!
//! Wire framing and validation for sensor telemetry.
//!
//! # Wire Format
//!
//! Each reading is one JSON object terminated by a newline:
//!
//! ```text
//! {"sensor":"network","values":{"packets":61,"event":"Normal"}}\n
//! ```
//!
//! [`FrameDecoder`] splits a raw byte stream into frames and keeps incomplete
//! trailing bytes buffered until the terminator arrives. [`decode_reading`]
//! turns a single frame into a validated [`Reading`]. The logging session
//! later finalizes a reading into a timestamped [`Record`].

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::codec::Decoder;

/// Default upper bound for a single frame (64 KiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

// ============================================================================
// Record Types
// ============================================================================

/// A decoded, validated sensor reading (not yet timestamped)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Reading {
    /// Subsystem name (e.g. "network", "auth", "device")
    pub sensor: String,
    /// Field name -> value, opaque apart from the optional `event` label
    pub values: Map<String, Value>,
}

impl Reading {
    pub fn new(sensor: impl Into<String>, values: Map<String, Value>) -> Self {
        Self {
            sensor: sensor.into(),
            values,
        }
    }

    /// The `event` label carried by most sensor payloads
    pub fn event(&self) -> Option<&str> {
        self.values.get("event").and_then(Value::as_str)
    }

    /// Attach the append-time timestamp
    pub fn finalize(self, timestamp: i64) -> Record {
        Record {
            sensor: self.sensor,
            values: self.values,
            timestamp,
        }
    }
}

/// A finalized record as persisted in the run log
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    pub sensor: String,
    pub values: Map<String, Value>,
    /// Seconds since epoch, assigned at the moment of durable append
    pub timestamp: i64,
}

impl Record {
    pub fn event(&self) -> Option<&str> {
        self.values.get("event").and_then(Value::as_str)
    }
}

// ============================================================================
// Frame Validation
// ============================================================================

/// Why a frame was rejected
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] simd_json::Error),

    #[error("Empty sensor name")]
    EmptySensor,
}

/// Decode one frame (without its terminator) into a [`Reading`].
///
/// The frame is parsed in place, so the buffer contents are clobbered.
pub fn decode_reading(frame: &mut [u8]) -> Result<Reading, CodecError> {
    let reading: Reading = simd_json::from_slice(frame)?;
    if reading.sensor.trim().is_empty() {
        return Err(CodecError::EmptySensor);
    }
    Ok(reading)
}

/// Encode a reading as a newline-terminated frame
pub fn encode_frame(reading: &Reading) -> serde_json::Result<Vec<u8>> {
    let mut out = serde_json::to_vec(reading)?;
    out.push(b'\n');
    Ok(out)
}

// ============================================================================
// Stream Framing
// ============================================================================

/// One unit extracted from the byte stream
#[derive(Debug)]
pub enum Frame {
    /// A complete line, terminator (and any trailing `\r`) stripped
    Line(BytesMut),
    /// A line longer than the frame limit; its bytes were discarded
    Oversized,
}

/// Newline frame splitter with a length limit.
///
/// Partial frames stay in the caller's buffer between reads. A frame that
/// grows past `max_frame_len` without a terminator is dropped up to the next
/// newline and reported once as [`Frame::Oversized`].
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_len: usize,
    /// Bytes of the buffer already scanned for a newline
    next_index: usize,
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        loop {
            // Room for a full frame, an optional `\r` and the `\n`
            let read_to = buf.len().min(self.max_frame_len.saturating_add(2));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| offset + self.next_index);

            match (self.discarding, newline) {
                (true, Some(idx)) => {
                    buf.advance(idx + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(Frame::Oversized));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(idx)) => {
                    self.next_index = 0;
                    let mut line = buf.split_to(idx + 1);
                    line.truncate(idx);
                    if line.last() == Some(&b'\r') {
                        line.truncate(idx - 1);
                    }
                    if line.len() > self.max_frame_len {
                        return Ok(Some(Frame::Oversized));
                    }
                    return Ok(Some(Frame::Line(line)));
                }
                (false, None) if buf.len() > self.max_frame_len.saturating_add(1) => {
                    self.discarding = true;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }
}
