//! Stream reassembly buffer.
//!
//! TCP delivers an unstructured byte stream: one read may carry half a frame,
//! or three frames and the start of a fourth. [`FrameBuffer`] accumulates
//! reads in a `BytesMut` and walks a two-state machine:
//! - `WaitingForHeader`: need at least [`HEADER_SIZE`] bytes
//! - `WaitingForPayload`: header parsed, need N more payload bytes
//!
//! Unconsumed trailing bytes stay buffered for the next push.
//!
//! # Example
//!
//! ```
//! use ezrpc::protocol::{build_frame, flags, FrameBuffer};
//!
//! let bytes = build_frame(flags::CALL, 1, b"payload");
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&bytes[..4]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[4..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! ```

use bytes::{Buf, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// Initial capacity of the reassembly buffer.
const INITIAL_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with a custom payload limit.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns an empty vector when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a header is invalid (reserved bits set or
    /// payload above the limit). Frames that preceded the bad header are
    /// lost with it; use [`push_into`](Self::push_into) to keep them.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        self.push_into(data, &mut frames)?;
        Ok(frames)
    }

    /// Like [`push`](Self::push), but appends to `frames` as it goes, so the
    /// frames extracted before an invalid header survive the error.
    ///
    /// The stream cannot be resynchronised after an error; callers should
    /// [`clear`](Self::clear) the buffer.
    pub fn push_into(&mut self, data: &[u8], frames: &mut Vec<Frame>) -> Result<()> {
        self.buffer.extend_from_slice(data);

        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(())
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let header = match Header::decode(&self.buffer) {
                        Some(header) => header,
                        None => return Ok(None),
                    };
                    header.validate(self.max_payload_size)?;

                    self.buffer.advance(HEADER_SIZE);
                    self.state = State::WaitingForPayload { header };
                }
                State::WaitingForPayload { header } => {
                    let needed = header.payload_length as usize;
                    if self.buffer.len() < needed {
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(needed).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(Frame::new(header, payload)));
                }
            }
        }
    }

    /// Number of buffered bytes not yet returned as frames (excluding a
    /// header that has already been parsed).
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered bytes and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
