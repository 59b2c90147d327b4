//! Frame struct with typed accessors.
//!
//! A frame is one header plus its payload. Payloads are `bytes::Bytes`, so
//! frames split off the reassembly buffer share its allocation.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the message id.
    #[inline]
    pub fn message_id(&self) -> u32 {
        self.header.message_id
    }

    /// Check if this is a Call.
    #[inline]
    pub fn is_call(&self) -> bool {
        self.header.is_call()
    }

    /// Check if this is a Callback.
    #[inline]
    pub fn is_callback(&self) -> bool {
        self.header.is_callback()
    }

    /// Check if this is a Callback carrying an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }
}

/// Build a complete frame as one contiguous buffer.
///
/// The header's `payload_length` is taken from `payload`, so callers only
/// pick the flags and the message id. The length is not checked against any
/// limit; the Call and Callback encoders do that before building the frame.
///
/// # Example
///
/// ```
/// use ezrpc::protocol::{build_frame, flags, HEADER_SIZE};
///
/// let bytes = build_frame(flags::CALL, 42, b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(frame_flags: u8, message_id: u32, payload: &[u8]) -> Bytes {
    let header = Header::new(frame_flags, message_id, payload.len() as u32);
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    buf.freeze()
}
