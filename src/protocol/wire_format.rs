//! Wire format encoding and decoding.
//!
//! Every frame starts with a fixed 9-byte header:
//! ```text
//! ┌───────┬────────────┬──────────┐
//! │ Flags │ Message ID │ Length   │
//! │ 1 byte│ uint32 BE  │ uint32 BE│
//! └───────┴────────────┴──────────┘
//! ```
//!
//! `Length` counts the payload bytes that follow the header, which makes a
//! frame self-delimiting on a byte stream.

use crate::error::{Result, RpcError};

/// Header size in bytes (fixed, exactly 9).
pub const HEADER_SIZE: usize = 9;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Flag constants for the protocol.
pub mod flags {
    /// Frame kind: Callback (1) or Call (0).
    pub const IS_CALLBACK: u8 = 0b0000_0001;
    /// Callback carries an error message instead of a result.
    pub const IS_ERROR: u8 = 0b0000_0010;

    /// Reserved bits mask (bits 2-7).
    pub const RESERVED_MASK: u8 = 0b1111_1100;

    /// Flags of a Call frame.
    pub const CALL: u8 = 0;
    /// Flags of a successful Callback frame.
    pub const CALLBACK: u8 = IS_CALLBACK;
    /// Flags of a failed Callback frame.
    pub const ERROR_CALLBACK: u8 = IS_CALLBACK | IS_ERROR;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Correlation id shared by a Call and its Callback.
    pub message_id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(flags: u8, message_id: u32, payload_length: u32) -> Self {
        Self {
            flags,
            message_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use ezrpc::protocol::{flags, Header};
    ///
    /// let bytes = Header::new(flags::CALLBACK, 42, 100).encode();
    /// assert_eq!(bytes, [0x01, 0, 0, 0, 42, 0, 0, 0, 100]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.flags;
        buf[1..5].copy_from_slice(&self.message_id.to_be_bytes());
        buf[5..9].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            flags: buf[0],
            message_id: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            payload_length: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Reserved flag bits are 0
    /// - A Call never carries the error flag
    /// - Payload length doesn't exceed max
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(RpcError::Protocol(format!(
                "Reserved flag bits must be 0 (flags {:#04x})",
                self.flags
            )));
        }

        if self.is_call() && self.is_error() {
            return Err(RpcError::Protocol(
                "Error flag is only valid on callbacks".to_string(),
            ));
        }

        if self.payload_length > max_payload_size {
            return Err(RpcError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        Ok(())
    }

    /// Check if this header starts a Call.
    #[inline]
    pub fn is_call(&self) -> bool {
        !self.is_callback()
    }

    /// Check if this header starts a Callback.
    #[inline]
    pub fn is_callback(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_CALLBACK)
    }

    /// Check if this Callback carries an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }

    /// Total frame size (header + payload).
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(flags::ERROR_CALLBACK, 0xDEAD_BEEF, 100);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let bytes = Header::new(0x01, 0x0203_0405, 0x0607_0809).encode();
        assert_eq!(bytes, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Header::decode(&[0u8; HEADER_SIZE - 1]).is_none());
    }

    #[test]
    fn test_validate_reserved_bits_must_be_zero() {
        let header = Header::new(0b1000_0000, 1, 0);
        let err = header.validate(DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
        assert!(err.to_string().contains("Reserved flag bits"));
    }

    #[test]
    fn test_validate_error_flag_on_call_rejected() {
        let header = Header::new(flags::IS_ERROR, 1, 0);
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(flags::CALL, 1, 1_000_000);
        let err = header.validate(100).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_header_accessors() {
        let call = Header::new(flags::CALL, 3, 10);
        assert!(call.is_call());
        assert!(!call.is_callback());
        assert_eq!(call.frame_len(), HEADER_SIZE + 10);

        let failed = Header::new(flags::ERROR_CALLBACK, 3, 0);
        assert!(failed.is_callback());
        assert!(failed.is_error());
        assert!(failed.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_ok());
    }
}
