//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always written with `to_vec_named` so that they become maps
//! keyed by field name. A Call payload can then be read by any MessagePack
//! implementation without knowing the Rust field order.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// MessagePack codec for frame payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MsgPackDecode`](crate::RpcError::MsgPackDecode) if
    /// the bytes are not a valid encoding of `T`.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
