//! Codec module - serialization of frame payloads.
//!
//! Call and Callback payloads are MessagePack documents produced by
//! [`MsgPackCodec`]. Argument and result values are `serde_json::Value`, so
//! anything JSON can represent (numbers, strings, booleans, null, nested
//! arrays and objects) survives the trip.
//!
//! # Example
//!
//! ```
//! use ezrpc::codec::MsgPackCodec;
//! use serde_json::json;
//!
//! let encoded = MsgPackCodec::encode(&json!({"a": [1, 2, null]})).unwrap();
//! let decoded: serde_json::Value = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, json!({"a": [1, 2, null]}));
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
