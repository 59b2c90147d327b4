//! Call and Callback messages.
//!
//! A Call frame carries a MsgPack map `{"method": .., "args": [..]}`. A
//! Callback frame carries either the MsgPack encoding of the result value, or
//! (with [`flags::IS_ERROR`]) the error message as a MsgPack string. The
//! flag decides which one is present, so a decoded Callback can never hold
//! both or neither.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::frame::{build_frame, Frame};
use super::wire_format::{flags, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use crate::codec::MsgPackCodec;
use crate::error::{Result, RpcError};

/// Error text sent back when a call names a method nobody exposes.
pub const NO_SUCH_METHOD: &str = "No such method!";

/// A request to run `method` with positional `args`.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: u32,
    pub method: String,
    pub args: Vec<Value>,
}

/// The answer to a [`Call`], tagged with the Call's message id.
#[derive(Debug, Clone, PartialEq)]
pub struct Callback {
    pub message_id: u32,
    pub outcome: std::result::Result<Value, String>,
}

#[derive(Serialize)]
struct CallBodyRef<'a> {
    method: &'a str,
    args: &'a [Value],
}

#[derive(Deserialize)]
struct CallBody {
    method: String,
    #[serde(default)]
    args: Vec<Value>,
}

impl Call {
    pub fn new(message_id: u32, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            message_id,
            method: method.into(),
            args,
        }
    }

    /// Encode into a complete frame.
    pub fn encode(&self) -> Result<Bytes> {
        encode_call(self.message_id, &self.method, &self.args)
    }

    /// Encode into a complete frame whose payload is at most `max_payload_size`.
    pub fn encode_limited(&self, max_payload_size: u32) -> Result<Bytes> {
        encode_call_limited(self.message_id, &self.method, &self.args, max_payload_size)
    }

    /// Decode the payload of a frame taken from a [`FrameBuffer`](super::FrameBuffer).
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if !frame.is_call() {
            return Err(RpcError::Protocol(format!(
                "Expected a call frame, got flags {:#04x}",
                frame.header.flags
            )));
        }
        let body: CallBody = MsgPackCodec::decode(frame.payload())?;
        Ok(Self {
            message_id: frame.message_id(),
            method: body.method,
            args: body.args,
        })
    }
}

impl Callback {
    pub fn ok(message_id: u32, result: Value) -> Self {
        Self {
            message_id,
            outcome: Ok(result),
        }
    }

    pub fn err(message_id: u32, error: impl Into<String>) -> Self {
        Self {
            message_id,
            outcome: Err(error.into()),
        }
    }

    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }

    /// Encode into a complete frame.
    pub fn encode(&self) -> Result<Bytes> {
        self.encode_limited(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Encode into a complete frame whose payload is at most `max_payload_size`.
    pub fn encode_limited(&self, max_payload_size: u32) -> Result<Bytes> {
        encode_callback_limited(
            self.message_id,
            self.outcome.as_ref().map_err(String::as_str),
            max_payload_size,
        )
    }

    /// Decode the payload of a frame taken from a [`FrameBuffer`](super::FrameBuffer).
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if !frame.is_callback() {
            return Err(RpcError::Protocol(
                "Expected a callback frame, got a call".to_string(),
            ));
        }
        let outcome = if frame.is_error() {
            Err(MsgPackCodec::decode::<String>(frame.payload())?)
        } else {
            Ok(MsgPackCodec::decode::<Value>(frame.payload())?)
        };
        Ok(Self {
            message_id: frame.message_id(),
            outcome,
        })
    }
}

/// Encode a Call frame.
///
/// Fails with [`RpcError::Protocol`] if the payload exceeds
/// [`DEFAULT_MAX_PAYLOAD_SIZE`].
pub fn encode_call(message_id: u32, method: &str, args: &[Value]) -> Result<Bytes> {
    encode_call_limited(message_id, method, args, DEFAULT_MAX_PAYLOAD_SIZE)
}

/// Encode a Call frame, refusing payloads above `max_payload_size`.
pub fn encode_call_limited(
    message_id: u32,
    method: &str,
    args: &[Value],
    max_payload_size: u32,
) -> Result<Bytes> {
    let payload = MsgPackCodec::encode(&CallBodyRef { method, args })?;
    checked_frame(flags::CALL, message_id, &payload, max_payload_size)
}

/// Decode exactly one Call frame from `bytes`.
///
/// Returns [`RpcError::Incomplete`] when `bytes` is a prefix of a frame.
pub fn decode_call(bytes: &[u8]) -> Result<Call> {
    Call::from_frame(&single_frame(bytes)?)
}

/// Encode a Callback frame carrying either a result or an error message.
///
/// Fails with [`RpcError::Protocol`] if the payload exceeds
/// [`DEFAULT_MAX_PAYLOAD_SIZE`].
pub fn encode_callback(
    message_id: u32,
    outcome: std::result::Result<&Value, &str>,
) -> Result<Bytes> {
    encode_callback_limited(message_id, outcome, DEFAULT_MAX_PAYLOAD_SIZE)
}

/// Encode a Callback frame, refusing payloads above `max_payload_size`.
pub fn encode_callback_limited(
    message_id: u32,
    outcome: std::result::Result<&Value, &str>,
    max_payload_size: u32,
) -> Result<Bytes> {
    let (frame_flags, payload) = match outcome {
        Ok(result) => (flags::CALLBACK, MsgPackCodec::encode(result)?),
        Err(error) => (flags::ERROR_CALLBACK, MsgPackCodec::encode(error)?),
    };
    checked_frame(frame_flags, message_id, &payload, max_payload_size)
}

/// A peer rejects oversized headers and loses the stream position, so the
/// limit is enforced before anything is sent.
fn checked_frame(frame_flags: u8, message_id: u32, payload: &[u8], max_payload_size: u32) -> Result<Bytes> {
    match u32::try_from(payload.len()) {
        Ok(length) if length <= max_payload_size => Ok(build_frame(frame_flags, message_id, payload)),
        _ => Err(RpcError::Protocol(format!(
            "Payload size {} exceeds maximum {}",
            payload.len(),
            max_payload_size
        ))),
    }
}

/// Decode exactly one Callback frame from `bytes`.
///
/// Returns [`RpcError::Incomplete`] when `bytes` is a prefix of a frame.
pub fn decode_callback(bytes: &[u8]) -> Result<Callback> {
    Callback::from_frame(&single_frame(bytes)?)
}

fn single_frame(bytes: &[u8]) -> Result<Frame> {
    let header = Header::decode(bytes).ok_or_else(|| RpcError::Incomplete {
        needed: HEADER_SIZE - bytes.len(),
    })?;
    header.validate(u32::MAX)?;

    let total = header.frame_len();
    if bytes.len() < total {
        return Err(RpcError::Incomplete {
            needed: total - bytes.len(),
        });
    }
    if bytes.len() > total {
        return Err(RpcError::Protocol(format!(
            "{} trailing bytes after frame",
            bytes.len() - total
        )));
    }

    Ok(Frame::new(
        header,
        Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;
    use serde_json::json;

    #[test]
    fn test_call_roundtrip_with_nested_args() {
        let args = vec![json!(1), json!("two"), json!({"three": [3, null, true]})];
        let bytes = encode_call(17, "add", &args).unwrap();

        let call = decode_call(&bytes).unwrap();

        assert_eq!(call, Call::new(17, "add", args));
    }

    #[test]
    fn test_call_roundtrip_without_args() {
        let call = Call::new(0, "ping", vec![]);
        assert_eq!(decode_call(&call.encode().unwrap()).unwrap(), call);
    }

    #[test]
    fn test_callback_result_roundtrip() {
        let bytes = encode_callback(5, Ok(&json!([1, {"a": 2.5}]))).unwrap();
        let callback = decode_callback(&bytes).unwrap();

        assert_eq!(callback.message_id, 5);
        assert_eq!(callback.result(), Some(&json!([1, {"a": 2.5}])));
        assert_eq!(callback.error(), None);
    }

    #[test]
    fn test_callback_null_result_is_not_an_error() {
        let callback = Callback::ok(3, Value::Null);
        let decoded = decode_callback(&callback.encode().unwrap()).unwrap();

        assert_eq!(decoded.outcome, Ok(Value::Null));
    }

    #[test]
    fn test_callback_error_roundtrip() {
        let callback = Callback::err(9, NO_SUCH_METHOD);
        let decoded = decode_callback(&callback.encode().unwrap()).unwrap();

        assert_eq!(decoded.message_id, 9);
        assert_eq!(decoded.error(), Some(NO_SUCH_METHOD));
        assert_eq!(decoded.result(), None);
    }

    #[test]
    fn test_incomplete_is_distinct_from_malformed() {
        let bytes = encode_call(1, "add", &[json!(2), json!(3)]).unwrap();

        let err = decode_call(&bytes[..4]).unwrap_err();
        assert!(matches!(err, RpcError::Incomplete { needed } if needed == HEADER_SIZE - 4));

        let err = decode_call(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, RpcError::Incomplete { needed: 1 }));

        let mut garbage = bytes.to_vec();
        garbage[HEADER_SIZE] = 0xc1;
        assert!(decode_call(&garbage).unwrap_err().is_decode_failure());
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let callback = Callback::ok(1, json!(5)).encode().unwrap();
        assert!(matches!(decode_call(&callback), Err(RpcError::Protocol(_))));

        let call = encode_call(1, "add", &[]).unwrap();
        assert!(matches!(decode_callback(&call), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_call(1, "a", &[]).unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(decode_call(&bytes), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_call_payload_without_args_field() {
        #[derive(Serialize)]
        struct MethodOnly {
            method: &'static str,
        }
        let payload = MsgPackCodec::encode(&MethodOnly { method: "ping" }).unwrap();
        let bytes = build_frame(flags::CALL, 2, &payload);

        let call = decode_call(&bytes).unwrap();
        assert!(call.args.is_empty());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let args = vec![json!("x".repeat(200))];

        let err = encode_call_limited(1, "echo", &args, 100).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(ref msg) if msg.contains("exceeds maximum 100")));
        assert!(encode_call_limited(1, "echo", &args, 1024).is_ok());

        let result = json!("y".repeat(200));
        let err = Callback::ok(2, result.clone()).encode_limited(100).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
        assert!(encode_callback_limited(2, Ok(&result), 1024).is_ok());
    }

    #[test]
    fn test_payload_at_limit_accepted() {
        let payload_len = MsgPackCodec::encode(&json!("abc")).unwrap().len() as u32;

        let bytes = encode_callback_limited(3, Ok(&json!("abc")), payload_len).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + payload_len as usize);
        assert!(encode_callback_limited(3, Ok(&json!("abc")), payload_len - 1).is_err());
    }

    #[test]
    fn test_frames_from_buffer() {
        let mut stream = encode_call(1, "a", &[json!(1)]).unwrap().to_vec();
        stream.extend_from_slice(&Callback::err(1, "boom").encode().unwrap());

        let frames = FrameBuffer::new().push(&stream).unwrap();

        assert_eq!(Call::from_frame(&frames[0]).unwrap().method, "a");
        assert_eq!(
            Callback::from_frame(&frames[1]).unwrap().error(),
            Some("boom")
        );
    }
}
