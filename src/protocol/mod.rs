//! Protocol module - wire format, framing, and messages.
//!
//! - 9-byte header encoding/decoding
//! - Frame buffer for reassembling frames from a byte stream
//! - Call and Callback messages

mod frame;
mod frame_buffer;
mod message;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use message::{
    decode_call, decode_callback, encode_call, encode_call_limited, encode_callback,
    encode_callback_limited, Call, Callback, NO_SUCH_METHOD,
};
pub use wire_format::{flags, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
