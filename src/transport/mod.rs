//! Transport module - TCP sockets.

mod tcp;

pub use tcp::{connect, Listener};
