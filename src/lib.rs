//! # ezrpc
//!
//! Minimal asynchronous RPC over TCP.
//!
//! A [`Server`] exposes named functions; a [`Client`] calls them by name and
//! gets back a correlated result. A [`LoadBalancer`] is a server that relays
//! every method it does not expose itself to one of a pool of backends.
//!
//! ## Architecture
//!
//! - **Wire format**: 9-byte header (flags, message id, length) + MsgPack payload
//! - **Server**: one read loop and one writer task per connection, one task per call
//! - **Client**: pending-call table keyed by message id; callbacks may arrive in any order
//!
//! ## Example
//!
//! ```ignore
//! use ezrpc::handler::Method;
//! use ezrpc::{Client, Server};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> ezrpc::Result<()> {
//!     let server = Server::builder()
//!         .method(Method::sync("add", |(a, b): (i64, i64)| Ok::<_, String>(a + b)))
//!         .bind("127.0.0.1", 1251)
//!         .await?;
//!
//!     let client = Client::connect("127.0.0.1:1251").await?;
//!     assert_eq!(client.call("add", vec![json!(2), json!(3)]).await?, json!(5));
//!
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod codec;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod writer;

mod client;

pub use balancer::{Backend, LoadBalancer, LoadBalancerBuilder, RoundRobin, SelectionPolicy};
pub use client::{Client, ClientBuilder};
pub use error::{Result, RpcError};
pub use server::{Server, ServerBuilder, ServerConfig};
