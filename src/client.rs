//! RPC client: request/response correlation over one connection.
//!
//! ```text
//!  call("add", [2, 3])                         read loop
//!        │                                         │
//!        ├─ register id 7 ─► pending: {7 → tx} ◄───┤ Callback(7, 5)
//!        ├─ Call(7) ─► writer task ─► socket       │   remove 7, tx.send(5)
//!        └─ await rx ◄─────────────────────────────┘
//! ```
//!
//! Callbacks are matched purely by message id, so the server may answer in
//! any order. A call whose future is dropped (or that times out) removes its
//! own pending entry; a late Callback for it is ignored. When the connection
//! ends every pending call fails with [`RpcError::ConnectionClosed`].
//!
//! # Example
//!
//! ```ignore
//! use ezrpc::Client;
//! use serde_json::json;
//!
//! let client = Client::connect("127.0.0.1:1251").await?;
//! let sum = client.call("add", vec![json!(2), json!(3)]).await?;
//! let typed: i64 = client.invoke("add", (2, 3)).await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::ToSocketAddrs;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Result, RpcError};
use crate::handler::HandlerResult;
use crate::protocol::{encode_call_limited, Callback, FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::transport;
use crate::writer::{spawn_writer_task, WriterHandle, DEFAULT_CHANNEL_CAPACITY};

/// Size of the client read buffer.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Builder for configuring and connecting a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    channel_capacity: usize,
    max_payload_size: u32,
    call_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            call_timeout: None,
            connect_timeout: None,
        }
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the largest Call payload sent and Callback payload accepted.
    /// Calls above the limit fail locally instead of being sent.
    ///
    /// Default: 16 MiB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Fail calls that get no Callback within `timeout`.
    ///
    /// Default: no timeout
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Fail [`connect`](Self::connect) if the TCP handshake takes longer
    /// than `timeout`.
    ///
    /// Default: no timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Connect over TCP.
    pub async fn connect<A: ToSocketAddrs>(self, addr: A) -> Result<Client> {
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, transport::connect(addr))
                .await
                .map_err(|_| RpcError::Timeout)??,
            None => transport::connect(addr).await?,
        };
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        tracing::debug!(?peer, "client connected");
        Ok(self.start(reader, writer))
    }

    /// Run the client over any byte stream (e.g. `tokio::io::duplex`).
    pub fn from_stream<S>(self, stream: S) -> Client
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.start(reader, writer)
    }

    fn start<R, W>(self, reader: R, writer: W) -> Client
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, _writer_task) = spawn_writer_task(writer, self.channel_capacity);
        let pending = Arc::new(PendingCalls::default());

        let read_task = tokio::spawn(read_loop(reader, pending.clone(), self.max_payload_size));

        Client {
            pending,
            writer,
            call_timeout: self.call_timeout,
            max_payload_size: self.max_payload_size,
            read_task,
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending call table: message id → waiter.
#[derive(Default)]
struct PendingCalls {
    inner: Mutex<PendingInner>,
    closed: AtomicBool,
}

#[derive(Default)]
struct PendingInner {
    next_id: u32,
    waiters: HashMap<u32, oneshot::Sender<HandlerResult>>,
}

impl PendingCalls {
    /// Allocate an id unique among pending calls and register a waiter.
    fn register(&self) -> Result<(u32, oneshot::Receiver<HandlerResult>)> {
        let mut inner = self.inner.lock();
        // Checked under the lock so a concurrent close cannot strand the waiter.
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }

        let mut id = inner.next_id;
        while inner.waiters.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, tx);
        Ok((id, rx))
    }

    fn remove(&self, id: u32) {
        self.inner.lock().waiters.remove(&id);
    }

    fn resolve(&self, callback: Callback) {
        let waiter = self.inner.lock().waiters.remove(&callback.message_id);
        match waiter {
            Some(tx) => {
                // The caller may have given up in the meantime.
                let _ = tx.send(callback.outcome);
            }
            None => {
                tracing::debug!(message_id = callback.message_id, "callback for unknown message id");
            }
        }
    }

    /// Mark closed and fail every pending call.
    fn close(&self) {
        let mut inner = self.inner.lock();
        self.closed.store(true, Ordering::Release);
        let abandoned = inner.waiters.len();
        inner.waiters.clear();
        if abandoned > 0 {
            tracing::debug!(abandoned, "connection closed with pending calls");
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

/// Removes a pending entry when a call is abandoned before its Callback.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: u32,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.remove(self.id);
        }
    }
}

/// A connection to an RPC server.
///
/// `Client` is `Send + Sync`; share it behind an `Arc` to issue concurrent
/// calls over the same connection. Dropping it closes the connection.
pub struct Client {
    pending: Arc<PendingCalls>,
    writer: WriterHandle,
    call_timeout: Option<Duration>,
    max_payload_size: u32,
    read_task: JoinHandle<()>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect with default settings.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        ClientBuilder::new().connect(addr).await
    }

    /// Call `method` with positional `args` and wait for its Callback.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Remote`] with the server's error text (e.g. `"No such method!"`)
    /// - [`RpcError::ConnectionClosed`] if the connection ends first
    /// - [`RpcError::Timeout`] if a call timeout is configured and expires
    /// - [`RpcError::Protocol`] if the encoded Call exceeds the payload limit
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let (message_id, rx) = self.pending.register()?;
        let mut guard = PendingGuard {
            pending: &self.pending,
            id: message_id,
            armed: true,
        };

        let frame = encode_call_limited(message_id, method, &args, self.max_payload_size)?;
        tracing::trace!(message_id, method, "sending call");
        self.writer.send(frame).await?;

        let received = match self.call_timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| RpcError::Timeout)?,
            None => rx.await,
        };
        guard.armed = false;

        match received {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(RpcError::Remote(message)),
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Typed call: `args` serializes to the argument list (use a tuple),
    /// the result deserializes into `R`.
    pub async fn invoke<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = match serde_json::to_value(args)? {
            Value::Array(args) => args,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Number of calls waiting for a Callback.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// True once the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.pending.closed.load(Ordering::Acquire) || self.writer.is_closed()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.read_task.abort();
        self.pending.close();
    }
}

async fn read_loop<R>(mut reader: R, pending: Arc<PendingCalls>, max_payload_size: u32)
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut frames = Vec::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "client read failed");
                break;
            }
        };

        let pushed = frame_buffer.push_into(&buf[..n], &mut frames);
        for frame in frames.drain(..) {
            match Callback::from_frame(&frame) {
                Ok(callback) => pending.resolve(callback),
                Err(e) => {
                    tracing::warn!(message_id = frame.message_id(), error = %e, "ignoring frame");
                }
            }
        }

        if let Err(e) = pushed {
            // Later callbacks can no longer be matched reliably.
            tracing::warn!(error = %e, "undecodable input from server, closing");
            break;
        }
    }

    pending.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_call, Call, HEADER_SIZE};
    use serde_json::json;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    async fn read_call(server: &mut DuplexStream) -> Call {
        let mut header = [0u8; HEADER_SIZE];
        server.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        let mut frame = header.to_vec();
        frame.resize(HEADER_SIZE + len, 0);
        server.read_exact(&mut frame[HEADER_SIZE..]).await.unwrap();
        decode_call(&frame).unwrap()
    }

    #[test]
    fn test_register_skips_pending_ids() {
        let pending = PendingCalls::default();
        pending.inner.lock().next_id = u32::MAX;

        let (a, _rx_a) = pending.register().unwrap();
        let (b, _rx_b) = pending.register().unwrap();
        assert_eq!((a, b), (u32::MAX, 0));

        // Wrap around onto ids that are still pending.
        pending.inner.lock().next_id = u32::MAX;
        let (c, _rx_c) = pending.register().unwrap();
        assert_eq!(c, 1);
    }

    #[test]
    fn test_register_after_close_fails() {
        let pending = PendingCalls::default();
        pending.close();
        assert!(matches!(pending.register(), Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_out_of_order_callbacks() {
        let (client_io, mut server) = duplex(4096);
        let client = Arc::new(Client::builder().from_stream(client_io));

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.call("slow", vec![json!(1)]).await }
        });
        let call_a = read_call(&mut server).await;
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.call("fast", vec![json!(2)]).await }
        });
        let call_b = read_call(&mut server).await;
        assert_ne!(call_a.message_id, call_b.message_id);

        // Answer the second call first.
        server
            .write_all(&Callback::ok(call_b.message_id, json!("b")).encode().unwrap())
            .await
            .unwrap();
        server
            .write_all(&Callback::err(call_a.message_id, "a failed").encode().unwrap())
            .await
            .unwrap();

        assert_eq!(second.await.unwrap().unwrap(), json!("b"));
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Remote(msg) if msg == "a failed"));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_invoke_typed() {
        let (client_io, mut server) = duplex(4096);
        let client = Client::builder().from_stream(client_io);

        let answer = tokio::spawn(async move {
            let call = read_call(&mut server).await;
            assert_eq!(call.method, "add");
            assert_eq!(call.args, vec![json!(2), json!(3)]);
            server
                .write_all(&Callback::ok(call.message_id, json!(5)).encode().unwrap())
                .await
                .unwrap();
            server
        });

        let sum: i64 = client.invoke("add", (2, 3)).await.unwrap();
        assert_eq!(sum, 5);
        drop(answer.await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (client_io, _server) = duplex(4096);
        let client = Client::builder()
            .call_timeout(Duration::from_millis(20))
            .from_stream(client_io);

        let err = client.call("never", vec![]).await.unwrap_err();

        assert!(matches!(err, RpcError::Timeout));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_dropped_call_removes_pending_entry() {
        let (client_io, _server) = duplex(4096);
        let client = Client::builder().from_stream(client_io);

        let call = client.call("never", vec![]);
        let _ = tokio::time::timeout(Duration::from_millis(20), call).await;

        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_calls() {
        let (client_io, mut server) = duplex(4096);
        let client = Arc::new(Client::builder().from_stream(client_io));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("hang", vec![]).await }
        });
        read_call(&mut server).await;
        drop(server);

        assert!(matches!(
            call.await.unwrap(),
            Err(RpcError::ConnectionClosed)
        ));
        assert!(client.is_closed());
        assert!(matches!(
            client.call("again", vec![]).await,
            Err(RpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_call_fails_locally() {
        let (client_io, mut server) = duplex(4096);
        let client = Client::builder().max_payload_size(64).from_stream(client_io);

        let err = client
            .call("echo", vec![json!("x".repeat(1000))])
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Protocol(_)));
        assert_eq!(client.pending_calls(), 0);
        assert!(!client.is_closed());

        // Nothing reached the wire.
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(50), server.read(&mut byte)).await;
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn test_callback_before_garbage_still_resolves() {
        let (client_io, mut server) = duplex(4096);
        let client = Arc::new(Client::builder().from_stream(client_io));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("echo", vec![json!("ok")]).await }
        });
        let received = read_call(&mut server).await;

        let mut chunk = Callback::ok(received.message_id, json!("ok")).encode().unwrap().to_vec();
        chunk.extend_from_slice(&[0xFF; HEADER_SIZE]);
        server.write_all(&chunk).await.unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Non-routable address: the handshake never completes (or fails fast
        // where the network is unreachable).
        let connecting = Client::builder()
            .connect_timeout(Duration::from_millis(100))
            .connect("10.255.255.1:9");

        let result = tokio::time::timeout(Duration::from_secs(5), connecting)
            .await
            .expect("connect_timeout did not bound the handshake");

        assert!(matches!(result, Err(RpcError::Timeout) | Err(RpcError::Io(_))));
    }

    #[tokio::test]
    async fn test_unknown_callback_ignored() {
        let (client_io, mut server) = duplex(4096);
        let client = Arc::new(Client::builder().from_stream(client_io));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("echo", vec![json!("x")]).await }
        });
        let received = read_call(&mut server).await;

        server
            .write_all(&Callback::ok(received.message_id.wrapping_add(100), json!("stray")).encode().unwrap())
            .await
            .unwrap();
        server
            .write_all(&Callback::ok(received.message_id, json!("x")).encode().unwrap())
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!("x"));
    }
}
