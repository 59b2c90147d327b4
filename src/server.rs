//! RPC server: accept loop, per-connection read loop and call dispatch.
//!
//! Lifecycle of a [`Server`]:
//! 1. Bind the listener (port validated)
//! 2. Spawn the accept loop
//! 3. Per connection: spawn a writer task and run a read loop that
//!    reassembles frames and dispatches each Call
//! 4. [`Server::shutdown`] (or dropping the server) stops accepting and ends
//!    every read loop
//!
//! Each Call runs in its own task, so a slow handler never holds up other
//! calls on the same connection, and Callbacks go out in completion order.
//!
//! # Example
//!
//! ```ignore
//! use ezrpc::handler::Method;
//! use ezrpc::Server;
//!
//! #[tokio::main]
//! async fn main() -> ezrpc::Result<()> {
//!     let server = Server::builder()
//!         .method(Method::sync("add", |(a, b): (i64, i64)| Ok::<_, String>(a + b)))
//!         .bind("0.0.0.0", 1251)
//!         .await?;
//!
//!     server.stopped().await;
//!     Ok(())
//! }
//! ```

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::Result;
use crate::handler::{BoxFuture, Handler, HandlerResult, Method, MethodRegistry};
use crate::protocol::{Call, Callback, Frame, FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE, NO_SUCH_METHOD};
use crate::transport::Listener;
use crate::writer::{spawn_writer_task, WriterHandle, DEFAULT_CHANNEL_CAPACITY};

/// Default maximum concurrently running handlers per server.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Size of the per-connection read buffer.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Handles calls whose method is not in the registry.
///
/// The registry is always consulted first; a fallback only ever sees
/// methods the server does not expose itself.
pub trait Fallback: Send + Sync + 'static {
    fn call(self: Arc<Self>, method: String, args: Vec<Value>) -> BoxFuture<'static, HandlerResult>;
}

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Handlers allowed to run at once; the read loop waits for a slot.
    pub max_concurrent_handlers: usize,
    /// Frames queued per connection writer.
    pub channel_capacity: usize,
    /// Largest accepted Call payload.
    pub max_payload_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Builder for configuring and starting a [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    methods: Vec<Method>,
    fallback: Option<Arc<dyn Fallback>>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a named function from the start.
    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    /// Expose several named functions from the start.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods.extend(methods);
        self
    }

    /// Set the maximum number of concurrently running handlers.
    ///
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit.max(1);
        self
    }

    /// Set the per-connection writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set the largest accepted payload.
    ///
    /// Default: 16 MiB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Route calls for unregistered methods to `fallback` instead of
    /// answering "No such method!".
    pub fn fallback(mut self, fallback: Arc<dyn Fallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Bind `host:port` and start serving.
    pub async fn bind(self, host: &str, port: u16) -> Result<Server> {
        let listener = Listener::bind(host, port).await?;
        self.start(listener)
    }

    /// Serve an already-bound listener (e.g. one bound to port 0).
    pub fn serve(self, listener: TcpListener) -> Result<Server> {
        self.start(Listener::from_tokio(listener))
    }

    fn start(self, listener: Listener) -> Result<Server> {
        let registry = Arc::new(MethodRegistry::new());
        registry.add_methods(self.methods)?;

        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            registry: registry.clone(),
            fallback: self.fallback,
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrent_handlers)),
            config: self.config,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, shared, shutdown_rx));
        tracing::info!(addr = %local_addr, "server listening");

        Ok(Server {
            registry,
            local_addr,
            shutdown_tx,
        })
    }
}

/// State shared by the accept loop and every connection.
struct Shared {
    registry: Arc<MethodRegistry>,
    fallback: Option<Arc<dyn Fallback>>,
    semaphore: Arc<Semaphore>,
    config: ServerConfig,
}

/// A listening RPC server.
///
/// Dropping the server stops it.
pub struct Server {
    registry: Arc<MethodRegistry>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind `host:port` with default settings and start serving.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        ServerBuilder::new().bind(host, port).await
    }

    /// Serve an already-bound listener with default settings.
    pub fn serve(listener: TcpListener) -> Result<Self> {
        ServerBuilder::new().serve(listener)
    }

    /// The registry of exposed methods. Mutations apply to calls dispatched
    /// afterwards, on every connection.
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    /// Replace every exposed method with `methods` in one step.
    pub fn set_exports<I, K>(&self, methods: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Arc<dyn Handler>)>,
        K: Into<String>,
    {
        self.registry.replace_all(methods)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stop accepting and close every connection. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            tracing::info!(addr = %self.local_addr, "server stopped");
        }
    }

    /// Wait until [`shutdown`](Self::shutdown) is called.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: Listener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => return,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "connection accepted");
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    shared.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (reader, write_half) = stream.into_split();
    let (writer, _writer_task) = spawn_writer_task(write_half, shared.config.channel_capacity);
    let mut calls = JoinSet::new();

    // Socket errors only end this connection.
    match read_loop(reader, peer, &shared, &writer, &mut calls, &mut shutdown).await {
        Ok(()) => tracing::debug!(%peer, "connection closed"),
        Err(e) => tracing::debug!(%peer, error = %e, "connection error"),
    }

    // The connection is gone: abandon its in-flight calls. Their permits and
    // writer handles are released as they are cancelled.
    if !calls.is_empty() {
        tracing::debug!(%peer, abandoned = calls.len(), "aborting in-flight calls");
    }
    calls.abort_all();
}

/// Read frames until EOF or shutdown, dispatching each complete Call.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    peer: SocketAddr,
    shared: &Arc<Shared>,
    writer: &WriterHandle,
    calls: &mut JoinSet<()>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut frame_buffer = FrameBuffer::with_max_payload(shared.config.max_payload_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut frames = Vec::new();

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => read?,
            Some(_) = calls.join_next(), if !calls.is_empty() => continue,
            _ = shutdown.changed() => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }

        let pushed = frame_buffer.push_into(&buf[..n], &mut frames);
        for frame in frames.drain(..) {
            dispatch_frame(frame, peer, shared, writer, calls).await;
        }

        if let Err(e) = pushed {
            // No way to find the next frame boundary; drop what we have.
            tracing::warn!(%peer, error = %e, "discarding undecodable input");
            frame_buffer.clear();
        }
    }
}

/// Dispatch a single frame.
async fn dispatch_frame(
    frame: Frame,
    peer: SocketAddr,
    shared: &Arc<Shared>,
    writer: &WriterHandle,
    calls: &mut JoinSet<()>,
) {
    if frame.is_callback() {
        tracing::warn!(%peer, message_id = frame.message_id(), "unexpected callback frame");
        return;
    }

    let call = match Call::from_frame(&frame) {
        Ok(call) => call,
        Err(e) => {
            tracing::warn!(%peer, message_id = frame.message_id(), error = %e, "dropping undecodable call");
            return;
        }
    };

    let Call {
        message_id,
        method,
        args,
    } = call;
    let limit = shared.config.max_payload_size;

    // Local methods always win over the fallback.
    let target = match (shared.registry.get(&method), &shared.fallback) {
        (Some(handler), _) => Target::Local(handler),
        (None, Some(fallback)) => Target::Fallback(fallback.clone()),
        (None, None) => {
            tracing::debug!(%peer, message_id, %method, "no such method");
            send_callback(writer, Callback::err(message_id, NO_SUCH_METHOD), limit).await;
            return;
        }
    };

    let permit = match shared.semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let writer = writer.clone();
    calls.spawn(async move {
        let _permit = permit;
        tracing::debug!(%peer, message_id, %method, "dispatching call");

        let outcome = match target {
            Target::Local(handler) => isolate(async move { handler.call(args).await }).await,
            Target::Fallback(fallback) => fallback.call(method, args).await,
        };

        send_callback(&writer, Callback { message_id, outcome }, limit).await;
    });
}

enum Target {
    Local(Arc<dyn Handler>),
    Fallback(Arc<dyn Fallback>),
}

/// Run a handler in its own task so that a panic becomes a failure message.
async fn isolate<F>(fut: F) -> HandlerResult
where
    F: Future<Output = HandlerResult> + Send + 'static,
{
    let mut task = AbortOnDrop(tokio::spawn(fut));
    match (&mut task.0).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(panic_message(e.into_panic())),
        Err(_) => Err("Handler cancelled".to_string()),
    }
}

/// Aborts the handler task when the dispatching call is cancelled.
struct AbortOnDrop(JoinHandle<HandlerResult>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Handler panicked".to_string()
    }
}

/// Encode and queue a Callback. A closed connection is not an error here:
/// the caller is gone and the result is discarded.
async fn send_callback(writer: &WriterHandle, callback: Callback, max_payload_size: u32) {
    let message_id = callback.message_id;
    let bytes = match callback.encode_limited(max_payload_size) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(message_id, error = %e, "failed to encode callback");
            match Callback::err(message_id, e.to_string()).encode_limited(max_payload_size) {
                Ok(bytes) => bytes,
                Err(_) => return,
            }
        }
    };

    if writer.send(bytes).await.is_err() {
        tracing::debug!(message_id, "connection gone, dropping callback");
    }
}
