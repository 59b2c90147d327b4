//! Load balancer: a server that relays unknown methods to a backend pool.
//!
//! ```text
//!  caller ── Call(id 9, "add") ──► LoadBalancer
//!                                     │ registry miss
//!                                     ▼
//!                             SelectionPolicy → backend[i]
//!                                     │ Client::call (backend-scoped id)
//!                                     ▼
//!  caller ◄─ Callback(id 9, ...) ── result or error text, verbatim
//! ```
//!
//! Methods registered on the balancer itself are answered locally and never
//! relayed. Each backend has one lazily connected [`Client`], shared by every
//! inbound connection and replaced once it closes.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::client::{Client, ClientBuilder};
use crate::error::{Result, RpcError};
use crate::handler::{BoxFuture, HandlerResult, Method, MethodRegistry};
use crate::server::{Fallback, Server, ServerBuilder};

/// Default bound on connecting to a backend.
pub const DEFAULT_BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Address of a pooled backend server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Backend {
    pub host: String,
    pub port: u16,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a JSON array of `{"host": ..., "port": ...}` objects.
    pub fn parse_list(json: &str) -> Result<Vec<Backend>> {
        Ok(serde_json::from_str(json)?)
    }

    fn addr(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Chooses the backend for each relayed call.
pub trait SelectionPolicy: Send + Sync + 'static {
    /// Index into `backends`, which is never empty.
    fn select(&self, backends: &[Backend]) -> usize;
}

/// Cycle through the pool in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for RoundRobin {
    fn select(&self, backends: &[Backend]) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % backends.len()
    }
}

/// Backends plus one cached client slot each.
struct BackendPool {
    backends: Vec<Backend>,
    slots: Vec<Mutex<Option<Arc<Client>>>>,
    policy: Box<dyn SelectionPolicy>,
    client: ClientBuilder,
}

impl BackendPool {
    fn new(backends: Vec<Backend>, policy: Box<dyn SelectionPolicy>, client: ClientBuilder) -> Result<Self> {
        if backends.is_empty() {
            return Err(RpcError::InvalidArgument(
                "Provide at least one backend!".to_string(),
            ));
        }
        let slots = backends.iter().map(|_| Mutex::new(None)).collect();
        Ok(Self {
            backends,
            slots,
            policy,
            client,
        })
    }

    /// The cached client for `index`, connecting if there is none or the
    /// cached one has closed.
    async fn client(&self, index: usize) -> Result<Arc<Client>> {
        // Held across the connect so concurrent calls share one connection.
        let mut slot = self.slots[index].lock().await;
        if let Some(client) = slot.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            tracing::debug!(backend = %self.backends[index], "backend connection closed, reconnecting");
        }

        let client = Arc::new(self.client.clone().connect(self.backends[index].addr()).await?);
        tracing::debug!(backend = %self.backends[index], "connected to backend");
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn relay(&self, method: String, args: Vec<Value>) -> HandlerResult {
        let index = self.policy.select(&self.backends) % self.backends.len();
        let backend = &self.backends[index];
        tracing::debug!(%backend, %method, "relaying call");

        let result = match self.client(index).await {
            Ok(client) => client.call(&method, args).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => Ok(value),
            Err(RpcError::Remote(message)) => Err(message),
            Err(e) => {
                tracing::warn!(%backend, %method, error = %e, "relay failed");
                Err(e.to_string())
            }
        }
    }
}

impl Fallback for BackendPool {
    fn call(self: Arc<Self>, method: String, args: Vec<Value>) -> BoxFuture<'static, HandlerResult> {
        Box::pin(async move { self.relay(method, args).await })
    }
}

/// Builder for configuring and starting a [`LoadBalancer`].
pub struct LoadBalancerBuilder {
    server: ServerBuilder,
    backends: Vec<Backend>,
    policy: Box<dyn SelectionPolicy>,
    client: ClientBuilder,
}

impl LoadBalancerBuilder {
    pub fn new() -> Self {
        Self {
            server: ServerBuilder::new(),
            backends: Vec::new(),
            policy: Box::new(RoundRobin::new()),
            client: ClientBuilder::new().connect_timeout(DEFAULT_BACKEND_CONNECT_TIMEOUT),
        }
    }

    /// Add a backend to the pool.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backends.push(backend);
        self
    }

    /// Add several backends to the pool.
    pub fn backends(mut self, backends: impl IntoIterator<Item = Backend>) -> Self {
        self.backends.extend(backends);
        self
    }

    /// Replace the backend selection policy.
    ///
    /// Default: [`RoundRobin`]
    pub fn policy(mut self, policy: impl SelectionPolicy) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Settings for the backend connections (e.g. a call timeout).
    ///
    /// Default: [`ClientBuilder`] defaults with a 5 s connect timeout
    pub fn client(mut self, client: ClientBuilder) -> Self {
        self.client = client;
        self
    }

    /// Answer `method` locally instead of relaying it.
    pub fn method(mut self, method: Method) -> Self {
        self.server = self.server.method(method);
        self
    }

    /// See [`ServerBuilder::max_concurrent_handlers`].
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.server = self.server.max_concurrent_handlers(limit);
        self
    }

    /// See [`ServerBuilder::channel_capacity`].
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.server = self.server.channel_capacity(capacity);
        self
    }

    /// See [`ServerBuilder::max_payload_size`].
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.server = self.server.max_payload_size(size);
        self
    }

    /// Bind `host:port` and start relaying.
    pub async fn bind(self, host: &str, port: u16) -> Result<LoadBalancer> {
        let (server, pool) = self.prepare()?;
        let server = server.bind(host, port).await?;
        Ok(LoadBalancer { server, pool })
    }

    /// Serve an already-bound listener.
    pub fn serve(self, listener: TcpListener) -> Result<LoadBalancer> {
        let (server, pool) = self.prepare()?;
        let server = server.serve(listener)?;
        Ok(LoadBalancer { server, pool })
    }

    fn prepare(self) -> Result<(ServerBuilder, Arc<BackendPool>)> {
        let pool = Arc::new(BackendPool::new(self.backends, self.policy, self.client)?);
        let server = self.server.fallback(pool.clone());
        Ok((server, pool))
    }
}

impl Default for LoadBalancerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A server that relays methods it does not expose to a pool of backends.
pub struct LoadBalancer {
    server: Server,
    pool: Arc<BackendPool>,
}

impl LoadBalancer {
    pub fn builder() -> LoadBalancerBuilder {
        LoadBalancerBuilder::new()
    }

    /// Bind `host:port` in front of `backends` with round-robin selection.
    pub async fn bind(backends: Vec<Backend>, host: &str, port: u16) -> Result<Self> {
        LoadBalancerBuilder::new().backends(backends).bind(host, port).await
    }

    /// Serve an already-bound listener in front of `backends`.
    pub fn serve(listener: TcpListener, backends: Vec<Backend>) -> Result<Self> {
        LoadBalancerBuilder::new().backends(backends).serve(listener)
    }

    /// Locally answered methods.
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        self.server.registry()
    }

    pub fn backends(&self) -> &[Backend] {
        &self.pool.backends
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    /// Stop accepting and close every inbound connection.
    pub fn shutdown(&self) {
        self.server.shutdown();
    }

    /// Wait until [`shutdown`](Self::shutdown) is called.
    pub async fn stopped(&self) {
        self.server.stopped().await;
    }
}
