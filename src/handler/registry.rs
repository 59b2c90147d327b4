//! Method registry mapping names to handlers.
//!
//! Every entry is an `Arc<dyn Handler>` whose `call` returns a boxed future,
//! whether the user's function is `async` or not. Synchronous functions are
//! only run when that future is polled, so an `Err` (or a panic) inside them
//! surfaces through the future like any other handler failure.
//!
//! The table lives behind a `RwLock`. Lookups clone the `Arc` out under the
//! read lock, and [`MethodRegistry::replace_all`] swaps the whole map under
//! the write lock, so a dispatch never sees a half-applied mutation.
//!
//! # Example
//!
//! ```
//! use ezrpc::handler::{handler, sync_handler, Method, MethodRegistry};
//!
//! let registry = MethodRegistry::new();
//! registry
//!     .set("add", sync_handler(|(a, b): (i64, i64)| Ok::<_, String>(a + b)))
//!     .unwrap();
//! registry
//!     .add_methods([Method::new("shout", |(s,): (String,)| async move {
//!         Ok::<_, String>(s.to_uppercase())
//!     })])
//!     .unwrap();
//!
//! assert!(registry.contains("add"));
//! assert!(registry.contains("shout"));
//! # let _ = handler(|(): ()| async { Ok::<_, String>(()) });
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, RpcError};

/// Outcome of a handler: the result value, or the failure's message text.
pub type HandlerResult = std::result::Result<Value, String>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Run the handler with positional arguments.
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, HandlerResult>;
}

/// Deserialize the positional argument array into the handler's input type.
///
/// `T` is usually a tuple: `(i64, i64)` takes two arguments, `(String,)`
/// one, `()` none. `Vec<Value>` takes the array as is.
fn parse_args<T: DeserializeOwned>(args: Vec<Value>) -> std::result::Result<T, String> {
    // `()` deserializes from null, not from an empty array.
    if args.is_empty() {
        if let Ok(parsed) = serde_json::from_value(Value::Null) {
            return Ok(parsed);
        }
    }
    serde_json::from_value(Value::Array(args)).map_err(|e| format!("Invalid arguments: {e}"))
}

fn into_outcome<R: Serialize, E: Display>(result: std::result::Result<R, E>) -> HandlerResult {
    match result {
        Ok(value) => serde_json::to_value(value).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Adapter for `async` handler functions.
pub struct TypedHandler<F, T, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut, R, E> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    R: Serialize + 'static,
    E: Display + 'static,
{
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match parse_args(args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(parsed);
        Box::pin(async move { into_outcome(fut.await) })
    }
}

/// Adapter for plain functions; the body runs when the future is polled.
pub struct SyncHandler<F, T> {
    handler: Arc<F>,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T, R, E> Handler for SyncHandler<F, T>
where
    F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    R: Serialize + 'static,
    E: Display + 'static,
{
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, HandlerResult> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let parsed: T = parse_args(args)?;
            into_outcome(handler(parsed))
        })
    }
}

/// Wrap an `async` function as a handler.
pub fn handler<F, T, Fut, R, E>(f: F) -> Arc<dyn Handler>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    R: Serialize + 'static,
    E: Display + 'static,
{
    Arc::new(TypedHandler {
        handler: f,
        _phantom: PhantomData,
    })
}

/// Wrap a synchronous function as a handler.
pub fn sync_handler<F, T, R, E>(f: F) -> Arc<dyn Handler>
where
    F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    R: Serialize + 'static,
    E: Display + 'static,
{
    Arc::new(SyncHandler {
        handler: Arc::new(f),
        _phantom: PhantomData,
    })
}

/// A named function, the unit accepted by [`MethodRegistry::add_methods`].
#[derive(Clone)]
pub struct Method {
    name: String,
    handler: Arc<dyn Handler>,
}

impl Method {
    /// Name an `async` function.
    pub fn new<F, T, Fut, R, E>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + 'static,
        E: Display + 'static,
    {
        Self::from_handler(name, handler(f))
    }

    /// Name a synchronous function.
    pub fn sync<F, T, R, E>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
        R: Serialize + 'static,
        E: Display + 'static,
    {
        Self::from_handler(name, sync_handler(f))
    }

    /// Name an existing handler.
    pub fn from_handler(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method").field("name", &self.name).finish()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn check_named(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RpcError::InvalidHandler("function must be named".to_string()));
    }
    Ok(())
}

fn check_identifier(name: &str) -> Result<()> {
    check_named(name)?;
    if !is_identifier(name) {
        return Err(RpcError::InvalidHandler(format!(
            "invalid method name {name:?}"
        )));
    }
    Ok(())
}

type MethodTable = HashMap<String, Arc<dyn Handler>>;

fn collect_map<I, K>(map: I) -> Result<MethodTable>
where
    I: IntoIterator<Item = (K, Arc<dyn Handler>)>,
    K: Into<String>,
{
    let mut table = MethodTable::new();
    for (name, handler) in map {
        let name = name.into();
        check_named(&name)?;
        table.insert(name, handler);
    }
    Ok(table)
}

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<MethodTable>,
}

impl MethodRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `handler` as `name`, replacing any previous entry.
    pub fn set(&self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Result<()> {
        let name = name.into();
        check_named(&name)?;
        tracing::debug!(method = %name, "method exposed");
        self.methods.write().insert(name, handler);
        Ok(())
    }

    /// Un-expose `name`. Returns whether an entry was removed.
    pub fn delete(&self, name: &str) -> bool {
        let removed = self.methods.write().remove(name).is_some();
        if removed {
            tracing::debug!(method = %name, "method removed");
        }
        removed
    }

    /// Expose named functions.
    ///
    /// All names are validated before anything is inserted.
    pub fn add_methods(&self, methods: impl IntoIterator<Item = Method>) -> Result<()> {
        let methods: Vec<Method> = methods.into_iter().collect();
        for method in &methods {
            check_identifier(&method.name)?;
        }

        let mut table = self.methods.write();
        for method in methods {
            tracing::debug!(method = %method.name, "method exposed");
            table.insert(method.name, method.handler);
        }
        Ok(())
    }

    /// Expose every `name → handler` pair of a mapping.
    pub fn add_method_map<I, K>(&self, map: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Arc<dyn Handler>)>,
        K: Into<String>,
    {
        let table = collect_map(map)?;
        self.methods.write().extend(table);
        Ok(())
    }

    /// Un-expose methods by name. Unknown names are ignored.
    ///
    /// Returns how many entries were actually removed.
    pub fn remove_methods<I, S>(&self, names: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<S> = names.into_iter().collect();
        if names.is_empty() {
            return Err(RpcError::EmptyArgument(
                "provide named functions or function names".to_string(),
            ));
        }
        for name in &names {
            check_named(name.as_ref())?;
        }

        let mut table = self.methods.write();
        Ok(names
            .iter()
            .filter(|name| table.remove(name.as_ref()).is_some())
            .count())
    }

    /// Replace the whole table with `map`.
    ///
    /// The new table is validated first; on error the registry is unchanged.
    pub fn replace_all<I, K>(&self, map: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Arc<dyn Handler>)>,
        K: Into<String>,
    {
        let table = collect_map(map)?;
        let count = table.len();
        *self.methods.write() = table;
        tracing::debug!(methods = count, "method table replaced");
        Ok(())
    }

    /// Get a handler by method name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.methods.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    /// Sorted list of exposed method names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.read().is_empty()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}
