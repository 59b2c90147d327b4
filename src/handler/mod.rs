//! Handler module - the method registry and handler adapters.
//!
//! Provides:
//! - [`MethodRegistry`] - maps method names to handlers
//! - [`handler`] / [`sync_handler`] - turn typed functions into handlers
//! - [`Method`] - a named function for bulk registration
//!
//! # Example
//!
//! ```
//! use ezrpc::handler::{sync_handler, MethodRegistry};
//!
//! let registry = MethodRegistry::new();
//! registry
//!     .set("add", sync_handler(|(a, b): (f64, f64)| Ok::<_, String>(a + b)))
//!     .unwrap();
//! registry.delete("add");
//! assert!(registry.is_empty());
//! ```

mod registry;

pub use registry::{
    handler, sync_handler, BoxFuture, Handler, HandlerResult, Method, MethodRegistry,
    SyncHandler, TypedHandler,
};
