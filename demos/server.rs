//! Math server - exposes a few functions on port 1251.
//!
//! This demo shows:
//! - Registering sync and async methods with the builder
//! - Adding a method after the server is listening
//!
//! ```sh
//! RUST_LOG=ezrpc=debug cargo run --example server
//! ```

use std::time::Duration;

use ezrpc::handler::Method;
use ezrpc::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = Server::builder()
        .method(Method::sync("add", |(a, b): (f64, f64)| Ok::<_, String>(a + b)))
        .method(Method::new("slowAdd", |(a, b): (f64, f64)| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, String>(a + b)
        }))
        .bind("0.0.0.0", 1251)
        .await?;

    server
        .registry()
        .add_methods([Method::sync("divide", |(a, b): (f64, f64)| {
            if b == 0.0 {
                Err("Cannot divide by zero")
            } else {
                Ok(a / b)
            }
        })])?;

    tracing::info!(methods = ?server.registry().names(), "serving");

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    Ok(())
}
