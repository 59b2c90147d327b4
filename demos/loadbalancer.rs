//! Load balancer - listens on port 1250 and relays to the `server` demo.
//!
//! Pass a JSON backend list to override the default pool:
//!
//! ```sh
//! cargo run --example loadbalancer -- '[{"host": "localhost", "port": 1251}]'
//! cargo run --example client -- 127.0.0.1:1250
//! ```

use ezrpc::handler::Method;
use ezrpc::{Backend, LoadBalancer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let backends = match std::env::args().nth(1) {
        Some(json) => Backend::parse_list(&json)?,
        None => vec![Backend::new("localhost", 1251)],
    };

    let balancer = LoadBalancer::builder()
        .backends(backends)
        .method(Method::sync("ping", |(): ()| Ok::<_, String>("pong")))
        .bind("0.0.0.0", 1250)
        .await?;

    tracing::info!(addr = %balancer.local_addr(), backends = balancer.backends().len(), "balancing");

    tokio::signal::ctrl_c().await?;
    balancer.shutdown();
    Ok(())
}
