//! Client - calls the math server from the `server` demo.
//!
//! ```sh
//! cargo run --example client
//! ```

use ezrpc::Client;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:1251".to_string());
    let client = Client::connect(addr.as_str()).await?;

    let sum = client.call("add", vec![json!(2), json!(3)]).await?;
    println!("add(2, 3) = {sum}");

    // Both calls are in flight at once; the fast one returns first.
    let (slow, fast) = tokio::join!(
        client.invoke::<_, f64>("slowAdd", (1, 1)),
        client.invoke::<_, f64>("add", (10, 10)),
    );
    println!("slowAdd(1, 1) = {}, add(10, 10) = {}", slow?, fast?);

    match client.call("divide", vec![json!(1), json!(0)]).await {
        Ok(value) => println!("divide(1, 0) = {value}"),
        Err(e) => println!("divide(1, 0) failed: {e}"),
    }

    match client.call("multiply", vec![json!(2), json!(2)]).await {
        Ok(value) => println!("multiply(2, 2) = {value}"),
        Err(e) => println!("multiply(2, 2) failed: {e}"),
    }

    Ok(())
}
