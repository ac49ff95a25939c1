//! Echo - round-trip a payload through a job server.
//!
//! This example demonstrates:
//! - Building a client and connecting to one server
//! - Sending ECHO_REQ and reading the ECHO_RES payload
//!
//! # Running
//!
//! ```sh
//! gearmand --port 4730 &
//! RUST_LOG=gearwire=debug cargo run --example echo -- 127.0.0.1:4730 hello
//! ```

use gearwire::{Client, ServerAddr};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let server: ServerAddr = match args.next() {
        Some(addr) => addr.parse()?,
        None => ServerAddr::default(),
    };
    let payload = args.next().unwrap_or_else(|| "ping".to_string());

    let client = Client::builder().server(server).connect().await?;
    let reply = client.echo(payload).await?;
    println!("{}", String::from_utf8_lossy(&reply));

    client.shutdown().await;
    Ok(())
}
