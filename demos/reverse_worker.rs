//! Reverse Worker - registers `reverse` and serves jobs until Ctrl-C.
//!
//! This example demonstrates:
//! - Registering a job function with the builder
//! - Reporting progress and partial data from inside a job
//! - Running jobs on a bounded pool and stopping gracefully
//!
//! # Running
//!
//! ```sh
//! gearmand --port 4730 &
//! RUST_LOG=info cargo run --example reverse_worker
//! cargo run --example reverse_client -- "hello world"
//! ```

use std::sync::Arc;

use gearwire::handler::{FunctionResult, JobContext, JobOutcome};
use gearwire::{ServerAddr, Worker};
use tracing::info;
use tracing_subscriber::EnvFilter;

async fn reverse(ctx: JobContext) -> FunctionResult {
    let data = ctx.data();
    if data.is_empty() {
        ctx.send_warning("empty input")?;
        return Ok(JobOutcome::Fail);
    }

    let mut reversed = Vec::with_capacity(data.len());
    for (i, byte) in data.iter().rev().enumerate() {
        reversed.push(*byte);
        ctx.send_status(i as u64 + 1, data.len() as u64)?;
    }
    Ok(JobOutcome::complete(reversed))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server: ServerAddr = match std::env::args().nth(1) {
        Some(addr) => addr.parse()?,
        None => ServerAddr::default(),
    };

    let worker = Arc::new(
        Worker::builder()
            .worker_id("reverse-demo")
            .server(server)
            .function("reverse", 0, reverse)
            .pooled(4)
            .build(),
    );
    let connected = worker.connect().await;
    info!("Connected to {} server(s)", connected);

    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.work().await }
    });

    tokio::signal::ctrl_c().await?;
    info!("Stopping worker");
    worker.shutdown().await;
    running.await??;
    Ok(())
}
