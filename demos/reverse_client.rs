//! Reverse Client - submits a `reverse` job and prints the result.
//!
//! This example demonstrates:
//! - Submitting a foreground job with a priority
//! - Waiting for completion and reading progress and warnings
//! - Querying job status and submitting a background job
//!
//! Start `reverse_worker` first (see its docs).

use std::time::Duration;

use gearwire::{Client, Job, JobPriority};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let text = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "hello world".to_string());

    let client = Client::builder()
        .server("127.0.0.1:4730".parse()?)
        .drive_timeout(Duration::from_secs(5))
        .connect()
        .await?;

    let job = Job::builder("reverse")
        .data(text)
        .priority(JobPriority::High)
        .build();
    client.submit(&job).await?;

    let status = client.get_job_status(&job).await?;
    println!(
        "status: known={} running={} {}/{}",
        status.is_known(),
        status.is_running(),
        status.numerator(),
        status.denominator()
    );

    let result = client.wait_for(&job, Some(Duration::from_secs(30))).await?;
    if result.succeeded() {
        println!("result: {}", String::from_utf8_lossy(result.results()));
    } else {
        println!("job failed: {}", String::from_utf8_lossy(result.exceptions()));
    }
    if !result.warnings().is_empty() {
        println!("warnings: {}", String::from_utf8_lossy(result.warnings()));
    }

    let background = Job::background("reverse", "fire and forget");
    client.submit(&background).await?;
    println!("background job {} queued", background);

    client.shutdown().await;
    Ok(())
}
