//! # gearwire
//!
//! Async Rust engine for the Gearman job-queue protocol.
//!
//! A [`Client`] submits jobs to one or more job servers and follows them
//! to completion; a [`Worker`] announces named functions to job servers,
//! grabs assigned jobs and reports their progress and results.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): 12-byte headers, NUL-separated payload
//!   fields, incremental frame decoding
//! - **Tasks** ([`task`]): one state machine per request/response exchange
//! - **Sessions** ([`session`]): one TCP connection, FIFO correlation of
//!   responses to requests, non-blocking I/O
//! - **Reactor** ([`reactor`]): readiness polling shared by both engines
//!
//! ## Example
//!
//! ```no_run
//! use gearwire::{Client, Job};
//!
//! #[tokio::main]
//! async fn main() -> gearwire::Result<()> {
//!     let client = Client::builder()
//!         .server("127.0.0.1:4730".parse()?)
//!         .connect()
//!         .await?;
//!
//!     let reply = client.echo("ping").await?;
//!     assert_eq!(reply, "ping");
//!
//!     let job = Job::background("send_mail", "user@example.com");
//!     client.submit(&job).await?;
//!     assert!(job.is_done());
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod reactor;
pub mod registry;
pub mod session;
pub mod task;
pub mod worker;

pub use client::{Client, ClientBuilder, Job, JobPriority, JobResult, JobStatus};
pub use config::{ClientConfig, ExecutionMode, ServerAddr, WorkerConfig};
pub use error::{GearwireError, Result};
pub use handler::{FunctionResult, JobContext, JobOutcome};
pub use worker::{Worker, WorkerBuilder};
