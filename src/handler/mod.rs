//! Handler module - worker-side job functions and dispatch.
//!
//! Provides:
//! - [`FunctionRegistry`] - maps function names to job functions
//! - [`JobContext`] - gives functions their job and lets them report progress
//!
//! # Example
//!
//! ```
//! use gearwire::handler::{FunctionRegistry, FunctionResult, JobContext, JobOutcome};
//!
//! async fn count(ctx: JobContext) -> FunctionResult {
//!     for i in 1..=3 {
//!         ctx.send_status(i, 3)?;
//!     }
//!     Ok(JobOutcome::complete("done"))
//! }
//!
//! let mut registry = FunctionRegistry::new();
//!
//! // Plain closure
//! registry.register("upper", 0, |ctx| async move {
//!     Ok(JobOutcome::complete(ctx.data().to_ascii_uppercase()))
//! });
//!
//! // Function reporting progress, with a 60s server-side timeout
//! registry.register("count", 60, count);
//! ```

mod context;
mod registry;

pub use context::{JobContext, OutboundFrame, Outbox};
pub use registry::{
    execute, BoxFuture, ClosureFunction, FunctionDefinition, FunctionError, FunctionRegistry,
    FunctionResult, JobFunction, JobOutcome,
};
