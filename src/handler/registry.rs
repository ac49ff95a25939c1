//! Function registry for dispatching assigned jobs by name.
//!
//! The registry maps function names to job functions. Registering a name
//! twice keeps the first registration. Each assigned job calls the
//! function afresh, so a closure acts as the factory for one job's work.
//!
//! # Example
//!
//! ```
//! use gearwire::handler::{FunctionRegistry, JobOutcome};
//!
//! let mut registry = FunctionRegistry::new();
//!
//! registry.register("reverse", 0, |ctx| async move {
//!     let mut data = ctx.data().to_vec();
//!     data.reverse();
//!     Ok(JobOutcome::complete(data))
//! });
//!
//! assert!(registry.contains("reverse"));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tracing::{error, warn};

use super::JobContext;
use crate::protocol::{Frame, PacketType};

/// Error type job functions may return; reported as WORK_EXCEPTION.
pub type FunctionError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for job functions.
pub type FunctionResult = std::result::Result<JobOutcome, FunctionError>;

/// Boxed future for function results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How a job function finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Sent as WORK_COMPLETE with the given data.
    Complete(Bytes),
    /// Sent as WORK_FAIL.
    Fail,
}

impl JobOutcome {
    pub fn complete(data: impl Into<Bytes>) -> Self {
        JobOutcome::Complete(data.into())
    }
}

/// Trait for job functions.
pub trait JobFunction: Send + Sync + 'static {
    /// Run one assigned job.
    fn call(&self, ctx: JobContext) -> BoxFuture<'static, FunctionResult>;
}

/// Wrapper turning an async closure into a [`JobFunction`].
pub struct ClosureFunction<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FunctionResult> + Send + 'static,
{
    function: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> ClosureFunction<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FunctionResult> + Send + 'static,
{
    pub fn new(function: F) -> Self {
        Self {
            function,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> JobFunction for ClosureFunction<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FunctionResult> + Send + 'static,
{
    fn call(&self, ctx: JobContext) -> BoxFuture<'static, FunctionResult> {
        Box::pin((self.function)(ctx))
    }
}

/// A registered function.
#[derive(Clone)]
pub struct FunctionDefinition {
    name: String,
    /// Server-side timeout in seconds (0 = none).
    timeout: u32,
    function: Arc<dyn JobFunction>,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>, timeout: u32, function: Arc<dyn JobFunction>) -> Self {
        Self {
            name: name.into(),
            timeout,
            function,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    pub fn function(&self) -> Arc<dyn JobFunction> {
        self.function.clone()
    }

    /// CAN_DO, or CAN_DO_TIMEOUT when a timeout is set.
    pub fn announce_frame(&self) -> Frame {
        if self.timeout > 0 {
            let timeout = self.timeout.to_string();
            Frame::request_from_fields(
                PacketType::CanDoTimeout,
                &[self.name.as_bytes(), timeout.as_bytes()],
            )
        } else {
            Frame::request(PacketType::CanDo, Bytes::copy_from_slice(self.name.as_bytes()))
        }
    }
}

impl fmt::Debug for FunctionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDefinition")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Registry mapping function names to job functions.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, FunctionDefinition>,
}

impl FunctionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure. Returns `false` if the name is taken.
    pub fn register<F, Fut>(&mut self, name: &str, timeout: u32, function: F) -> bool
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult> + Send + 'static,
    {
        self.insert(FunctionDefinition::new(
            name,
            timeout,
            Arc::new(ClosureFunction::new(function)),
        ))
    }

    /// Register a definition. Returns `false` if the name is taken.
    pub fn insert(&mut self, definition: FunctionDefinition) -> bool {
        if self.functions.contains_key(definition.name()) {
            return false;
        }
        self.functions
            .insert(definition.name().to_string(), definition);
        true
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    pub fn clear(&mut self) {
        self.functions.clear();
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.get(name)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &FunctionDefinition> {
        self.functions.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Run one job and report its terminal frame through the context.
///
/// An unknown function (`None`) is reported as WORK_FAIL. A function that
/// panics is reported as WORK_EXCEPTION carrying the panic message.
pub async fn execute(function: Option<Arc<dyn JobFunction>>, ctx: JobContext) {
    let sent = match function {
        None => {
            warn!(
                "No function registered for '{}', failing job {}",
                ctx.function_name(),
                String::from_utf8_lossy(ctx.handle())
            );
            ctx.fail()
        }
        Some(function) => {
            let call = AssertUnwindSafe(async { function.call(ctx.clone()).await });
            match call.catch_unwind().await {
                Ok(Ok(JobOutcome::Complete(data))) => ctx.complete(&data),
                Ok(Ok(JobOutcome::Fail)) => ctx.fail(),
                Ok(Err(e)) => {
                    warn!("Function '{}' raised: {}", ctx.function_name(), e);
                    ctx.exception(e.to_string().as_bytes())
                }
                Err(panic) => {
                    let message = panic_message(&*panic);
                    error!(
                        "Function '{}' panicked on job {}: {}",
                        ctx.function_name(),
                        String::from_utf8_lossy(ctx.handle()),
                        message
                    );
                    ctx.exception(message.as_bytes())
                }
            }
        }
    };
    if let Err(e) = sent {
        warn!(
            "Could not report result of job {}: {}",
            String::from_utf8_lossy(ctx.handle()),
            e
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "job function panicked".to_string()
    }
}
