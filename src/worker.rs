//! Worker engine: announces functions, grabs jobs and runs them.
//!
//! The [`Worker`] keeps one session per job server. [`Worker::work`] runs
//! the event loop until [`Worker::stop`] or [`Worker::shutdown`] is called:
//!
//! 1. Frames emitted by job functions are queued on their sessions.
//! 2. Disconnected sessions are reconnected and re-announced
//!    (SET_CLIENT_ID, one CAN_DO per function, then a grab).
//! 3. Every connected session without an outstanding grab gets one.
//! 4. The reactor waits for readiness, ready sessions are driven and
//!    their responses dispatched.
//! 5. At most one queued job is executed, inline or on the pool.
//!
//! Responses drive the grab cycle: NO_JOB puts the session to sleep with
//! PRE_SLEEP, NOOP wakes it (the next iteration grabs again) and
//! JOB_ASSIGN queues the job.
//!
//! # Example
//!
//! ```no_run
//! use gearwire::handler::{FunctionResult, JobContext, JobOutcome};
//! use gearwire::worker::Worker;
//!
//! async fn reverse(ctx: JobContext) -> FunctionResult {
//!     let mut data = ctx.data().to_vec();
//!     data.reverse();
//!     Ok(JobOutcome::complete(data))
//! }
//!
//! #[tokio::main]
//! async fn main() -> gearwire::Result<()> {
//!     let worker = Worker::builder()
//!         .server("127.0.0.1:4730".parse()?)
//!         .function("reverse", 0, reverse)
//!         .build();
//!
//!     worker.connect().await;
//!     worker.work().await
//! }
//! ```

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::config::{duration_millis, ExecutionMode, ServerAddr, WorkerConfig};
use crate::error::{GearwireError, Result};
use crate::handler::{
    execute, ClosureFunction, FunctionDefinition, FunctionRegistry, FunctionResult, JobContext,
    JobFunction, OutboundFrame, Outbox,
};
use crate::protocol::{FieldName, Frame, PacketType};
use crate::reactor::Reactor;
use crate::registry::SessionRegistry;
use crate::session::{self, Session, SessionEvent};
use crate::task::{CapturedResponse, Task};

/// Rounds spent flushing outbound frames on a graceful stop.
const FLUSH_ROUNDS: usize = 10;

/// Builder for configuring a [`Worker`].
pub struct WorkerBuilder {
    config: WorkerConfig,
    servers: Vec<ServerAddr>,
    functions: FunctionRegistry,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
            servers: Vec::new(),
            functions: FunctionRegistry::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a job server; it is connected by [`Worker::connect`] or by the
    /// event loop.
    pub fn server(mut self, addr: ServerAddr) -> Self {
        self.servers.push(addr);
        self
    }

    /// Register a job function. `timeout` is in seconds; 0 means none.
    pub fn function<F, Fut>(mut self, name: &str, timeout: u32, function: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult> + Send + 'static,
    {
        if !self.functions.register(name, timeout, function) {
            warn!("Function '{}' is already registered, ignoring", name);
        }
        self
    }

    /// Identity announced with SET_CLIENT_ID.
    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = id.into();
        self
    }

    /// Grab with GRAB_JOB_UNIQ so functions see the client's unique id.
    pub fn grab_unique(mut self, enabled: bool) -> Self {
        self.config.grab_unique = enabled;
        self
    }

    /// Default: 10 milliseconds
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout_ms = duration_millis(timeout);
        self
    }

    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = duration_millis(timeout);
        self
    }

    /// Pause after a failed reconnect round.
    ///
    /// Default: 50 milliseconds
    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.config.reconnect_backoff_ms = duration_millis(backoff);
        self
    }

    /// Run jobs on spawned tasks, at most `max_concurrent_jobs` at once.
    pub fn pooled(mut self, max_concurrent_jobs: usize) -> Self {
        self.config.execution = ExecutionMode::Pooled {
            max_concurrent_jobs,
        };
        self
    }

    pub fn build(self) -> Worker {
        Worker::with_functions(self.config, self.functions, self.servers)
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A job assigned by a server and not yet started.
#[derive(Debug)]
struct AssignedJob {
    server: ServerAddr,
    function_name: String,
    handle: Bytes,
    unique_id: Bytes,
    data: Bytes,
}

struct WorkerInner {
    sessions: SessionRegistry,
    reactor: Reactor,
    functions: FunctionRegistry,
    worker_id: String,
    /// Sessions with an outstanding GRAB_JOB or PRE_SLEEP.
    grabbing: HashSet<ServerAddr>,
    /// Sessions whose reconnect failure has been logged.
    failing: HashSet<ServerAddr>,
    queue: VecDeque<AssignedJob>,
    outbox: mpsc::UnboundedReceiver<OutboundFrame>,
    pool: JoinSet<()>,
}

/// A job-running worker.
///
/// All methods take `&self`; share the worker through an `Arc` to call
/// [`Worker::stop`] or register functions while [`Worker::work`] runs.
pub struct Worker {
    config: WorkerConfig,
    inner: Mutex<WorkerInner>,
    outbox: Outbox,
    permits: Arc<Semaphore>,
    /// Cuts short the event loop's poll so callers can take the lock.
    wakeup: Notify,
    /// Callers waiting in [`Worker::lock`].
    lock_waiters: AtomicUsize,
    running: AtomicBool,
    stop_requested: AtomicBool,
}

impl Worker {
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    pub fn new(config: WorkerConfig) -> Self {
        Self::with_functions(config, FunctionRegistry::new(), Vec::new())
    }

    fn with_functions(config: WorkerConfig, functions: FunctionRegistry, servers: Vec<ServerAddr>) -> Self {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let mut sessions = SessionRegistry::new();
        for addr in servers {
            sessions.add_server(Session::new(
                addr,
                config.receive_buffer_size,
                config.max_payload_size,
            ));
        }
        let permits = match config.execution {
            ExecutionMode::Inline => 1,
            ExecutionMode::Pooled {
                max_concurrent_jobs,
            } => max_concurrent_jobs.max(1),
        };
        Self {
            inner: Mutex::new(WorkerInner {
                sessions,
                reactor: Reactor::new(),
                functions,
                worker_id: config.worker_id.clone(),
                grabbing: HashSet::new(),
                failing: HashSet::new(),
                queue: VecDeque::new(),
                outbox: outbox_rx,
                pool: JoinSet::new(),
            }),
            config,
            outbox,
            permits: Arc::new(Semaphore::new(permits)),
            wakeup: Notify::new(),
            lock_waiters: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Connect every registered server that is not connected yet.
    ///
    /// Returns the number of connected servers. Servers that cannot be
    /// reached stay registered and are retried by the event loop.
    pub async fn connect(&self) -> usize {
        self.reconnect().await;
        self.lock().await.sessions.open_servers().len()
    }

    /// Register a job server and connect to it.
    ///
    /// Returns whether the server is connected. A server that cannot be
    /// reached is still registered and is retried by the event loop.
    /// Adding a registered server again does nothing.
    pub async fn add_server(&self, addr: ServerAddr) -> bool {
        if let Some(connected) = self.registered_state(&addr).await {
            return connected;
        }
        let stream = session::connect(&addr, self.config.connect_timeout()).await;

        let mut inner = self.lock().await;
        // Another caller may have added it while we were connecting
        if let Some(session) = inner.sessions.get(&addr) {
            debug!("Server {} is already registered with the worker", addr);
            return session.is_open();
        }
        let mut session = self.new_session(addr.clone());
        let connected = match stream.and_then(|stream| session.attach(stream)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Error connecting to {}, will keep trying: {}", addr, e);
                inner.failing.insert(addr.clone());
                false
            }
        };
        inner.sessions.add_server(session);
        if connected {
            self.announce(&mut inner, &addr);
        }
        info!("Added job server {} to worker {}", addr, inner.worker_id);
        connected
    }

    /// Whether `addr` is connected, or `None` if it is not registered.
    async fn registered_state(&self, addr: &ServerAddr) -> Option<bool> {
        let inner = self.lock().await;
        let session = inner.sessions.get(addr)?;
        debug!("Server {} is already registered with the worker", addr);
        Some(session.is_open())
    }

    /// Close and forget a job server. Jobs it assigned and that have not
    /// started are dropped.
    pub async fn remove_server(&self, addr: &ServerAddr) -> Result<()> {
        let mut inner = self.lock().await;
        let Some(mut session) = inner.sessions.remove_server(addr) else {
            return Err(GearwireError::UnknownServer(addr.to_string()));
        };
        session.close();
        inner.reactor.deregister(addr);
        inner.grabbing.remove(addr);
        inner.failing.remove(addr);
        inner.queue.retain(|job| &job.server != addr);
        info!("Removed job server {} from worker", addr);
        Ok(())
    }

    pub async fn has_server(&self, addr: &ServerAddr) -> bool {
        self.lock().await.sessions.contains(addr)
    }

    /// Registered servers, in address order.
    pub async fn servers(&self) -> Vec<ServerAddr> {
        self.lock().await.sessions.servers()
    }

    /// Register a job function and announce it to every connected server.
    ///
    /// Returns `false` (and changes nothing) if the name is taken.
    pub async fn register_function<F, Fut>(&self, name: &str, timeout: u32, function: F) -> bool
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult> + Send + 'static,
    {
        let function = Arc::new(ClosureFunction::new(function));
        self.register(FunctionDefinition::new(name, timeout, function)).await
    }

    /// Register a prepared definition. See [`Worker::register_function`].
    pub async fn register(&self, definition: FunctionDefinition) -> bool {
        let mut inner = self.lock().await;
        let announce = definition.announce_frame();
        let name = definition.name().to_string();
        if !inner.functions.insert(definition) {
            debug!("Function '{}' is already registered, ignoring", name);
            return false;
        }
        broadcast(&mut inner.sessions, &announce);
        info!("Registered function '{}'", name);
        true
    }

    /// Withdraw one function (CANT_DO) from every connected server.
    pub async fn unregister_function(&self, name: &str) -> bool {
        let mut inner = self.lock().await;
        if !inner.functions.unregister(name) {
            return false;
        }
        let frame = Frame::request(PacketType::CantDo, Bytes::copy_from_slice(name.as_bytes()));
        broadcast(&mut inner.sessions, &frame);
        info!("Unregistered function '{}'", name);
        true
    }

    /// Withdraw every function (RESET_ABILITIES).
    pub async fn unregister_all(&self) {
        let mut inner = self.lock().await;
        inner.functions.clear();
        broadcast(
            &mut inner.sessions,
            &Frame::request(PacketType::ResetAbilities, Bytes::new()),
        );
    }

    /// Registered function names, sorted.
    pub async fn registered_functions(&self) -> Vec<String> {
        self.lock().await.functions.names()
    }

    /// Change the worker identity and announce it to connected servers.
    pub async fn set_worker_id(&self, id: impl Into<String>) {
        let mut inner = self.lock().await;
        inner.worker_id = id.into();
        let frame = set_client_id(&inner.worker_id);
        broadcast(&mut inner.sessions, &frame);
    }

    pub async fn worker_id(&self) -> String {
        self.lock().await.worker_id.clone()
    }

    /// Whether jobs are grabbed with GRAB_JOB_UNIQ.
    pub fn grab_unique(&self) -> bool {
        self.config.grab_unique
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run the event loop until [`Worker::stop`] or [`Worker::shutdown`].
    ///
    /// # Errors
    ///
    /// Fails if the loop is already running.
    pub async fn work(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GearwireError::InvalidState("worker is already running".into()));
        }
        self.stop_requested.store(false, Ordering::Release);
        info!("Worker {} is running", self.config.worker_id);

        while !self.stop_requested.load(Ordering::Acquire) {
            self.run_once().await;
        }

        self.close(true).await;
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Ask the loop to exit; running pooled jobs finish first.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wakeup.notify_waiters();
    }

    /// Stop immediately: pooled jobs are aborted and sessions closed.
    pub async fn shutdown(&self) {
        self.stop();
        self.close(false).await;
    }

    /// One pass of the event loop.
    ///
    /// Connects run without the state lock, and the poll gives the lock up
    /// early when another caller wants it.
    async fn run_once(&self) {
        self.submit_outbound(&mut *self.inner.lock().await);
        let reconnect_failed = self.reconnect().await;

        let inline_job = {
            let mut inner = self.inner.lock().await;
            let wakeup = self.wakeup.notified();
            tokio::pin!(wakeup);
            wakeup.as_mut().enable();
            self.grab_idle_sessions(&mut inner);

            // Someone is already queued for the lock; only pick up ready I/O
            let poll_timeout = if self.lock_waiters.load(Ordering::SeqCst) > 0
                || self.stop_requested.load(Ordering::SeqCst)
            {
                Duration::ZERO
            } else {
                self.config.poll_timeout()
            };
            let inner = &mut *inner;
            inner.reactor.update_interests(&inner.sessions);
            let ready = tokio::select! {
                ready = inner.reactor.select(&inner.sessions, poll_timeout) => ready,
                _ = &mut wakeup => Vec::new(),
            };
            for addr in ready {
                self.drive_session(inner, &addr);
            }

            reap_finished(&mut inner.pool);
            self.next_job(inner)
        };

        if let Some((function, ctx)) = inline_job {
            execute(function, ctx).await;
        }
        if reconnect_failed {
            tokio::time::sleep(self.config.reconnect_backoff()).await;
        }
    }

    /// Take the state lock, waking the event loop if it is polling.
    async fn lock(&self) -> MutexGuard<'_, WorkerInner> {
        let _waiter = LockWaiter::enter(&self.lock_waiters);
        self.wakeup.notify_waiters();
        self.inner.lock().await
    }

    fn new_session(&self, addr: ServerAddr) -> Session {
        Session::new(
            addr,
            self.config.receive_buffer_size,
            self.config.max_payload_size,
        )
    }

    /// Reopen every closed session. Returns whether any attempt failed.
    async fn reconnect(&self) -> bool {
        let closed: Vec<ServerAddr> = {
            let inner = self.inner.lock().await;
            inner
                .sessions
                .iter()
                .filter(|(_, session)| !session.is_open())
                .map(|(addr, _)| addr.clone())
                .collect()
        };

        let mut failed = false;
        for addr in closed {
            let stream = session::connect(&addr, self.config.connect_timeout()).await;
            let mut inner = self.inner.lock().await;
            let Some(session) = inner.sessions.get_mut(&addr) else {
                // Removed while connecting
                continue;
            };
            if session.is_open() {
                continue;
            }
            match stream.and_then(|stream| session.attach(stream)) {
                Ok(()) => {
                    if inner.failing.remove(&addr) {
                        info!("Re-established connection to {}", addr);
                    }
                    inner.grabbing.remove(&addr);
                    self.announce(&mut inner, &addr);
                }
                Err(e) => {
                    if inner.failing.insert(addr.clone()) {
                        warn!("Error connecting to {}, will keep trying: {}", addr, e);
                    }
                    failed = true;
                }
            }
        }
        failed
    }

    /// Identity, every function, then a grab.
    fn announce(&self, inner: &mut WorkerInner, addr: &ServerAddr) {
        let mut frames = vec![set_client_id(&inner.worker_id)];
        frames.extend(inner.functions.definitions().map(FunctionDefinition::announce_frame));
        let Some(session) = inner.sessions.get_mut(addr) else {
            return;
        };
        for frame in frames {
            if let Err(e) = session.submit_frame(frame) {
                warn!("Could not announce worker to {}: {}", addr, e);
                return;
            }
        }
        self.grab(inner, addr);
    }

    fn grab_idle_sessions(&self, inner: &mut WorkerInner) {
        for addr in inner.sessions.open_servers() {
            if !inner.grabbing.contains(&addr) {
                self.grab(inner, &addr);
            }
        }
    }

    fn grab(&self, inner: &mut WorkerInner, addr: &ServerAddr) {
        let packet_type = if self.config.grab_unique {
            PacketType::GrabJobUniq
        } else {
            PacketType::GrabJob
        };
        if submit_with_response(inner, addr, packet_type) {
            trace!("Worker submitted {} to {}", packet_type, addr);
            inner.grabbing.insert(addr.clone());
        }
    }

    /// Queue frames emitted by job functions on their sessions.
    fn submit_outbound(&self, inner: &mut WorkerInner) {
        while let Ok(OutboundFrame { server, frame }) = inner.outbox.try_recv() {
            match inner.sessions.get_mut(&server) {
                Some(session) if session.is_open() => {
                    if let Err(e) = session.submit_frame(frame) {
                        warn!("Could not queue frame for {}: {}", server, e);
                    }
                }
                _ => warn!(
                    "Dropping {} for {}: session is not connected",
                    frame.packet_type, server
                ),
            }
        }
    }

    fn drive_session(&self, inner: &mut WorkerInner, addr: &ServerAddr) {
        let Some(session) = inner.sessions.get_mut(addr) else {
            warn!("Worker does not have a session for {}", addr);
            return;
        };
        if !session.is_open() {
            return;
        }
        if let Err(e) = session.drive_io() {
            warn!("Error while driving I/O on {}: {}", addr, e);
            session.close();
        }
        let events = session.drain_events();
        if !session.is_open() {
            inner.grabbing.remove(addr);
        }
        for event in events {
            self.handle_session_event(inner, addr, event);
        }
    }

    fn handle_session_event(&self, inner: &mut WorkerInner, addr: &ServerAddr, event: SessionEvent) {
        let frame = match event {
            SessionEvent::Response(frame) => frame,
            SessionEvent::Mismatch { .. } => return,
            SessionEvent::Disconnected => {
                inner.grabbing.remove(addr);
                return;
            }
        };
        debug!("Worker handling {} from {}", frame.packet_type, addr);

        match frame.packet_type {
            PacketType::JobAssign | PacketType::JobAssignUniq => {
                inner.grabbing.remove(addr);
                let job = AssignedJob {
                    server: addr.clone(),
                    function_name: frame.field_str(FieldName::FunctionName),
                    handle: frame.field(FieldName::JobHandle),
                    unique_id: frame.field(FieldName::UniqueId),
                    data: frame.field(FieldName::Data),
                };
                debug!(
                    "Queued job {} for '{}' from {}",
                    String::from_utf8_lossy(&job.handle),
                    job.function_name,
                    addr
                );
                inner.queue.push_back(job);
            }
            PacketType::Noop => {
                inner.grabbing.remove(addr);
            }
            PacketType::NoJob => {
                // The grab slot stays taken until NOOP wakes the session
                submit_with_response(inner, addr, PacketType::PreSleep);
            }
            PacketType::EchoRes | PacketType::OptionRes => {}
            PacketType::Error => {
                error!(
                    "Received error {} ({}) from {}, closing session",
                    frame.field_str(FieldName::ErrorCode),
                    frame.field_str(FieldName::ErrorText),
                    addr
                );
                self.close_session(inner, addr);
            }
            other => {
                warn!(
                    "Received unknown packet type {} from {}, closing connection",
                    other, addr
                );
                self.close_session(inner, addr);
            }
        }
    }

    fn close_session(&self, inner: &mut WorkerInner, addr: &ServerAddr) {
        if let Some(session) = inner.sessions.get_mut(addr) {
            session.close();
        }
        inner.grabbing.remove(addr);
    }

    /// Start the next queued job.
    ///
    /// Pooled jobs are spawned here; an inline job is returned so the caller
    /// can run it without holding the lock.
    fn next_job(&self, inner: &mut WorkerInner) -> Option<(Option<Arc<dyn JobFunction>>, JobContext)> {
        let permit = match self.config.execution {
            ExecutionMode::Inline => None,
            ExecutionMode::Pooled { .. } => {
                if inner.queue.is_empty() {
                    return None;
                }
                match self.permits.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    // Pool is full; the job waits in the queue
                    Err(_) => return None,
                }
            }
        };

        let job = inner.queue.pop_front()?;
        let function = inner.functions.get(&job.function_name).map(FunctionDefinition::function);
        let ctx = JobContext::new(job.function_name, job.handle, job.unique_id, job.data)
            .with_outbox(job.server, self.outbox.clone());

        match permit {
            None => Some((function, ctx)),
            Some(permit) => {
                inner.pool.spawn(async move {
                    execute(function, ctx).await;
                    drop(permit);
                });
                None
            }
        }
    }

    /// Stop the loop's sessions. A graceful close lets pooled jobs finish
    /// and flushes their frames first.
    async fn close(&self, graceful: bool) {
        let mut inner = self.lock().await;
        if graceful {
            while let Some(joined) = inner.pool.join_next().await {
                log_join_error(joined);
            }
            self.flush(&mut inner).await;
        } else {
            inner.pool.abort_all();
        }
        inner.sessions.close_all();
        inner.reactor.clear();
        inner.grabbing.clear();
        inner.failing.clear();
        inner.queue.clear();
        info!("Worker {} has shut down", inner.worker_id);
    }

    /// Write out what job functions left behind.
    async fn flush(&self, inner: &mut WorkerInner) {
        self.submit_outbound(inner);
        for _ in 0..FLUSH_ROUNDS {
            if !inner.sessions.iter().any(|(_, s)| s.has_data_to_write()) {
                return;
            }
            inner.reactor.update_interests(&inner.sessions);
            let ready = inner
                .reactor
                .select(&inner.sessions, self.config.poll_timeout())
                .await;
            for addr in ready {
                if let Some(session) = inner.sessions.get_mut(&addr) {
                    if let Err(e) = session.drive_io() {
                        warn!("Error flushing {}: {}", addr, e);
                        session.close();
                    }
                }
            }
        }
    }
}

/// Counts a caller in [`Worker::lock`] until it holds the lock or gives up.
struct LockWaiter<'a>(&'a AtomicUsize);

impl<'a> LockWaiter<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for LockWaiter<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn set_client_id(worker_id: &str) -> Frame {
    Frame::request(PacketType::SetClientId, Bytes::copy_from_slice(worker_id.as_bytes()))
}

/// Queue an empty request that expects one response.
fn submit_with_response(inner: &mut WorkerInner, addr: &ServerAddr, packet_type: PacketType) -> bool {
    let Some(session) = inner.sessions.get_mut(addr) else {
        return false;
    };
    let submitted = Task::with_handler(Frame::request(packet_type, Bytes::new()), CapturedResponse::new())
        .and_then(|task| session.submit(task));
    match submitted {
        Ok(()) => true,
        Err(e) => {
            warn!("Could not submit {} to {}: {}", packet_type, addr, e);
            false
        }
    }
}

/// Queue `frame` on every connected session.
fn broadcast(sessions: &mut SessionRegistry, frame: &Frame) {
    sessions.for_each_session(|session| {
        if !session.is_open() {
            return;
        }
        if let Err(e) = session.submit_frame(frame.clone()) {
            warn!("Could not send {} to {}: {}", frame.packet_type, session.addr(), e);
        }
    });
}

fn reap_finished(pool: &mut JoinSet<()>) {
    while let Some(Some(joined)) = pool.join_next().now_or_never() {
        log_join_error(joined);
    }
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Job function panicked: {}", e);
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::JobOutcome;
    use crate::protocol::{Header, HEADER_SIZE};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpListener;

    async fn listen() -> (TcpListener, ServerAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ServerAddr::new("127.0.0.1", listener.local_addr().unwrap().port());
        (listener, addr)
    }

    async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Frame {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        let header = Header::decode(&header).unwrap().unwrap();
        let mut payload = vec![0u8; header.payload_length as usize];
        stream.read_exact(&mut payload).await.unwrap();
        Frame::new(header.magic, header.packet_type, payload)
    }

    /// Forward every frame the server receives to a channel.
    fn spawn_reader(mut stream: OwnedReadHalf) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut stream).await;
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });
        rx
    }

    /// Run loop iterations until the server receives a frame of `wanted` type.
    async fn run_until(
        worker: &Worker,
        frames: &mut mpsc::UnboundedReceiver<Frame>,
        wanted: PacketType,
    ) -> Frame {
        for _ in 0..1000 {
            worker.run_once().await;
            while let Ok(frame) = frames.try_recv() {
                if frame.packet_type == wanted {
                    return frame;
                }
            }
        }
        panic!("server never received {}", wanted);
    }

    async fn is_grabbing(worker: &Worker, addr: &ServerAddr) -> bool {
        worker.inner.lock().await.grabbing.contains(addr)
    }

    fn worker() -> Worker {
        Worker::builder()
            .worker_id("w1")
            .poll_timeout(Duration::from_millis(5))
            .function("reverse", 0, |ctx: JobContext| async move {
                let mut data = ctx.data().to_vec();
                data.reverse();
                Ok(JobOutcome::complete(data))
            })
            .build()
    }

    #[tokio::test]
    async fn test_add_server_announces_worker() {
        let (listener, addr) = listen().await;
        let worker = worker();

        let (connected, accepted) = tokio::join!(worker.add_server(addr.clone()), listener.accept());
        assert!(connected);
        let (mut server, _) = accepted.unwrap();

        // Frames only hit the wire when the session is driven
        worker.run_once().await;

        let id = read_frame(&mut server).await;
        assert_eq!(id.packet_type, PacketType::SetClientId);
        assert_eq!(id.payload(), b"w1");
        let can_do = read_frame(&mut server).await;
        assert_eq!(can_do.packet_type, PacketType::CanDo);
        assert_eq!(can_do.payload(), b"reverse");
        let grab = read_frame(&mut server).await;
        assert_eq!(grab.packet_type, PacketType::GrabJob);

        assert!(is_grabbing(&worker, &addr).await);
    }

    #[tokio::test]
    async fn test_unreachable_server_stays_registered() {
        let (listener, addr) = listen().await;
        drop(listener);

        let worker = worker();
        assert!(!worker.add_server(addr.clone()).await);
        assert!(worker.has_server(&addr).await);
        // Adding again is a no-op
        assert!(!worker.add_server(addr.clone()).await);
        assert_eq!(worker.servers().await.len(), 1);

        worker.remove_server(&addr).await.unwrap();
        assert!(!worker.has_server(&addr).await);
        assert!(worker.remove_server(&addr).await.is_err());
    }

    #[tokio::test]
    async fn test_function_registration_is_broadcast() {
        let (listener, addr) = listen().await;
        let worker = worker();
        let (_, accepted) = tokio::join!(worker.add_server(addr), listener.accept());
        let (mut server, _) = accepted.unwrap();
        worker.run_once().await;
        for _ in 0..3 {
            read_frame(&mut server).await;
        }

        assert!(
            worker
                .register_function("slow", 30, |_ctx| async { Ok(JobOutcome::Fail) })
                .await
        );
        assert!(
            !worker
                .register_function("slow", 0, |_ctx| async { Ok(JobOutcome::Fail) })
                .await
        );
        assert!(worker.unregister_function("reverse").await);
        assert!(!worker.unregister_function("reverse").await);
        worker.run_once().await;

        let slow = read_frame(&mut server).await;
        assert_eq!(slow.packet_type, PacketType::CanDoTimeout);
        assert_eq!(slow.payload(), b"slow\x0030");
        let cant = read_frame(&mut server).await;
        assert_eq!(cant.packet_type, PacketType::CantDo);
        assert_eq!(cant.payload(), b"reverse");
        assert_eq!(worker.registered_functions().await, vec!["slow".to_string()]);

        worker.unregister_all().await;
        worker.run_once().await;
        assert_eq!(read_frame(&mut server).await.packet_type, PacketType::ResetAbilities);
        assert!(worker.registered_functions().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_worker_id_is_broadcast() {
        let (listener, addr) = listen().await;
        let worker = worker();
        let (_, accepted) = tokio::join!(worker.add_server(addr), listener.accept());
        let (mut server, _) = accepted.unwrap();
        worker.run_once().await;
        for _ in 0..3 {
            read_frame(&mut server).await;
        }

        worker.set_worker_id("renamed").await;
        worker.run_once().await;
        let frame = read_frame(&mut server).await;
        assert_eq!(frame.packet_type, PacketType::SetClientId);
        assert_eq!(frame.payload(), b"renamed");
        assert_eq!(worker.worker_id().await, "renamed");
    }

    #[tokio::test]
    async fn test_unknown_function_is_failed() {
        let (listener, addr) = listen().await;
        let worker = worker();
        let (_, accepted) = tokio::join!(worker.add_server(addr), listener.accept());
        let (read_half, mut write_half) = accepted.unwrap().0.into_split();
        let mut frames = spawn_reader(read_half);
        run_until(&worker, &mut frames, PacketType::GrabJob).await;

        let assign = Frame::response_from_fields(PacketType::JobAssign, &[b"H:7", b"missing", b"x"]);
        write_half.write_all(&assign.encode().unwrap()).await.unwrap();

        let fail = run_until(&worker, &mut frames, PacketType::WorkFail).await;
        assert_eq!(fail.payload(), b"H:7");
    }

    #[tokio::test]
    async fn test_error_packet_closes_session_for_reconnect() {
        let (listener, addr) = listen().await;
        let worker = worker();
        let (_, accepted) = tokio::join!(worker.add_server(addr.clone()), listener.accept());
        let (read_half, mut write_half) = accepted.unwrap().0.into_split();
        let mut frames = spawn_reader(read_half);
        run_until(&worker, &mut frames, PacketType::GrabJob).await;

        let second = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let error = Frame::response_from_fields(PacketType::Error, &[b"ERR", b"bad"]);
        write_half.write_all(&error.encode().unwrap()).await.unwrap();

        for _ in 0..1000 {
            if second.is_finished() {
                break;
            }
            worker.run_once().await;
        }
        // One more pass writes the announcement on the new connection
        worker.run_once().await;
        let mut reconnected = second.await.unwrap();
        let id = read_frame(&mut reconnected).await;
        assert_eq!(id.packet_type, PacketType::SetClientId);
        assert!(worker.has_server(&addr).await);
    }

    #[tokio::test]
    async fn test_calls_do_not_wait_for_poll_timeout() {
        let (listener, addr) = listen().await;
        let worker = Arc::new(
            Worker::builder()
                .worker_id("w1")
                .poll_timeout(Duration::from_secs(30))
                .build(),
        );
        let (_, accepted) = tokio::join!(worker.add_server(addr.clone()), listener.accept());
        let (read_half, _write_half) = accepted.unwrap().0.into_split();
        let mut frames = spawn_reader(read_half);

        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.work().await }
        });
        // The server never answers GRAB_JOB, so the loop sits in its poll
        loop {
            let frame = frames.recv().await.unwrap();
            if frame.packet_type == PacketType::GrabJob {
                break;
            }
        }

        let registered = tokio::time::timeout(
            Duration::from_secs(2),
            worker.register_function("late", 0, |_ctx| async { Ok(JobOutcome::Fail) }),
        )
        .await
        .expect("registration waited for the poll to time out");
        assert!(registered);
        assert!(tokio::time::timeout(Duration::from_secs(2), worker.has_server(&addr))
            .await
            .unwrap());

        let can_do = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(can_do.packet_type, PacketType::CanDo);
        assert_eq!(can_do.payload(), b"late");

        worker.stop();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("stop waited for the poll to time out")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_work_twice_is_rejected() {
        let worker = Arc::new(worker());
        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.work().await }
        });
        while !worker.is_running() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            worker.work().await,
            Err(GearwireError::InvalidState(_))
        ));

        worker.stop();
        running.await.unwrap().unwrap();
        assert!(!worker.is_running());
    }
}
