//! Client engine: submits jobs and follows them to completion.
//!
//! The [`ClientBuilder`] configures the client and the servers to use.
//! The [`Client`] owns one session per job server and drives them from the
//! caller's task: every operation queues its request, then drives I/O
//! until the request reaches the state it needs, bounded by the drive
//! timeout.
//!
//! Job creation is serialized: one submission completes its JOB_CREATED
//! handshake before the next one starts, because JOB_CREATED only
//! identifies the job through the order of requests.
//!
//! # Example
//!
//! ```no_run
//! use gearwire::client::{Client, Job};
//!
//! #[tokio::main]
//! async fn main() -> gearwire::Result<()> {
//!     let client = Client::builder()
//!         .server("127.0.0.1:4730".parse()?)
//!         .connect()
//!         .await?;
//!
//!     let job = Job::new("reverse", "hello");
//!     client.submit(&job).await?;
//!     let result = client.wait_for(&job, None).await?;
//!     println!("{}", String::from_utf8_lossy(result.results()));
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

mod job;

pub use job::{Job, JobBuilder, JobPriority, JobResult, JobStatus};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{duration_millis, ClientConfig, ServerAddr};
use crate::error::{GearwireError, Result};
use crate::protocol::{FieldName, Frame, PacketType};
use crate::reactor::Reactor;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionEvent};
use crate::task::{CapturedResponse, Task, TaskState};
use job::JobResponder;

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const TERMINATED: u8 = 2;

const EXCEPTIONS_OPTION: &[u8] = b"exceptions";

/// Builder for configuring and connecting a [`Client`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    servers: Vec<ServerAddr>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a job server to connect to.
    pub fn server(mut self, addr: ServerAddr) -> Self {
        self.servers.push(addr);
        self
    }

    /// Deadline for each request to reach its target state.
    ///
    /// Default: 2 seconds
    pub fn drive_timeout(mut self, timeout: Duration) -> Self {
        self.config.drive_timeout_ms = duration_millis(timeout);
        self
    }

    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = duration_millis(timeout);
        self
    }

    /// How long one reactor poll may block.
    ///
    /// Default: 10 milliseconds
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = duration_millis(interval);
        self
    }

    /// Ask servers to forward WORK_EXCEPTION packets to this client.
    ///
    /// Default: true
    pub fn forward_exceptions(mut self, forward: bool) -> Self {
        self.config.forward_exceptions = forward;
        self
    }

    /// I/O errors tolerated while waiting for a job result.
    ///
    /// Default: 10
    pub fn io_retries(mut self, retries: u32) -> Self {
        self.config.io_retries = retries;
        self
    }

    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.config.receive_buffer_size = size;
        self
    }

    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Build a client without connecting to anything.
    pub fn build(self) -> Client {
        Client::new(self.config)
    }

    /// Build the client and add every configured server.
    ///
    /// # Errors
    ///
    /// Fails on the first server that cannot be added.
    pub async fn connect(self) -> Result<Client> {
        let client = Client::new(self.config);
        for addr in self.servers {
            client.add_server(addr).await?;
        }
        Ok(client)
    }
}

#[derive(Debug, Default)]
struct ClientInner {
    sessions: SessionRegistry,
    reactor: Reactor,
    /// Foreground jobs waiting for WORK_* packets, by session and handle.
    jobs: HashMap<ServerAddr, HashMap<Bytes, Job>>,
    awaiting_creation: Option<Job>,
}

impl ClientInner {
    fn active_jobs(&self) -> usize {
        self.jobs.values().map(HashMap::len).sum()
    }

    fn holds(&self, job: &Job) -> bool {
        match (job.server(), job.handle()) {
            (Some(server), Some(handle)) => self
                .jobs
                .get(&server)
                .map_or(false, |jobs| jobs.contains_key(&handle)),
            _ => false,
        }
    }

    /// Forget the jobs of a session that went away.
    fn abandon_jobs(&mut self, addr: &ServerAddr) {
        if let Some(jobs) = self.jobs.get_mut(addr) {
            if !jobs.is_empty() {
                warn!("Abandoning {} job(s) running on {}", jobs.len(), addr);
            }
            jobs.clear();
        }
    }

    /// Close a session and drop it from the client.
    fn shut_down_session(&mut self, addr: &ServerAddr) {
        if let Some(mut session) = self.sessions.remove_server(addr) {
            session.close();
        }
        self.reactor.deregister(addr);
        self.abandon_jobs(addr);
        self.jobs.remove(addr);
    }
}

/// A job-submitting client.
///
/// All methods take `&self`; wrap the client in an `Arc` to share it
/// between tasks. Operations on one client are serialized.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    inner: Mutex<ClientInner>,
    run_state: AtomicU8,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(ClientInner::default()),
            run_state: AtomicU8::new(RUNNING),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to a job server and register it.
    ///
    /// Adding a server twice is a no-op. When forwarding of exceptions is
    /// enabled the server must confirm the option before it is kept.
    ///
    /// # Errors
    ///
    /// Fails if the client is shut down, the connection cannot be opened,
    /// or the server does not confirm the exceptions option.
    pub async fn add_server(&self, addr: ServerAddr) -> Result<()> {
        self.ensure_running()?;
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains(&addr) {
            debug!("Server {} was previously added, ignoring", addr);
            return Ok(());
        }

        let mut session = Session::new(
            addr.clone(),
            self.config.receive_buffer_size,
            self.config.max_payload_size,
        );
        if let Err(e) = session.open(self.config.connect_timeout()).await {
            warn!("Failed to connect to job server {}: {}", addr, e);
            return Err(e);
        }
        inner.sessions.add_server(session);
        inner.jobs.insert(addr.clone(), HashMap::new());

        if self.config.forward_exceptions {
            if let Err(e) = self.set_forward_exceptions(&mut inner, &addr).await {
                info!("Failed to set forward-exceptions option on {}: {}", addr, e);
                inner.shut_down_session(&addr);
                return Err(e);
            }
        }
        info!("Added job server {}", addr);
        Ok(())
    }

    /// Close and forget a job server. Its running jobs are abandoned.
    ///
    /// # Errors
    ///
    /// Fails if shutdown has begun or the server was never added.
    pub async fn remove_server(&self, addr: &ServerAddr) -> Result<()> {
        if self.is_shutdown() {
            return Err(GearwireError::InvalidState(
                "servers can not be removed once shutdown has begun".into(),
            ));
        }
        let mut inner = self.inner.lock().await;
        if !inner.sessions.contains(addr) {
            return Err(GearwireError::UnknownServer(addr.to_string()));
        }
        inner.shut_down_session(addr);
        info!("Removed job server {}", addr);
        Ok(())
    }

    pub async fn has_server(&self, addr: &ServerAddr) -> bool {
        self.inner.lock().await.sessions.contains(addr)
    }

    /// Registered servers, in address order.
    pub async fn servers(&self) -> Vec<ServerAddr> {
        self.inner.lock().await.sessions.servers()
    }

    /// Foreground jobs created but not finished.
    pub async fn active_jobs(&self) -> usize {
        self.inner.lock().await.active_jobs()
    }

    /// Submit a job and wait until the server has created it.
    ///
    /// The server is picked at random among the registered ones; servers
    /// that cannot be connected are skipped. Background jobs are done when
    /// this returns.
    ///
    /// # Errors
    ///
    /// Fails if the client is shut down, the job was already submitted, no
    /// server is reachable, or creation is not confirmed within the drive
    /// timeout.
    pub async fn submit(&self, job: &Job) -> Result<()> {
        self.ensure_running()?;
        if job.function_name().trim().is_empty() {
            return Err(GearwireError::Rejected("function name can not be empty".into()));
        }
        if job.is_done() || job.handle().is_some() {
            return Err(GearwireError::Rejected(format!(
                "job {} can not be resubmitted",
                job
            )));
        }

        let mut inner = self.inner.lock().await;
        let addr = self.session_for_task(&mut inner).await?;
        let frame = job.submission_frame();
        let submit_type = frame.packet_type;
        let task = Task::with_handler(frame, JobResponder::new(job.clone()))?;
        let state = task.watch();
        match inner.sessions.get_mut(&addr) {
            Some(session) => session.submit(task)?,
            None => return Err(GearwireError::UnknownServer(addr.to_string())),
        }
        job.set_server(addr.clone());
        info!("Submitted job {} to {}", job, addr);

        inner.awaiting_creation = Some(job.clone());
        let driven = self
            .drive_until(&mut inner, state, TaskState::Running, submit_type)
            .await;
        inner.awaiting_creation = None;
        if driven.is_err() {
            self.withdraw_submission(&mut inner, &addr, job);
        }
        driven
    }

    /// Drive I/O until `job` is done and return its result.
    ///
    /// `None` waits without a deadline. Transient I/O errors are retried up
    /// to the configured count.
    ///
    /// # Errors
    ///
    /// Fails if the job was never submitted, its session went away, the
    /// retries run out, or `timeout` expires.
    pub async fn wait_for(&self, job: &Job, timeout: Option<Duration>) -> Result<JobResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut retries = self.config.io_retries;
        let mut inner = self.inner.lock().await;
        loop {
            if job.is_done() {
                break;
            }
            if !inner.holds(job) {
                return Err(match job.handle() {
                    None => GearwireError::InvalidState(format!("job {} has not been created", job)),
                    Some(_) => GearwireError::ConnectionClosed,
                });
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Err(GearwireError::Timeout(format!(
                    "result of job {} not received within {:?}",
                    job,
                    timeout.unwrap_or_default()
                )));
            }
            match self.drive_once(&mut inner).await {
                Ok(()) => {}
                Err(e) if e.is_connectivity() => {
                    retries = retries.saturating_sub(1);
                    warn!(
                        "I/O error while waiting for job {}, {} retries left: {}",
                        job, retries, e
                    );
                    if retries == 0 {
                        return Err(e);
                    }
                }
                Err(e) => debug!("Error on another session while waiting for job {}: {}", job, e),
            }
        }
        job.result()
            .ok_or_else(|| GearwireError::InvalidState(format!("job {} finished without a result", job)))
    }

    /// Ask the job's server for its progress.
    ///
    /// # Errors
    ///
    /// Fails if the job has not been created, its server is gone, or the
    /// answer does not arrive within the drive timeout.
    pub async fn get_job_status(&self, job: &Job) -> Result<JobStatus> {
        self.ensure_running()?;
        let (Some(handle), Some(addr)) = (job.handle(), job.server()) else {
            return Err(GearwireError::InvalidState(format!(
                "job {} has no handle; submit it first",
                job
            )));
        };
        let frame = Frame::request(PacketType::GetStatus, handle);
        let response = self.exchange(&addr, frame).await?;
        JobStatus::from_frame(&response)
    }

    /// Round-trip `data` through a job server.
    pub async fn echo(&self, data: impl Into<Bytes>) -> Result<Bytes> {
        self.ensure_running()?;
        let addr = {
            let mut inner = self.inner.lock().await;
            self.session_for_task(&mut inner).await?
        };
        let response = self
            .exchange(&addr, Frame::request(PacketType::EchoReq, data))
            .await?;
        debug!("Echo request to {} completed", addr);
        Ok(response.field(FieldName::Data))
    }

    /// Jobs can not be withdrawn once submitted.
    pub fn cancel(&self, _job: &Job) -> Result<()> {
        Err(GearwireError::Unsupported("cancelling a submitted job"))
    }

    /// Drive I/O until no foreground job is running.
    ///
    /// Returns whether every job finished. `None` waits without a deadline.
    pub async fn await_termination(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().await;
        while inner.active_jobs() > 0 {
            if inner.sessions.open_servers().is_empty() {
                break;
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                warn!("Timed out waiting for {} job(s) to finish", inner.active_jobs());
                break;
            }
            if let Err(e) = self.drive_once(&mut inner).await {
                warn!("Error while waiting for jobs to finish: {}", e);
            }
        }
        inner.active_jobs() == 0
    }

    /// Stop accepting work, wait for running jobs, then close every session.
    pub async fn shutdown(&self) {
        if self
            .run_state
            .compare_exchange(RUNNING, SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("Commencing controlled shutdown of client");
        self.await_termination(None).await;
        self.shutdown_now().await;
    }

    /// Close every session immediately. Running jobs are abandoned.
    pub async fn shutdown_now(&self) {
        self.run_state.store(SHUTTING_DOWN, Ordering::Release);
        let mut inner = self.inner.lock().await;
        self.terminate(&mut inner);
    }

    /// Whether shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.run_state.load(Ordering::Acquire) != RUNNING
    }

    /// Whether shutdown has completed.
    pub fn is_terminated(&self) -> bool {
        self.run_state.load(Ordering::Acquire) == TERMINATED
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(GearwireError::Rejected("client has been shut down".into()));
        }
        Ok(())
    }

    fn terminate(&self, inner: &mut ClientInner) {
        inner.sessions.close_all();
        inner.jobs.clear();
        inner.reactor.clear();
        inner.awaiting_creation = None;
        self.run_state.store(TERMINATED, Ordering::Release);
        info!("Completed shutdown of client");
    }

    /// Pick a session at random, connecting it if needed; on failure try
    /// the following servers in order.
    async fn session_for_task(&self, inner: &mut ClientInner) -> Result<ServerAddr> {
        let servers = inner.sessions.servers();
        if servers.is_empty() {
            return Err(GearwireError::NoServersAvailable);
        }
        let start = rand::thread_rng().gen_range(0..servers.len());
        for offset in 0..servers.len() {
            let addr = &servers[(start + offset) % servers.len()];
            let Some(session) = inner.sessions.get_mut(addr) else {
                continue;
            };
            if session.is_open() {
                return Ok(addr.clone());
            }
            match session.open(self.config.connect_timeout()).await {
                Ok(()) => {
                    inner.jobs.entry(addr.clone()).or_default();
                    return Ok(addr.clone());
                }
                Err(e) => warn!("Could not reconnect to {}, trying next server: {}", addr, e),
            }
        }
        Err(GearwireError::NoServersAvailable)
    }

    /// Undo a submission whose creation was not confirmed.
    ///
    /// The request may still be answered later, and a late JOB_CREATED
    /// would be matched against whatever task heads the queue by then, so
    /// the session is closed. It is reopened by the next submission.
    fn withdraw_submission(&self, inner: &mut ClientInner, addr: &ServerAddr, job: &Job) {
        if let Some(session) = inner.sessions.get_mut(addr) {
            if session.is_open() {
                warn!(
                    "Closing session {} after failed submission of job {}",
                    addr, job
                );
                session.close();
                inner.reactor.deregister(addr);
            }
        }
        inner.abandon_jobs(addr);
        job.reset_submission();
    }

    /// Send one request on `addr` and return its single response.
    async fn exchange(&self, addr: &ServerAddr, frame: Frame) -> Result<Frame> {
        let request_type = frame.packet_type;
        let captured = CapturedResponse::new();
        let task = Task::with_handler(frame, captured.clone())?;
        let state = task.watch();

        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(addr) {
            Some(session) if session.is_open() => session.submit(task)?,
            Some(_) => return Err(GearwireError::ConnectionClosed),
            None => return Err(GearwireError::UnknownServer(addr.to_string())),
        }
        self.drive_until(&mut inner, state, TaskState::Finished, request_type)
            .await?;
        captured.take().ok_or_else(|| {
            GearwireError::Protocol(format!("{} finished without a response", request_type))
        })
    }

    async fn set_forward_exceptions(&self, inner: &mut ClientInner, addr: &ServerAddr) -> Result<()> {
        let captured = CapturedResponse::new();
        let task = Task::with_handler(
            Frame::request(PacketType::OptionReq, Bytes::from_static(EXCEPTIONS_OPTION)),
            captured.clone(),
        )?;
        let state = task.watch();
        match inner.sessions.get_mut(addr) {
            Some(session) => session.submit(task)?,
            None => return Err(GearwireError::UnknownServer(addr.to_string())),
        }
        self.drive_until(inner, state, TaskState::Finished, PacketType::OptionReq)
            .await?;
        match captured.take() {
            Some(response) if response.field(FieldName::OptionName) == EXCEPTIONS_OPTION => Ok(()),
            _ => Err(GearwireError::Rejected(format!(
                "{} did not confirm the exceptions option",
                addr
            ))),
        }
    }

    /// Drive I/O until the watched task reaches `target`, bounded by the
    /// drive timeout.
    async fn drive_until(
        &self,
        inner: &mut ClientInner,
        mut state: watch::Receiver<TaskState>,
        target: TaskState,
        request_type: PacketType,
    ) -> Result<()> {
        let limit = self.config.drive_timeout();
        let driven = tokio::time::timeout(limit, async {
            loop {
                let current = *state.borrow_and_update();
                if current == TaskState::Exception {
                    return Err(GearwireError::TaskFailed(request_type));
                }
                if current >= target {
                    return Ok(());
                }
                if state.has_changed().is_err() {
                    // The session dropped the task; only its last state counts
                    let last = *state.borrow();
                    if last >= target && last != TaskState::Exception {
                        return Ok(());
                    }
                    return Err(GearwireError::ConnectionClosed);
                }
                if let Err(e) = self.drive_once(inner).await {
                    // The watched task may have advanced in the same round
                    let current = *state.borrow();
                    if current >= target && current != TaskState::Exception {
                        return Ok(());
                    }
                    return Err(e);
                }
            }
        })
        .await;

        driven.unwrap_or_else(|_| {
            Err(GearwireError::Timeout(format!(
                "{} did not reach {} within {:?}",
                request_type, target, limit
            )))
        })
    }

    /// One reactor round: wait for readiness, then drive every ready session.
    ///
    /// Returns the first error met; remaining sessions are still driven.
    async fn drive_once(&self, inner: &mut ClientInner) -> Result<()> {
        inner.reactor.update_interests(&inner.sessions);
        let ready = inner
            .reactor
            .select(&inner.sessions, self.config.poll_interval())
            .await;
        trace!("Driving I/O for {} ready session(s)", ready.len());

        let mut first_error = None;
        for addr in ready {
            if let Err(e) = self.drive_session(inner, &addr) {
                first_error.get_or_insert(e);
            }
            if self.is_terminated() {
                break;
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn drive_session(&self, inner: &mut ClientInner, addr: &ServerAddr) -> Result<()> {
        let Some(session) = inner.sessions.get_mut(addr) else {
            return Ok(());
        };
        if !session.is_open() {
            return Ok(());
        }
        let driven = session.drive_io();
        let events = session.drain_events();

        let mut outcome = driven;
        for event in events {
            if let Err(e) = self.handle_session_event(inner, addr, event) {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        if let Err(e) = &outcome {
            if e.is_fatal() {
                warn!("Session {} is corrupt, shutting it down: {}", addr, e);
                self.drop_session(inner, addr);
            }
        }
        outcome
    }

    fn handle_session_event(
        &self,
        inner: &mut ClientInner,
        addr: &ServerAddr,
        event: SessionEvent,
    ) -> Result<()> {
        let frame = match event {
            SessionEvent::Response(frame) => frame,
            SessionEvent::Mismatch { .. } => return Ok(()),
            SessionEvent::Disconnected => {
                inner.abandon_jobs(addr);
                return Ok(());
            }
        };

        match frame.packet_type {
            PacketType::JobCreated => {
                let Some(job) = inner.awaiting_creation.clone() else {
                    warn!("Received JOB_CREATED from {} but no job is awaiting creation", addr);
                    return Ok(());
                };
                if !job.is_background() {
                    if let Some(handle) = job.handle() {
                        inner.jobs.entry(addr.clone()).or_default().insert(handle, job);
                    }
                }
                Ok(())
            }
            PacketType::WorkData
            | PacketType::WorkStatus
            | PacketType::WorkWarning
            | PacketType::WorkComplete
            | PacketType::WorkFail
            | PacketType::WorkException => {
                let handle = frame.field(FieldName::JobHandle);
                let jobs = inner.jobs.entry(addr.clone()).or_default();
                let Some(job) = jobs.get(&handle).cloned() else {
                    warn!(
                        "Received {} from {} for unknown job {}",
                        frame.packet_type,
                        addr,
                        String::from_utf8_lossy(&handle)
                    );
                    return Ok(());
                };
                if let Err(e) = job.on_work(&frame) {
                    warn!("Job {} rejected {}: {}", job, frame.packet_type, e);
                }
                if job.is_done() {
                    jobs.remove(&handle);
                }
                Ok(())
            }
            // Already delivered to the task that asked
            PacketType::StatusRes | PacketType::EchoRes | PacketType::OptionRes => Ok(()),
            PacketType::Error => {
                let code = frame.field_str(FieldName::ErrorCode);
                let text = frame.field_str(FieldName::ErrorText);
                warn!(
                    "Received error {} ({}) from {}, shutting session down",
                    code, text, addr
                );
                self.drop_session(inner, addr);
                Err(GearwireError::ServerError { code, text })
            }
            other => {
                warn!(
                    "Received unexpected {} from {}, shutting session down",
                    other, addr
                );
                self.drop_session(inner, addr);
                Err(GearwireError::Protocol(format!(
                    "unexpected {} from {}",
                    other, addr
                )))
            }
        }
    }

    /// Shut a session down; with no servers left the client terminates.
    fn drop_session(&self, inner: &mut ClientInner, addr: &ServerAddr) {
        inner.shut_down_session(addr);
        if inner.sessions.is_empty() && !self.is_terminated() {
            info!("No job servers left, shutting client down");
            self.run_state.store(SHUTTING_DOWN, Ordering::Release);
            self.terminate(inner);
        }
    }
}
