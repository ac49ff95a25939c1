//! Client-side jobs and what the server reports about them.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::ServerAddr;
use crate::error::{GearwireError, Result};
use crate::protocol::{FieldName, Frame, PacketType};
use crate::task::ResponseHandler;

/// Queue priority requested on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Submission operation code for this priority.
    pub fn submit_type(self, background: bool) -> PacketType {
        match (self, background) {
            (JobPriority::High, false) => PacketType::SubmitJobHigh,
            (JobPriority::High, true) => PacketType::SubmitJobHighBg,
            (JobPriority::Normal, false) => PacketType::SubmitJob,
            (JobPriority::Normal, true) => PacketType::SubmitJobBg,
            (JobPriority::Low, false) => PacketType::SubmitJobLow,
            (JobPriority::Low, true) => PacketType::SubmitJobLowBg,
        }
    }
}

/// Accumulated outcome of a job.
///
/// Data, warning and exception fragments are appended in arrival order.
/// Numerator and denominator are -1 until the server reports progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    handle: Bytes,
    succeeded: bool,
    results: Vec<u8>,
    warnings: Vec<u8>,
    exceptions: Vec<u8>,
    numerator: i64,
    denominator: i64,
}

impl JobResult {
    /// Empty, unsuccessful result for `handle`.
    pub fn new(handle: impl Into<Bytes>) -> Self {
        Self {
            handle: handle.into(),
            succeeded: false,
            results: Vec::new(),
            warnings: Vec::new(),
            exceptions: Vec::new(),
            numerator: -1,
            denominator: -1,
        }
    }

    fn update(handle: &Bytes, succeeded: bool, results: &[u8], numerator: i64, denominator: i64) -> Self {
        Self {
            succeeded,
            results: results.to_vec(),
            numerator,
            denominator,
            ..Self::new(handle.clone())
        }
    }

    /// Fold a later result for the same job into this one.
    ///
    /// Buffers are appended, `succeeded` is taken from `later`, and
    /// progress is taken from `later` unless it is unset (-1).
    ///
    /// # Errors
    ///
    /// [`GearwireError::JobHandleMismatch`] if the handles differ.
    pub fn merge(&mut self, later: &JobResult) -> Result<()> {
        if self.handle != later.handle {
            return Err(GearwireError::JobHandleMismatch);
        }
        self.results.extend_from_slice(&later.results);
        self.warnings.extend_from_slice(&later.warnings);
        self.exceptions.extend_from_slice(&later.exceptions);
        if later.numerator != -1 {
            self.numerator = later.numerator;
        }
        if later.denominator != -1 {
            self.denominator = later.denominator;
        }
        self.succeeded = later.succeeded;
        Ok(())
    }

    pub fn handle(&self) -> &Bytes {
        &self.handle
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn results(&self) -> &[u8] {
        &self.results
    }

    pub fn warnings(&self) -> &[u8] {
        &self.warnings
    }

    pub fn exceptions(&self) -> &[u8] {
        &self.exceptions
    }

    pub fn numerator(&self) -> i64 {
        self.numerator
    }

    pub fn denominator(&self) -> i64 {
        self.denominator
    }
}

/// Answer to a GET_STATUS query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobStatus {
    known: bool,
    running: bool,
    numerator: i64,
    denominator: i64,
}

impl JobStatus {
    /// Parse a STATUS_RES frame.
    ///
    /// Flags are false when their token is empty or starts with `'0'`.
    /// Non-numeric progress values are reported as 0.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.packet_type != PacketType::StatusRes {
            return Err(GearwireError::Protocol(format!(
                "cannot read job status from {}",
                frame.packet_type
            )));
        }
        Ok(Self {
            known: flag(&frame.field(FieldName::Known)),
            running: flag(&frame.field(FieldName::Running)),
            numerator: number(&frame.field(FieldName::Numerator), "numerator"),
            denominator: number(&frame.field(FieldName::Denominator), "denominator"),
        })
    }

    pub fn is_known(&self) -> bool {
        self.known
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn numerator(&self) -> i64 {
        self.numerator
    }

    pub fn denominator(&self) -> i64 {
        self.denominator
    }
}

fn flag(token: &[u8]) -> bool {
    !matches!(token.first(), None | Some(b'0'))
}

fn number(token: &[u8], what: &str) -> i64 {
    let text = String::from_utf8_lossy(token);
    text.trim().parse().unwrap_or_else(|_| {
        debug!("Non-numeric {} '{}' reported, using 0", what, text);
        0
    })
}

#[derive(Debug, Clone)]
struct JobSpec {
    function_name: String,
    unique_id: Bytes,
    data: Bytes,
    priority: JobPriority,
    background: bool,
}

#[derive(Debug, Default)]
struct JobState {
    handle: Option<Bytes>,
    server: Option<ServerAddr>,
    result: Option<JobResult>,
    done: bool,
}

/// Builder for [`Job`].
#[derive(Debug)]
pub struct JobBuilder {
    spec: JobSpec,
}

impl JobBuilder {
    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.spec.data = data.into();
        self
    }

    /// Client-chosen unique id. Defaults to a random UUID.
    pub fn unique_id(mut self, unique_id: impl Into<Bytes>) -> Self {
        self.spec.unique_id = unique_id.into();
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.spec.priority = priority;
        self
    }

    /// Background jobs are done as soon as the server accepts them.
    pub fn background(mut self, background: bool) -> Self {
        self.spec.background = background;
        self
    }

    pub fn build(self) -> Job {
        Job {
            spec: Arc::new(self.spec),
            state: Arc::new(Mutex::new(JobState::default())),
        }
    }
}

/// A unit of work submitted by a client.
///
/// `Job` is a cheap handle: clones observe the same progress, so the
/// caller keeps one while the client engine updates another.
#[derive(Clone)]
pub struct Job {
    spec: Arc<JobSpec>,
    state: Arc<Mutex<JobState>>,
}

impl Job {
    /// Foreground, normal-priority job.
    pub fn new(function_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::builder(function_name).data(data).build()
    }

    /// Background, normal-priority job.
    pub fn background(function_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::builder(function_name).data(data).background(true).build()
    }

    pub fn builder(function_name: impl Into<String>) -> JobBuilder {
        JobBuilder {
            spec: JobSpec {
                function_name: function_name.into(),
                unique_id: Bytes::from(uuid::Uuid::new_v4().to_string()),
                data: Bytes::new(),
                priority: JobPriority::Normal,
                background: false,
            },
        }
    }

    pub fn function_name(&self) -> &str {
        &self.spec.function_name
    }

    pub fn unique_id(&self) -> &Bytes {
        &self.spec.unique_id
    }

    pub fn data(&self) -> &Bytes {
        &self.spec.data
    }

    pub fn priority(&self) -> JobPriority {
        self.spec.priority
    }

    pub fn is_background(&self) -> bool {
        self.spec.background
    }

    /// Server-assigned handle, once the job has been created.
    pub fn handle(&self) -> Option<Bytes> {
        self.lock().handle.clone()
    }

    /// Server the job was submitted to.
    pub fn server(&self) -> Option<ServerAddr> {
        self.lock().server.clone()
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Snapshot of the result accumulated so far.
    pub fn result(&self) -> Option<JobResult> {
        self.lock().result.clone()
    }

    /// The SUBMIT_JOB* request announcing this job.
    pub fn submission_frame(&self) -> Frame {
        let spec = &self.spec;
        Frame::request_from_fields(
            spec.priority.submit_type(spec.background),
            &[spec.function_name.as_bytes(), &spec.unique_id[..], &spec.data[..]],
        )
    }

    pub(crate) fn set_server(&self, server: ServerAddr) {
        self.lock().server = Some(server);
    }

    /// Forget a submission that was never confirmed, so the job can be
    /// submitted again.
    pub(crate) fn reset_submission(&self) {
        *self.lock() = JobState::default();
    }

    pub(crate) fn on_created(&self, handle: Bytes) -> Result<()> {
        let mut state = self.lock();
        if let Some(existing) = &state.handle {
            return Err(GearwireError::Protocol(format!(
                "job {} already has handle {}, duplicate JOB_CREATED",
                self,
                String::from_utf8_lossy(existing)
            )));
        }
        info!("Job {} created as {}", self, String::from_utf8_lossy(&handle));
        if self.spec.background {
            let mut result = JobResult::new(handle.clone());
            result.succeeded = true;
            state.result = Some(result);
            state.done = true;
        } else {
            state.result = Some(JobResult::new(handle.clone()));
        }
        state.handle = Some(handle);
        Ok(())
    }

    /// Apply one WORK_* update.
    pub(crate) fn on_work(&self, frame: &Frame) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let handle = match &state.handle {
            Some(handle) if *handle == frame.field(FieldName::JobHandle) => handle.clone(),
            _ => return Err(GearwireError::JobHandleMismatch),
        };
        let result = state
            .result
            .get_or_insert_with(|| JobResult::new(handle.clone()));

        debug!("Job {} received {}", self, frame.packet_type);
        match frame.packet_type {
            PacketType::WorkStatus => {
                let numerator = number(&frame.field(FieldName::Numerator), "numerator");
                let denominator = number(&frame.field(FieldName::Denominator), "denominator");
                result.merge(&JobResult::update(&handle, false, &[], numerator, denominator))?;
            }
            PacketType::WorkData => result.results.extend_from_slice(&frame.field(FieldName::Data)),
            PacketType::WorkWarning => {
                result.warnings.extend_from_slice(&frame.field(FieldName::Data))
            }
            PacketType::WorkComplete => {
                result.merge(&JobResult::update(&handle, true, &frame.field(FieldName::Data), -1, -1))?;
                state.done = true;
            }
            PacketType::WorkFail => {
                result.merge(&JobResult::update(&handle, false, &[], -1, -1))?;
                state.done = true;
            }
            PacketType::WorkException => {
                result
                    .exceptions
                    .extend_from_slice(&frame.field(FieldName::Data));
                state.done = true;
            }
            other => {
                return Err(GearwireError::Protocol(format!(
                    "job {} cannot handle {}",
                    self, other
                )))
            }
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.spec.function_name,
            String::from_utf8_lossy(&self.spec.unique_id)
        )
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("spec", &self.spec)
            .field("state", &*self.lock())
            .finish()
    }
}

/// Response handler of a submission task.
pub(crate) struct JobResponder {
    job: Job,
}

impl JobResponder {
    pub(crate) fn new(job: Job) -> Self {
        Self { job }
    }
}

impl ResponseHandler for JobResponder {
    fn handle_response(&mut self, frame: &Frame) -> Result<()> {
        match frame.packet_type {
            PacketType::JobCreated => self.job.on_created(frame.field(FieldName::JobHandle)),
            _ => self.job.on_work(frame),
        }
    }

    fn is_done(&self) -> bool {
        self.job.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(job: &Job, handle: &'static str) {
        job.on_created(Bytes::from_static(handle.as_bytes())).unwrap();
    }

    fn work(packet_type: PacketType, fields: &[&[u8]]) -> Frame {
        Frame::response_from_fields(packet_type, fields)
    }

    #[test]
    fn test_priority_matrix() {
        let cases = [
            (JobPriority::High, false, PacketType::SubmitJobHigh),
            (JobPriority::High, true, PacketType::SubmitJobHighBg),
            (JobPriority::Normal, false, PacketType::SubmitJob),
            (JobPriority::Normal, true, PacketType::SubmitJobBg),
            (JobPriority::Low, false, PacketType::SubmitJobLow),
            (JobPriority::Low, true, PacketType::SubmitJobLowBg),
        ];
        for (priority, background, expected) in cases {
            assert_eq!(priority.submit_type(background), expected);
        }
    }

    #[test]
    fn test_submission_frame_encoding() {
        let job = Job::builder("echo").unique_id("u1").data("hi").build();
        let frame = job.submission_frame();
        assert_eq!(frame.packet_type, PacketType::SubmitJob);
        assert_eq!(frame.payload(), b"echo\0u1\0hi");
        assert!(frame.is_request());

        let low_bg = Job::builder("f")
            .unique_id("u")
            .priority(JobPriority::Low)
            .background(true)
            .build();
        assert_eq!(low_bg.submission_frame().packet_type, PacketType::SubmitJobLowBg);
    }

    #[test]
    fn test_default_unique_id_is_random() {
        let a = Job::new("f", "x");
        let b = Job::new("f", "x");
        assert_eq!(a.unique_id().len(), 36);
        assert_ne!(a.unique_id(), b.unique_id());
    }

    #[test]
    fn test_background_job_done_on_creation() {
        let job = Job::background("reverse", "abc");
        created(&job, "H1");

        assert!(job.is_done());
        let result = job.result().unwrap();
        assert!(result.succeeded());
        assert!(result.results().is_empty());
        assert_eq!(result.handle(), "H1");
    }

    #[test]
    fn test_duplicate_creation_is_rejected() {
        let job = Job::new("reverse", "abc");
        created(&job, "H1");
        assert!(job.on_created(Bytes::from_static(b"H2")).is_err());
        assert_eq!(job.handle().unwrap(), "H1");
    }

    #[test]
    fn test_work_updates_accumulate() {
        let job = Job::new("reverse", "abc");
        created(&job, "H1");

        job.on_work(&work(PacketType::WorkStatus, &[b"H1", b"1", b"2"])).unwrap();
        job.on_work(&work(PacketType::WorkData, &[b"H1", b"c"])).unwrap();
        job.on_work(&work(PacketType::WorkWarning, &[b"H1", b"slow"])).unwrap();
        assert!(!job.is_done());

        job.on_work(&work(PacketType::WorkComplete, &[b"H1", b"ba"])).unwrap();
        assert!(job.is_done());

        let result = job.result().unwrap();
        assert!(result.succeeded());
        assert_eq!(result.results(), b"cba");
        assert_eq!(result.warnings(), b"slow");
        assert_eq!(result.numerator(), 1);
        assert_eq!(result.denominator(), 2);
    }

    #[test]
    fn test_work_exception_and_fail_finish_the_job() {
        let job = Job::new("f", "");
        created(&job, "H1");
        job.on_work(&work(PacketType::WorkException, &[b"H1", b"boom"])).unwrap();
        assert!(job.is_done());
        let result = job.result().unwrap();
        assert!(!result.succeeded());
        assert_eq!(result.exceptions(), b"boom");

        let job = Job::new("f", "");
        created(&job, "H2");
        job.on_work(&work(PacketType::WorkFail, &[b"H2"])).unwrap();
        assert!(job.is_done());
        assert!(!job.result().unwrap().succeeded());
    }

    #[test]
    fn test_work_for_other_handle() {
        let job = Job::new("f", "");
        assert!(matches!(
            job.on_work(&work(PacketType::WorkData, &[b"H1", b"x"])),
            Err(GearwireError::JobHandleMismatch)
        ));

        created(&job, "H1");
        assert!(matches!(
            job.on_work(&work(PacketType::WorkData, &[b"H9", b"x"])),
            Err(GearwireError::JobHandleMismatch)
        ));
    }

    #[test]
    fn test_non_numeric_progress_is_zero() {
        let job = Job::new("f", "");
        created(&job, "H1");
        job.on_work(&work(PacketType::WorkStatus, &[b"H1", b"lots", b"10"])).unwrap();
        let result = job.result().unwrap();
        assert_eq!(result.numerator(), 0);
        assert_eq!(result.denominator(), 10);
    }

    #[test]
    fn test_merge_rules() {
        let mut first = JobResult::new("H1");
        first.results.extend_from_slice(b"ab");
        first.numerator = 1;
        first.denominator = 4;

        let mut later = JobResult::new("H1");
        later.results.extend_from_slice(b"c");
        later.warnings.extend_from_slice(b"w");
        later.denominator = 8;
        later.succeeded = true;

        first.merge(&later).unwrap();
        assert_eq!(first.results(), b"abc");
        assert_eq!(first.warnings(), b"w");
        assert_eq!(first.numerator(), 1);
        assert_eq!(first.denominator(), 8);
        assert!(first.succeeded());

        assert!(matches!(
            first.merge(&JobResult::new("H2")),
            Err(GearwireError::JobHandleMismatch)
        ));
    }

    #[test]
    fn test_status_parsing() {
        let frame = Frame::response_from_fields(
            PacketType::StatusRes,
            &[b"H1", b"1", b"1", b"3", b"10"],
        );
        let status = JobStatus::from_frame(&frame).unwrap();
        assert!(status.is_known());
        assert!(status.is_running());
        assert_eq!(status.numerator(), 3);
        assert_eq!(status.denominator(), 10);

        let unknown = Frame::response_from_fields(PacketType::StatusRes, &[b"H1", b"0", b"", b"x", b""]);
        let status = JobStatus::from_frame(&unknown).unwrap();
        assert!(!status.is_known());
        assert!(!status.is_running());
        assert_eq!(status.numerator(), 0);

        let wrong = Frame::response(PacketType::EchoRes, Bytes::new());
        assert!(JobStatus::from_frame(&wrong).is_err());
    }

    #[test]
    fn test_responder_tracks_job() {
        let job = Job::background("f", "");
        let mut responder = JobResponder::new(job.clone());
        assert!(!responder.is_done());

        responder
            .handle_response(&Frame::response(PacketType::JobCreated, &b"H1"[..]))
            .unwrap();
        assert!(responder.is_done());
        assert_eq!(job.handle().unwrap(), "H1");
    }
}
