//! One request/response exchange with a job server.
//!
//! A [`Task`] wraps the request frame and an optional [`ResponseHandler`].
//! It is fed every frame that concerns it: the local copy of its own
//! request when that request is written to the socket, then the server's
//! responses. The resulting state is mirrored on a `tokio::sync::watch`
//! channel so the submitter can wait for a target state while the session
//! owns the task.
//!
//! ```text
//! NEW ──REQ──▶ SUBMITTED ──RES──▶ RUNNING ──RES (handler done)──▶ FINISHED
//!  │                                 │
//!  └──REQ (no response expected)──▶ FINISHED
//!                                    └──RES (no handler / handler error)──▶ EXCEPTION
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{GearwireError, Result};
use crate::protocol::{Frame, PacketType};

/// Lifecycle of a task. Ordered: later states compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    New,
    Submitted,
    Running,
    Finished,
    Exception,
}

impl TaskState {
    /// FINISHED or EXCEPTION.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Exception)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::New => "NEW",
            TaskState::Submitted => "SUBMITTED",
            TaskState::Running => "RUNNING",
            TaskState::Finished => "FINISHED",
            TaskState::Exception => "EXCEPTION",
        };
        f.write_str(name)
    }
}

/// Receives the response frames of a running task.
///
/// Returning an error moves the task to EXCEPTION.
pub trait ResponseHandler: Send + Sync {
    /// Consume one response frame.
    fn handle_response(&mut self, frame: &Frame) -> Result<()>;

    /// Whether the exchange is complete.
    fn is_done(&self) -> bool;
}

/// Handler that completes on the first response and keeps it.
///
/// Clones share the captured frame, so the submitter keeps one clone and
/// hands the other to the task.
#[derive(Debug, Clone, Default)]
pub struct CapturedResponse {
    slot: Arc<Mutex<Option<Frame>>>,
    done: bool,
}

impl CapturedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the captured response, if one has arrived.
    pub fn take(&self) -> Option<Frame> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl ResponseHandler for CapturedResponse {
    fn handle_response(&mut self, frame: &Frame) -> Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame.clone());
        self.done = true;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// A single outstanding request/response exchange.
pub struct Task {
    state: TaskState,
    request: Frame,
    handler: Option<Box<dyn ResponseHandler>>,
    state_tx: watch::Sender<TaskState>,
}

impl Task {
    /// Create a task for a request frame.
    ///
    /// # Errors
    ///
    /// Fails if `request` is not a request frame.
    pub fn new(request: Frame, handler: Option<Box<dyn ResponseHandler>>) -> Result<Self> {
        if !request.is_request() {
            return Err(GearwireError::InvalidState(format!(
                "{} is not a request frame",
                request.packet_type
            )));
        }
        let (state_tx, _) = watch::channel(TaskState::New);
        Ok(Self {
            state: TaskState::New,
            request,
            handler,
            state_tx,
        })
    }

    /// Task without a response handler.
    pub fn fire_and_forget(request: Frame) -> Result<Self> {
        Self::new(request, None)
    }

    /// Task whose responses go to `handler`.
    pub fn with_handler(request: Frame, handler: impl ResponseHandler + 'static) -> Result<Self> {
        Self::new(request, Some(Box::new(handler)))
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[inline]
    pub fn request(&self) -> &Frame {
        &self.request
    }

    /// Operation code of the request.
    #[inline]
    pub fn request_type(&self) -> PacketType {
        self.request.packet_type
    }

    /// Observe state changes after the task has been handed to a session.
    pub fn watch(&self) -> watch::Receiver<TaskState> {
        self.state_tx.subscribe()
    }

    /// Feed one frame through the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`GearwireError::TaskFailed`] when the task is or becomes
    /// EXCEPTION.
    pub fn handle_event(&mut self, frame: &Frame) -> Result<()> {
        loop {
            match self.state {
                TaskState::New => {
                    if frame.is_request() {
                        if self.request.packet_type.requires_response() {
                            self.set_state(TaskState::Submitted);
                        } else {
                            self.set_state(TaskState::Finished);
                        }
                    }
                    return Ok(());
                }
                TaskState::Submitted => {
                    if !frame.is_response() {
                        return Ok(());
                    }
                    // The same frame is then delivered to the handler
                    self.set_state(TaskState::Running);
                }
                TaskState::Running => {
                    if !frame.is_response() {
                        return Ok(());
                    }
                    let Some(handler) = self.handler.as_mut() else {
                        warn!(
                            "{} expects a response but has no response handler",
                            self.request.packet_type
                        );
                        self.set_state(TaskState::Exception);
                        continue;
                    };
                    match handler.handle_response(frame) {
                        Ok(()) if handler.is_done() => self.set_state(TaskState::Finished),
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            warn!("{} response handler failed: {}", self.request.packet_type, e);
                            self.set_state(TaskState::Exception);
                        }
                    }
                }
                TaskState::Finished => return Ok(()),
                TaskState::Exception => {
                    return Err(GearwireError::TaskFailed(self.request.packet_type))
                }
            }
        }
    }

    fn set_state(&mut self, next: TaskState) {
        if next != self.state {
            debug!(
                "Task {} changing state from {} to {}",
                self.request.packet_type, self.state, next
            );
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state)
            .field("request", &self.request.packet_type)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}
