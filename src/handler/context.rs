//! Job context for registered functions.
//!
//! Provides the assigned job's data and identifiers, and methods for
//! reporting intermediate results back to the job server:
//! - `send_data` - partial result (WORK_DATA)
//! - `send_warning` - warning text (WORK_WARNING)
//! - `send_status` - progress numerator/denominator (WORK_STATUS)
//!
//! The terminal frame (WORK_COMPLETE / WORK_FAIL / WORK_EXCEPTION) is sent
//! by the worker from the function's return value.
//!
//! # Example
//!
//! ```
//! use gearwire::handler::{FunctionResult, JobContext, JobOutcome};
//!
//! async fn reverse(ctx: JobContext) -> FunctionResult {
//!     ctx.send_status(1, 2)?;
//!     let mut data = ctx.data().to_vec();
//!     data.reverse();
//!     Ok(JobOutcome::complete(data))
//! }
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::ServerAddr;
use crate::error::{GearwireError, Result};
use crate::protocol::{Frame, PacketType};

/// A request frame addressed to the session it must be written on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub server: ServerAddr,
    pub frame: Frame,
}

/// Sending half of the worker's outbound queue.
pub type Outbox = mpsc::UnboundedSender<OutboundFrame>;

/// Context passed to job functions.
///
/// `JobContext` is `Clone` and can be moved into spawned tasks. Frames it
/// emits travel over a channel to the worker's event loop, which writes
/// them on the session the job was assigned on.
#[derive(Debug, Clone)]
pub struct JobContext {
    function_name: String,
    handle: Bytes,
    unique_id: Bytes,
    data: Bytes,
    server: ServerAddr,
    outbox: Option<Outbox>,
}

impl JobContext {
    /// Create a context without an outbox (frames are discarded).
    pub fn new(
        function_name: impl Into<String>,
        handle: impl Into<Bytes>,
        unique_id: impl Into<Bytes>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            handle: handle.into(),
            unique_id: unique_id.into(),
            data: data.into(),
            server: ServerAddr::default(),
            outbox: None,
        }
    }

    /// Attach the session address and outbound queue.
    pub fn with_outbox(mut self, server: ServerAddr, outbox: Outbox) -> Self {
        self.server = server;
        self.outbox = Some(outbox);
        self
    }

    #[inline]
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Server-assigned job handle.
    #[inline]
    pub fn handle(&self) -> &Bytes {
        &self.handle
    }

    /// Client-supplied unique id (empty unless grabbed with GRAB_JOB_UNIQ).
    #[inline]
    pub fn unique_id(&self) -> &Bytes {
        &self.unique_id
    }

    /// Job payload.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Server the job was assigned by.
    #[inline]
    pub fn server(&self) -> &ServerAddr {
        &self.server
    }

    /// Send a partial result.
    pub fn send_data(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.send_work(PacketType::WorkData, &[data.as_ref()])
    }

    /// Send a warning.
    pub fn send_warning(&self, warning: impl AsRef<[u8]>) -> Result<()> {
        self.send_work(PacketType::WorkWarning, &[warning.as_ref()])
    }

    /// Report progress as `numerator / denominator`.
    pub fn send_status(&self, numerator: u64, denominator: u64) -> Result<()> {
        let num = numerator.to_string();
        let den = denominator.to_string();
        self.send_work(PacketType::WorkStatus, &[num.as_bytes(), den.as_bytes()])
    }

    pub(crate) fn complete(&self, data: &[u8]) -> Result<()> {
        self.send_work(PacketType::WorkComplete, &[data])
    }

    pub(crate) fn fail(&self) -> Result<()> {
        self.send_work(PacketType::WorkFail, &[])
    }

    pub(crate) fn exception(&self, text: &[u8]) -> Result<()> {
        self.send_work(PacketType::WorkException, &[text])
    }

    /// Send a WORK_* frame whose first token is this job's handle.
    fn send_work(&self, packet_type: PacketType, rest: &[&[u8]]) -> Result<()> {
        let outbox = match &self.outbox {
            Some(o) => o,
            None => {
                // No outbox configured (testing mode)
                return Ok(());
            }
        };

        let mut parts: Vec<&[u8]> = Vec::with_capacity(rest.len() + 1);
        parts.push(&self.handle);
        parts.extend_from_slice(rest);

        outbox
            .send(OutboundFrame {
                server: self.server.clone(),
                frame: Frame::request_from_fields(packet_type, &parts),
            })
            .map_err(|_| GearwireError::Rejected("worker outbound queue is closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FieldName;

    fn context_with_outbox() -> (JobContext, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = JobContext::new("reverse", &b"H:1"[..], &b"u1"[..], &b"abc"[..])
            .with_outbox(ServerAddr::new("127.0.0.1", 4730), tx);
        (ctx, rx)
    }

    #[test]
    fn test_context_accessors() {
        let ctx = JobContext::new("reverse", &b"H:1"[..], &b""[..], &b"abc"[..]);
        assert_eq!(ctx.function_name(), "reverse");
        assert_eq!(ctx.handle(), "H:1");
        assert!(ctx.unique_id().is_empty());
        assert_eq!(ctx.data(), "abc");
    }

    #[test]
    fn test_sending_without_outbox() {
        let ctx = JobContext::new("f", &b"H:1"[..], &b""[..], &b""[..]);
        // Should not panic, just return Ok
        assert!(ctx.send_data("x").is_ok());
        assert!(ctx.send_warning("w").is_ok());
        assert!(ctx.send_status(1, 2).is_ok());
    }

    #[test]
    fn test_work_frames_carry_handle() {
        let (ctx, mut rx) = context_with_outbox();

        ctx.send_data(b"part").unwrap();
        ctx.send_warning("careful").unwrap();
        ctx.send_status(3, 10).unwrap();
        ctx.complete(b"cba").unwrap();

        let data = rx.try_recv().unwrap();
        assert_eq!(data.server, ServerAddr::new("127.0.0.1", 4730));
        assert_eq!(data.frame.packet_type, PacketType::WorkData);
        assert_eq!(data.frame.payload(), b"H:1\0part");

        let warning = rx.try_recv().unwrap().frame;
        assert_eq!(warning.packet_type, PacketType::WorkWarning);
        assert_eq!(warning.field(FieldName::Data), "careful");

        let status = rx.try_recv().unwrap().frame;
        assert_eq!(status.payload(), b"H:1\x003\x0010");

        let complete = rx.try_recv().unwrap().frame;
        assert_eq!(complete.packet_type, PacketType::WorkComplete);
        assert_eq!(complete.field(FieldName::Data), "cba");
        assert!(complete.is_request());
    }

    #[test]
    fn test_fail_carries_only_handle() {
        let (ctx, mut rx) = context_with_outbox();
        ctx.fail().unwrap();
        assert_eq!(rx.try_recv().unwrap().frame.payload(), b"H:1");
    }

    #[test]
    fn test_closed_outbox_is_an_error() {
        let (ctx, rx) = context_with_outbox();
        drop(rx);
        assert!(matches!(ctx.send_data("x"), Err(GearwireError::Rejected(_))));
    }
}
