//! Error types for gearwire.

use thiserror::Error;

use crate::protocol::PacketType;

/// Main error type for all gearwire operations.
#[derive(Debug, Error)]
pub enum GearwireError {
    /// I/O error during socket operations (connect, read, write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header carried a magic that is neither `\0REQ` nor `\0RES`.
    #[error("Bad packet magic: {0:02x?}")]
    BadMagic([u8; 4]),

    /// Header carried an operation code this crate does not know.
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u32),

    /// Header announced a payload larger than the configured maximum.
    #[error("Payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: u32, max: u32 },

    /// The job server answered with an ERROR packet.
    #[error("Server error {code}: {text}")]
    ServerError { code: String, text: String },

    /// Protocol violation detected locally (bad request packet, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A task did not reach the requested state before its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Connection closed by the server.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No registered server could accept the request.
    #[error("No servers available")]
    NoServersAvailable,

    /// Server has not been registered with this engine.
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    /// The engine refused the request (shut down, job already done, ...).
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Operation attempted in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A task hit a fatal condition while being driven.
    #[error("Task failed while driving {0:?}")]
    TaskFailed(PacketType),

    /// A work packet was delivered to a job with a different handle.
    #[error("Job handle mismatch")]
    JobHandleMismatch,

    /// Operation is not supported by the protocol engine.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl GearwireError {
    /// Whether the byte stream is unusable after this error.
    ///
    /// Framing corruption and unknown operation codes leave the decoder
    /// out of sync with the server; the session must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GearwireError::BadMagic(_)
                | GearwireError::UnknownPacketType(_)
                | GearwireError::PayloadTooLarge { .. }
        )
    }

    /// Whether this is a connectivity failure (connect/read/write).
    pub fn is_connectivity(&self) -> bool {
        matches!(self, GearwireError::Io(_) | GearwireError::ConnectionClosed)
    }
}

/// Result type alias using GearwireError.
pub type Result<T> = std::result::Result<T, GearwireError>;
