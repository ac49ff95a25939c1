//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 12 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes
//!
//! The buffer also serves as the socket's receive window: [`FrameBuffer::read_buf`]
//! hands out the underlying `BytesMut`, doubling its capacity whenever the
//! unread bytes have filled it.
//!
//! # Example
//!
//! ```
//! use gearwire::protocol::{FrameBuffer, Frame, PacketType};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = Frame::response(PacketType::Noop, bytes::Bytes::new()).encode().unwrap();
//!
//! let frames = buffer.push(&bytes).unwrap();
//! assert_eq!(frames[0].packet_type, PacketType::Noop);
//! ```

use bytes::BytesMut;

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// Default initial receive window (32 KiB).
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 32 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 12 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Current receive window; doubles when unread data fills it.
    window: usize,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default window: 32KB, max payload: 1GB.
    pub fn new() -> Self {
        Self::with_capacity_and_max_payload(DEFAULT_RECEIVE_BUFFER_SIZE, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self::with_capacity_and_max_payload(DEFAULT_RECEIVE_BUFFER_SIZE, max_payload_size)
    }

    /// Create a new frame buffer with custom capacity and max payload.
    pub fn with_capacity_and_max_payload(capacity: usize, max_payload_size: u32) -> Self {
        let window = capacity.max(HEADER_SIZE);
        Self {
            buffer: BytesMut::with_capacity(window),
            state: State::WaitingForHeader,
            window,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns a vector of complete frames. If data is fragmented,
    /// partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns a fatal error on bad magic, unknown operation code, or a
    /// payload exceeding `max_payload_size`.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);
        self.extract_frames()
    }

    /// Receive window for the next socket read.
    ///
    /// Doubles the window first if the unread bytes have filled it.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        if self.buffer.len() >= self.window {
            self.window *= 2;
        }
        let spare = self.window - self.buffer.len();
        self.buffer.reserve(spare);
        &mut self.buffer
    }

    /// Extract every complete frame currently buffered.
    pub fn extract_frames(&mut self) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the stream is corrupt
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::WaitingForHeader => {
                let header = match Header::decode(&self.buffer)? {
                    Some(header) => header,
                    None => return Ok(None),
                };
                header.validate(self.max_payload_size)?;

                let _ = self.buffer.split_to(HEADER_SIZE);
                self.state = State::WaitingForPayload { header };

                // Try to get payload immediately
                self.try_extract_one()
            }

            State::WaitingForPayload { header } => {
                let remaining = header.payload_length as usize;
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(remaining).freeze();
                let header = *header;

                self.state = State::WaitingForHeader;

                Ok(Some(Frame::new(header.magic, header.packet_type, payload)))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current receive window size.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
