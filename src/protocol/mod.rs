//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary job-queue protocol:
//! - 12-byte header encoding/decoding (magic, operation code, length)
//! - Frame buffer for accumulating partial reads
//! - Frame struct with named NUL-delimited field extraction

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_payload, FieldName, Frame};
pub use frame_buffer::{FrameBuffer, DEFAULT_RECEIVE_BUFFER_SIZE};
pub use wire_format::{
    Header, Magic, PacketType, DEFAULT_HOST, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_PORT, HEADER_SIZE,
    REQ_MAGIC, RES_MAGIC,
};
