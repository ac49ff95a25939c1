//! Frame struct with typed field accessors.
//!
//! Represents a complete protocol frame: direction marker, operation code
//! and payload. The payload is a list of NUL-separated tokens whose names
//! and count are fixed per operation code; the last token is always the
//! raw remainder and may itself contain NUL bytes.
//!
//! # Example
//!
//! ```
//! use gearwire::protocol::{FieldName, Frame, PacketType};
//!
//! let frame = Frame::request_from_fields(PacketType::SubmitJob, &[b"echo", b"u1", b"hi"]);
//!
//! assert_eq!(frame.payload(), b"echo\0u1\0hi");
//! assert_eq!(frame.field(FieldName::FunctionName), "echo");
//! assert_eq!(frame.field(FieldName::Data), "hi");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{Header, Magic, PacketType, HEADER_SIZE};
use crate::error::{GearwireError, Result};

/// Names of the NUL-separated payload tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldName {
    FunctionName,
    UniqueId,
    Data,
    JobHandle,
    Numerator,
    Denominator,
    Known,
    Running,
    ErrorCode,
    ErrorText,
    ClientId,
    Timeout,
    OptionName,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
    Epoch,
}

impl PacketType {
    /// Ordered token layout of this operation's payload.
    pub fn field_layout(self) -> &'static [FieldName] {
        use FieldName::*;
        match self {
            PacketType::CanDo | PacketType::CantDo => &[FunctionName],
            PacketType::CanDoTimeout => &[FunctionName, Timeout],
            PacketType::ResetAbilities
            | PacketType::PreSleep
            | PacketType::Noop
            | PacketType::GrabJob
            | PacketType::GrabJobUniq
            | PacketType::NoJob
            | PacketType::AllYours => &[],
            PacketType::SubmitJob
            | PacketType::SubmitJobBg
            | PacketType::SubmitJobHigh
            | PacketType::SubmitJobHighBg
            | PacketType::SubmitJobLow
            | PacketType::SubmitJobLowBg => &[FunctionName, UniqueId, Data],
            PacketType::SubmitJobSched => &[
                FunctionName,
                UniqueId,
                Minute,
                Hour,
                DayOfMonth,
                Month,
                DayOfWeek,
                Data,
            ],
            PacketType::SubmitJobEpoch => &[FunctionName, UniqueId, Epoch, Data],
            PacketType::JobCreated | PacketType::WorkFail | PacketType::GetStatus => &[JobHandle],
            PacketType::JobAssign => &[JobHandle, FunctionName, Data],
            PacketType::JobAssignUniq => &[JobHandle, FunctionName, UniqueId, Data],
            PacketType::WorkStatus => &[JobHandle, Numerator, Denominator],
            PacketType::WorkComplete
            | PacketType::WorkException
            | PacketType::WorkData
            | PacketType::WorkWarning => &[JobHandle, Data],
            PacketType::EchoReq | PacketType::EchoRes => &[Data],
            PacketType::Error => &[ErrorCode, ErrorText],
            PacketType::StatusRes => &[JobHandle, Known, Running, Numerator, Denominator],
            PacketType::SetClientId => &[ClientId],
            PacketType::OptionReq | PacketType::OptionRes => &[OptionName],
        }
    }
}

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request or response marker.
    pub magic: Magic,
    /// Operation code.
    pub packet_type: PacketType,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(magic: Magic, packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            magic,
            packet_type,
            payload: payload.into(),
        }
    }

    /// Create a request frame.
    pub fn request(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self::new(Magic::Req, packet_type, payload)
    }

    /// Create a response frame.
    pub fn response(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self::new(Magic::Res, packet_type, payload)
    }

    /// Create a request frame whose payload is `parts` joined by NUL.
    pub fn request_from_fields(packet_type: PacketType, parts: &[&[u8]]) -> Self {
        Self::request(packet_type, build_payload(parts))
    }

    /// Create a response frame whose payload is `parts` joined by NUL.
    pub fn response_from_fields(packet_type: PacketType, parts: &[&[u8]]) -> Self {
        Self::response(packet_type, build_payload(parts))
    }

    /// Header describing this frame.
    ///
    /// # Errors
    ///
    /// Fails if the payload does not fit the 32-bit length field.
    pub fn header(&self) -> Result<Header> {
        Ok(Header::new(
            self.magic,
            self.packet_type,
            wire_length(self.payload.len())?,
        ))
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.magic == Magic::Req
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.magic == Magic::Res
    }

    /// Encoded size (header + payload).
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode the frame as a contiguous byte buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded frame to an outbound buffer.
    ///
    /// Nothing is appended if the payload is too large to frame.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let header = self.header()?;
        buf.reserve(self.encoded_len());
        buf.put_slice(&header.encode());
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Extract one named token from the payload.
    ///
    /// Returns an empty value if the field is not part of this operation's
    /// layout or the payload is shorter than the layout.
    pub fn field(&self, name: FieldName) -> Bytes {
        let layout = self.packet_type.field_layout();
        match layout.iter().position(|f| *f == name) {
            Some(index) => self
                .split_tokens(layout.len())
                .into_iter()
                .nth(index)
                .unwrap_or_default(),
            None => Bytes::new(),
        }
    }

    /// Extract a named token as (lossy) UTF-8 text.
    pub fn field_str(&self, name: FieldName) -> String {
        String::from_utf8_lossy(&self.field(name)).into_owned()
    }

    /// All tokens of this frame paired with their names, in layout order.
    pub fn fields(&self) -> Vec<(FieldName, Bytes)> {
        let layout = self.packet_type.field_layout();
        let mut tokens = self.split_tokens(layout.len()).into_iter();
        layout
            .iter()
            .map(|name| (*name, tokens.next().unwrap_or_default()))
            .collect()
    }

    /// Split the payload into at most `count` tokens; the last keeps any NULs.
    fn split_tokens(&self, count: usize) -> Vec<Bytes> {
        if count == 0 {
            return Vec::new();
        }
        let mut tokens = Vec::with_capacity(count);
        let mut start = 0;
        while tokens.len() + 1 < count {
            match self.payload[start..].iter().position(|b| *b == 0) {
                Some(offset) => {
                    tokens.push(self.payload.slice(start..start + offset));
                    start += offset + 1;
                }
                None => break,
            }
        }
        tokens.push(self.payload.slice(start..));
        tokens
    }
}

/// Payload length as carried in the header.
fn wire_length(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        GearwireError::Protocol(format!(
            "payload of {} bytes does not fit a frame header",
            len
        ))
    })
}

/// Join payload tokens with NUL separators.
///
/// # Example
///
/// ```
/// use gearwire::protocol::build_payload;
///
/// let payload = build_payload(&[b"H:1", b"3", b"10"]);
/// assert_eq!(&payload[..], b"H:1\x003\x0010");
/// ```
pub fn build_payload(parts: &[&[u8]]) -> Bytes {
    let size = parts.iter().map(|p| p.len()).sum::<usize>() + parts.len().saturating_sub(1);
    let mut buf = BytesMut::with_capacity(size);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            buf.put_u8(0);
        }
        buf.put_slice(part);
    }
    buf.freeze()
}
