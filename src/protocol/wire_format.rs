//! Wire format encoding and decoding.
//!
//! Implements the 12-byte header format:
//! ```text
//! ┌──────────┬──────────┬──────────┐
//! │ Magic    │ Type     │ Length   │
//! │ 4 bytes  │ 4 bytes  │ 4 bytes  │
//! │ \0REQ/RES│ uint32 BE│ uint32 BE│
//! └──────────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use std::fmt;

use crate::error::{GearwireError, Result};

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// Default maximum payload size (1 GB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

/// Default job server port.
pub const DEFAULT_PORT: u16 = 4730;

/// Default job server host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Magic bytes of a request packet.
pub const REQ_MAGIC: [u8; 4] = *b"\0REQ";

/// Magic bytes of a response packet.
pub const RES_MAGIC: [u8; 4] = *b"\0RES";

/// Packet direction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    /// Client/worker → server.
    Req,
    /// Server → client/worker.
    Res,
}

impl Magic {
    /// Raw 4-byte marker.
    #[inline]
    pub fn to_bytes(self) -> [u8; 4] {
        match self {
            Magic::Req => REQ_MAGIC,
            Magic::Res => RES_MAGIC,
        }
    }

    /// Parse the 4-byte marker. Anything else means the stream is corrupt.
    pub fn from_bytes(bytes: [u8; 4]) -> Result<Self> {
        match bytes {
            REQ_MAGIC => Ok(Magic::Req),
            RES_MAGIC => Ok(Magic::Res),
            other => Err(GearwireError::BadMagic(other)),
        }
    }
}

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    CanDo = 1,
    CantDo = 2,
    ResetAbilities = 3,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    GetStatus = 15,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    StatusRes = 20,
    SubmitJobHigh = 21,
    SetClientId = 22,
    CanDoTimeout = 23,
    AllYours = 24,
    WorkException = 25,
    OptionReq = 26,
    OptionRes = 27,
    WorkData = 28,
    WorkWarning = 29,
    GrabJobUniq = 30,
    JobAssignUniq = 31,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
    SubmitJobSched = 35,
    SubmitJobEpoch = 36,
}

impl PacketType {
    /// Every defined operation code, in wire order.
    pub const ALL: [PacketType; 35] = [
        PacketType::CanDo,
        PacketType::CantDo,
        PacketType::ResetAbilities,
        PacketType::PreSleep,
        PacketType::Noop,
        PacketType::SubmitJob,
        PacketType::JobCreated,
        PacketType::GrabJob,
        PacketType::NoJob,
        PacketType::JobAssign,
        PacketType::WorkStatus,
        PacketType::WorkComplete,
        PacketType::WorkFail,
        PacketType::GetStatus,
        PacketType::EchoReq,
        PacketType::EchoRes,
        PacketType::SubmitJobBg,
        PacketType::Error,
        PacketType::StatusRes,
        PacketType::SubmitJobHigh,
        PacketType::SetClientId,
        PacketType::CanDoTimeout,
        PacketType::AllYours,
        PacketType::WorkException,
        PacketType::OptionReq,
        PacketType::OptionRes,
        PacketType::WorkData,
        PacketType::WorkWarning,
        PacketType::GrabJobUniq,
        PacketType::JobAssignUniq,
        PacketType::SubmitJobHighBg,
        PacketType::SubmitJobLow,
        PacketType::SubmitJobLowBg,
        PacketType::SubmitJobSched,
        PacketType::SubmitJobEpoch,
    ];

    /// Numeric operation code.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Look up an operation code. Unknown codes are unrecoverable.
    pub fn from_code(code: u32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .ok_or(GearwireError::UnknownPacketType(code))
    }

    /// Whether a request of this type is answered by the server.
    ///
    /// Requests that are not answered finish as soon as they are written.
    pub fn requires_response(self) -> bool {
        matches!(
            self,
            PacketType::PreSleep
                | PacketType::GrabJob
                | PacketType::GrabJobUniq
                | PacketType::GetStatus
                | PacketType::EchoReq
                | PacketType::OptionReq
        ) || self.is_job_submission()
    }

    /// Any of the six SUBMIT_JOB* priority/background variants.
    pub fn is_job_submission(self) -> bool {
        matches!(
            self,
            PacketType::SubmitJob
                | PacketType::SubmitJobBg
                | PacketType::SubmitJobHigh
                | PacketType::SubmitJobHighBg
                | PacketType::SubmitJobLow
                | PacketType::SubmitJobLowBg
        )
    }

    /// Whether a response of this type answers the head-of-queue request.
    pub fn is_correlated(self) -> bool {
        matches!(
            self,
            PacketType::JobCreated
                | PacketType::NoJob
                | PacketType::Noop
                | PacketType::JobAssign
                | PacketType::JobAssignUniq
                | PacketType::StatusRes
                | PacketType::EchoRes
                | PacketType::OptionRes
        )
    }

    /// Whether a response of this type acknowledges a request of type `request`.
    ///
    /// Returns `None` for responses that are never correlated with the
    /// head-of-queue task (work updates, errors, ...).
    pub fn acknowledges(self, request: PacketType) -> Option<bool> {
        let ok = match self {
            PacketType::JobCreated => request.is_job_submission(),
            PacketType::NoJob => {
                matches!(request, PacketType::GrabJob | PacketType::GrabJobUniq)
            }
            PacketType::Noop => request == PacketType::PreSleep,
            PacketType::JobAssign => request == PacketType::GrabJob,
            PacketType::JobAssignUniq => request == PacketType::GrabJobUniq,
            PacketType::StatusRes => request == PacketType::GetStatus,
            PacketType::EchoRes => request == PacketType::EchoReq,
            PacketType::OptionRes => request == PacketType::OptionReq,
            _ => return None,
        };
        Some(ok)
    }

    /// Name as used by the protocol documentation.
    pub fn name(self) -> &'static str {
        match self {
            PacketType::CanDo => "CAN_DO",
            PacketType::CantDo => "CANT_DO",
            PacketType::ResetAbilities => "RESET_ABILITIES",
            PacketType::PreSleep => "PRE_SLEEP",
            PacketType::Noop => "NOOP",
            PacketType::SubmitJob => "SUBMIT_JOB",
            PacketType::JobCreated => "JOB_CREATED",
            PacketType::GrabJob => "GRAB_JOB",
            PacketType::NoJob => "NO_JOB",
            PacketType::JobAssign => "JOB_ASSIGN",
            PacketType::WorkStatus => "WORK_STATUS",
            PacketType::WorkComplete => "WORK_COMPLETE",
            PacketType::WorkFail => "WORK_FAIL",
            PacketType::GetStatus => "GET_STATUS",
            PacketType::EchoReq => "ECHO_REQ",
            PacketType::EchoRes => "ECHO_RES",
            PacketType::SubmitJobBg => "SUBMIT_JOB_BG",
            PacketType::Error => "ERROR",
            PacketType::StatusRes => "STATUS_RES",
            PacketType::SubmitJobHigh => "SUBMIT_JOB_HIGH",
            PacketType::SetClientId => "SET_CLIENT_ID",
            PacketType::CanDoTimeout => "CAN_DO_TIMEOUT",
            PacketType::AllYours => "ALL_YOURS",
            PacketType::WorkException => "WORK_EXCEPTION",
            PacketType::OptionReq => "OPTION_REQ",
            PacketType::OptionRes => "OPTION_RES",
            PacketType::WorkData => "WORK_DATA",
            PacketType::WorkWarning => "WORK_WARNING",
            PacketType::GrabJobUniq => "GRAB_JOB_UNIQ",
            PacketType::JobAssignUniq => "JOB_ASSIGN_UNIQ",
            PacketType::SubmitJobHighBg => "SUBMIT_JOB_HIGH_BG",
            PacketType::SubmitJobLow => "SUBMIT_JOB_LOW",
            PacketType::SubmitJobLowBg => "SUBMIT_JOB_LOW_BG",
            PacketType::SubmitJobSched => "SUBMIT_JOB_SCHED",
            PacketType::SubmitJobEpoch => "SUBMIT_JOB_EPOCH",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Request or response marker.
    pub magic: Magic,
    /// Operation code.
    pub packet_type: PacketType,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(magic: Magic, packet_type: PacketType, payload_length: u32) -> Self {
        Self {
            magic,
            packet_type,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use gearwire::protocol::{Header, Magic, PacketType};
    ///
    /// let header = Header::new(Magic::Req, PacketType::SubmitJob, 100);
    /// let bytes = header.encode();
    /// assert_eq!(&bytes[..4], b"\0REQ");
    /// assert_eq!(bytes.len(), 12);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (12 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.magic.to_bytes());
        buf[4..8].copy_from_slice(&self.packet_type.code().to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `Ok(None)` if the buffer is too short, and an error if the
    /// magic or operation code is not recognised.
    ///
    /// # Example
    ///
    /// ```
    /// use gearwire::protocol::{Header, Magic, PacketType};
    ///
    /// let bytes = [0, b'R', b'E', b'S', 0, 0, 0, 8, 0, 0, 0, 2];
    /// let header = Header::decode(&bytes).unwrap().unwrap();
    /// assert_eq!(header.magic, Magic::Res);
    /// assert_eq!(header.packet_type, PacketType::JobCreated);
    /// assert_eq!(header.payload_length, 2);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let magic = Magic::from_bytes([buf[0], buf[1], buf[2], buf[3]])?;
        let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let packet_type = PacketType::from_code(code)?;
        Ok(Some(Self {
            magic,
            packet_type,
            payload_length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }))
    }

    /// Validate the payload length against a maximum.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(GearwireError::PayloadTooLarge {
                size: self.payload_length,
                max: max_payload_size,
            });
        }
        Ok(())
    }

    /// Check if this is a request.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.magic == Magic::Req
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.magic == Magic::Res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(Magic::Res, PacketType::WorkComplete, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap().unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(Magic::Req, PacketType::SubmitJobLowBg, 0x0102_0304);
        let bytes = header.encode();

        assert_eq!(&bytes[0..4], b"\0REQ");
        // Type 34 in BE
        assert_eq!(&bytes[4..8], &[0, 0, 0, 34]);
        // Payload length in BE
        assert_eq!(&bytes[8..12], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_header_size_is_exactly_12() {
        assert_eq!(HEADER_SIZE, 12);
        let header = Header::new(Magic::Req, PacketType::Noop, 0);
        assert_eq!(header.encode().len(), 12);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 11];
        assert!(Header::decode(&buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut bytes = Header::new(Magic::Req, PacketType::Noop, 0).encode();
        bytes[1] = b'X';
        let err = Header::decode(&bytes).unwrap_err();
        assert!(matches!(err, GearwireError::BadMagic(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut bytes = Header::new(Magic::Res, PacketType::Noop, 0).encode();
        bytes[4..8].copy_from_slice(&5u32.to_be_bytes());
        let err = Header::decode(&bytes).unwrap_err();
        assert!(matches!(err, GearwireError::UnknownPacketType(5)));

        bytes[4..8].copy_from_slice(&0u32.to_be_bytes());
        assert!(Header::decode(&bytes).is_err());

        bytes[4..8].copy_from_slice(&37u32.to_be_bytes());
        assert!(Header::decode(&bytes).is_err());
    }

    #[test]
    fn test_every_code_roundtrips() {
        for t in PacketType::ALL {
            assert_eq!(PacketType::from_code(t.code()).unwrap(), t);
        }
        assert_eq!(PacketType::SubmitJob.code(), 7);
        assert_eq!(PacketType::SubmitJobLowBg.code(), 34);
        assert_eq!(PacketType::WorkWarning.code(), 29);
    }

    #[test]
    fn test_requires_response() {
        assert!(PacketType::SubmitJob.requires_response());
        assert!(PacketType::SubmitJobHighBg.requires_response());
        assert!(PacketType::GrabJob.requires_response());
        assert!(PacketType::PreSleep.requires_response());
        assert!(PacketType::EchoReq.requires_response());
        assert!(PacketType::OptionReq.requires_response());
        assert!(!PacketType::CanDo.requires_response());
        assert!(!PacketType::SetClientId.requires_response());
        assert!(!PacketType::WorkComplete.requires_response());
        assert!(!PacketType::SubmitJobSched.requires_response());
    }

    #[test]
    fn test_acknowledges() {
        assert_eq!(
            PacketType::JobCreated.acknowledges(PacketType::SubmitJobLow),
            Some(true)
        );
        assert_eq!(
            PacketType::StatusRes.acknowledges(PacketType::EchoReq),
            Some(false)
        );
        assert_eq!(PacketType::Noop.acknowledges(PacketType::GrabJob), Some(false));
        assert_eq!(
            PacketType::JobAssignUniq.acknowledges(PacketType::GrabJobUniq),
            Some(true)
        );
        assert_eq!(PacketType::WorkData.acknowledges(PacketType::SubmitJob), None);
        assert_eq!(PacketType::Error.acknowledges(PacketType::SubmitJob), None);
    }

    #[test]
    fn test_correlated_matches_acknowledges() {
        for t in PacketType::ALL {
            assert_eq!(
                t.is_correlated(),
                t.acknowledges(PacketType::SubmitJob).is_some(),
                "{}",
                t
            );
        }
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(Magic::Res, PacketType::WorkData, 1_000_000);
        let result = header.validate(100);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_ok());
    }

    #[test]
    fn test_header_accessors() {
        let header = Header::new(Magic::Res, PacketType::NoJob, 0);
        assert!(header.is_response());
        assert!(!header.is_request());
        assert_eq!(header.packet_type.to_string(), "NO_JOB");
    }
}
