//! Wire format: checksummed envelopes carrying key-value requests and responses.
//!
//! Every datagram is one protobuf-encoded [`Envelope`]. Its `payload` is an
//! encoded [`Request`] (client to server) or [`Response`] (server to client).
//! The envelope checksum is the IEEE CRC-32 of `message_id || payload`.
//!
//! Response fields are all optional on the wire: a field that was never set is
//! absent from the encoding, which is distinct from a field set to zero.

use prost::Message;
use thiserror::Error;

/// Largest datagram the server will read.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;
/// Longest valid key in bytes. Empty keys are invalid too.
pub const MAX_KEY_LEN: usize = 32;
/// Longest valid value in bytes. Empty values are invalid too.
pub const MAX_VALUE_LEN: usize = 10_000;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] prost::DecodeError),
    #[error("malformed request payload: {0}")]
    Request(#[source] prost::DecodeError),
    #[error("malformed response payload: {0}")]
    Response(#[source] prost::DecodeError),
}

/// Outermost message of every datagram.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(bytes = "vec", tag = "1")]
    pub message_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(fixed64, tag = "3")]
    pub checksum: u64,
}

impl Envelope {
    /// Builds an envelope with its checksum filled in.
    pub fn seal(message_id: Vec<u8>, payload: Vec<u8>) -> Self {
        let checksum = u64::from(checksum(&message_id, &payload));
        Self {
            message_id,
            payload,
            checksum,
        }
    }

    pub fn expected_checksum(&self) -> u32 {
        checksum(&self.message_id, &self.payload)
    }

    pub fn has_valid_checksum(&self) -> bool {
        self.checksum == u64::from(self.expected_checksum())
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Request {
    #[prost(uint32, tag = "1")]
    pub command: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
    #[prost(int32, tag = "4")]
    pub version: i32,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            command: command.code(),
            ..Self::default()
        }
    }

    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, version: i32) -> Self {
        Self {
            command: Command::Put.code(),
            key: key.into(),
            value: value.into(),
            version,
        }
    }

    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Self::new(Command::Get)
        }
    }

    pub fn remove(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Self::new(Command::Remove)
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Response {
    #[prost(uint32, optional, tag = "1")]
    pub error_code: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub value: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "3")]
    pub pid: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub version: Option<i32>,
    #[prost(int32, optional, tag = "5")]
    pub overload_wait_time_ms: Option<i32>,
    #[prost(int32, optional, tag = "6")]
    pub membership_count: Option<i32>,
}

impl Response {
    /// A response carrying only an error code.
    pub fn with_code(code: ErrorCode) -> Self {
        Self {
            error_code: Some(code.code()),
            ..Self::default()
        }
    }

    pub fn ok() -> Self {
        Self::with_code(ErrorCode::None)
    }

    /// Decoded error code, if present and known.
    pub fn code(&self) -> Option<ErrorCode> {
        self.error_code.and_then(ErrorCode::from_code)
    }
}

/// Request command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Put = 0x01,
    Get = 0x02,
    Remove = 0x03,
    Shutdown = 0x04,
    WipeOut = 0x05,
    IsAlive = 0x06,
    GetPid = 0x07,
    GetMembershipCount = 0x08,
}

impl Command {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let command = match code {
            0x01 => Self::Put,
            0x02 => Self::Get,
            0x03 => Self::Remove,
            0x04 => Self::Shutdown,
            0x05 => Self::WipeOut,
            0x06 => Self::IsAlive,
            0x07 => Self::GetPid,
            0x08 => Self::GetMembershipCount,
            _ => return None,
        };
        Some(command)
    }
}

/// Response error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0x00,
    NonExistentKey = 0x01,
    OutOfSpace = 0x02,
    TemporarySystemOverload = 0x03,
    InternalFailure = 0x04,
    UnrecognizedCommand = 0x05,
    InvalidKey = 0x06,
    InvalidValue = 0x07,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let err = match code {
            0x00 => Self::None,
            0x01 => Self::NonExistentKey,
            0x02 => Self::OutOfSpace,
            0x03 => Self::TemporarySystemOverload,
            0x04 => Self::InternalFailure,
            0x05 => Self::UnrecognizedCommand,
            0x06 => Self::InvalidKey,
            0x07 => Self::InvalidValue,
            _ => return None,
        };
        Some(err)
    }
}

/// IEEE CRC-32 over `message_id` followed by `payload`.
pub fn checksum(message_id: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(message_id);
    hasher.update(payload);
    hasher.finalize()
}

pub fn encode_envelope(message_id: &[u8], payload: &[u8]) -> Vec<u8> {
    Envelope::seal(message_id.to_vec(), payload.to_vec()).encode_to_vec()
}

/// Decodes an envelope without checking its checksum.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    Envelope::decode(bytes).map_err(DecodeError::Envelope)
}

pub fn encode_request(request: &Request) -> Vec<u8> {
    request.encode_to_vec()
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, DecodeError> {
    Request::decode(bytes).map_err(DecodeError::Request)
}

pub fn encode_response(response: &Response) -> Vec<u8> {
    response.encode_to_vec()
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, DecodeError> {
    Response::decode(bytes).map_err(DecodeError::Response)
}
