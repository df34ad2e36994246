//! Control-plane envelope and content model.
//!
//! Every message, on either the control channel or a bulk-data stream, is
//! one [`Message`]: a fixed 9-field envelope plus a content body. The pair
//! `(type_id, is_response)` selects exactly one content shape from a closed
//! set; a response carrying a non-[`FaultCode::Success`] error may carry
//! [`Content::None`] instead.
//!
//! The upper 16 bits of `version` are the protocol major.minor of the
//! sending build. Both codecs reject a mismatch outright.

use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::reference::Reference;

/// Protocol version of this build.
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// Packed wire version: major.minor in the upper 16 bits, lower 16 reserved.
pub const PROTOCOL_VERSION: u32 =
    ((VERSION_MAJOR as u32) << 24) | ((VERSION_MINOR as u32) << 16);

/// Whether a received version is compatible with this build (major.minor match).
pub fn version_compatible(version: u32) -> bool {
    version >> 16 == PROTOCOL_VERSION >> 16
}

/// Message type ids — the `type_id` envelope field.
///
/// Each id pairs with `is_response` to select a content shape. `Data` is
/// request-only and has no response pairing.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum MessageType {
    Link = 1,
    Open = 2,
    SetOption = 3,
    GetOption = 4,
    Poll = 5,
    Close = 6,
    Ping = 7,
    Data = 8,
}

impl From<MessageType> for u32 {
    fn from(t: MessageType) -> u32 {
        t as u32
    }
}

impl TryFrom<u32> for MessageType {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Link),
            2 => Ok(Self::Open),
            3 => Ok(Self::SetOption),
            4 => Ok(Self::GetOption),
            5 => Ok(Self::Poll),
            6 => Ok(Self::Close),
            7 => Ok(Self::Ping),
            8 => Ok(Self::Data),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// Protocol-level fault codes — the `error` envelope field.
///
/// Values mirror errno where one exists; codes we don't know are preserved
/// as [`FaultCode::Other`] rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
pub enum FaultCode {
    Success,
    /// Remote side already closed (ECONNRESET).
    Closed,
    /// Operation exceeded its deadline (ETIMEDOUT).
    Timeout,
    /// Target host unreachable (EHOSTUNREACH).
    NoHost,
    /// Unrecoverable protocol fault.
    Fatal,
    Other(i32),
}

impl FaultCode {
    pub fn is_success(self) -> bool {
        self == FaultCode::Success
    }
}

impl From<FaultCode> for i32 {
    fn from(code: FaultCode) -> i32 {
        match code {
            FaultCode::Success => 0,
            FaultCode::Closed => 104,
            FaultCode::Timeout => 110,
            FaultCode::NoHost => 113,
            FaultCode::Fatal => -1,
            FaultCode::Other(v) => v,
        }
    }
}

impl From<i32> for FaultCode {
    fn from(value: i32) -> FaultCode {
        match value {
            0 => FaultCode::Success,
            104 => FaultCode::Closed,
            110 => FaultCode::Timeout,
            113 => FaultCode::NoHost,
            -1 => FaultCode::Fatal,
            other => FaultCode::Other(other),
        }
    }
}

/// Wire codec selector carried in `OpenRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum CodecId {
    Binary = 1,
    Json = 2,
}

impl From<CodecId> for u32 {
    fn from(id: CodecId) -> u32 {
        id as u32
    }
}

impl TryFrom<u32> for CodecId {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Binary),
            2 => Ok(Self::Json),
            other => Err(WireError::UnknownCodec(other)),
        }
    }
}

/// A single socket option as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub option: u32,
    pub value: u64,
}

/// Description of the virtual socket a proxy should materialize.
///
/// `family`, `kind`, `protocol`, and `flags` carry the OS-level values
/// verbatim — the proxy passes them straight to its own socket call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SocketInfo {
    pub family: u32,
    pub kind: u32,
    pub protocol: u32,
    pub flags: u32,
    pub address: String,
    pub options: Vec<Property>,
}

/// Directory record kind bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKind(pub u32);

impl RecordKind {
    pub const PROXY: RecordKind = RecordKind(1);
    pub const HOST: RecordKind = RecordKind(2);
    pub const LINK: RecordKind = RecordKind(4);

    pub fn contains(self, other: RecordKind) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RecordKind {
    type Output = RecordKind;

    fn bitor(self, rhs: RecordKind) -> RecordKind {
        RecordKind(self.0 | rhs.0)
    }
}

/// Directory entry for a reachable proxy or a known host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
    /// Directory-assigned id, opaque to the engine.
    pub id: String,
    /// Control-channel address of the record's owner.
    pub address: Reference,
    pub name: String,
    pub kind: RecordKind,
    /// Cross-references to other records (e.g. a host's known-good proxies).
    pub references: BTreeSet<Reference>,
}

impl NameRecord {
    pub fn new(name: impl Into<String>, kind: RecordKind) -> Self {
        NameRecord {
            id: String::new(),
            address: Reference::generate(),
            name: name.into(),
            kind,
            references: BTreeSet::new(),
        }
    }
}

/// Content body — one shape per `(type_id, is_response)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    LinkRequest {
        info: SocketInfo,
    },
    LinkResponse {
        remote_id: Reference,
        local_address: String,
        peer_address: String,
    },
    OpenRequest {
        stream_id: Reference,
        codec: CodecId,
        connection_string: String,
        polled: bool,
        max_fragment: u32,
    },
    OpenResponse,
    SetOptionRequest {
        option: u32,
        value: u64,
    },
    SetOptionResponse,
    GetOptionRequest {
        option: u32,
    },
    GetOptionResponse {
        value: u64,
    },
    PollRequest {
        budget: u32,
    },
    PollResponse {
        remaining: u32,
    },
    CloseRequest,
    CloseResponse,
    PingRequest {
        address: String,
    },
    PingResponse,
    Data {
        payload: Bytes,
    },
    /// Empty body — only valid on responses carrying a non-success error.
    None,
}

impl Content {
    /// The `(type_id, is_response)` pair this content belongs to.
    ///
    /// [`Content::None`] belongs to no pair; the envelope keeps the
    /// request's type in that case.
    pub fn classify(&self) -> Option<(MessageType, bool)> {
        match self {
            Content::LinkRequest { .. } => Some((MessageType::Link, false)),
            Content::LinkResponse { .. } => Some((MessageType::Link, true)),
            Content::OpenRequest { .. } => Some((MessageType::Open, false)),
            Content::OpenResponse => Some((MessageType::Open, true)),
            Content::SetOptionRequest { .. } => Some((MessageType::SetOption, false)),
            Content::SetOptionResponse => Some((MessageType::SetOption, true)),
            Content::GetOptionRequest { .. } => Some((MessageType::GetOption, false)),
            Content::GetOptionResponse { .. } => Some((MessageType::GetOption, true)),
            Content::PollRequest { .. } => Some((MessageType::Poll, false)),
            Content::PollResponse { .. } => Some((MessageType::Poll, true)),
            Content::CloseRequest => Some((MessageType::Close, false)),
            Content::CloseResponse => Some((MessageType::Close, true)),
            Content::PingRequest { .. } => Some((MessageType::Ping, false)),
            Content::PingResponse => Some((MessageType::Ping, true)),
            Content::Data { .. } => Some((MessageType::Data, false)),
            Content::None => None,
        }
    }
}

/// The fixed 9-field wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub version: u32,
    pub source: Reference,
    pub proxy: Reference,
    pub target: Reference,
    pub sequence_id: u32,
    pub error: FaultCode,
    pub is_response: bool,
    pub type_id: MessageType,
    pub content: Content,
}

impl Message {
    /// Build a request envelope around `content`.
    ///
    /// The type id is derived from the content shape, so only request-shaped
    /// content is meaningful here.
    pub fn request(source: Reference, target: Reference, content: Content) -> Self {
        let (type_id, _) = content
            .classify()
            .unwrap_or((MessageType::Close, false));
        Message {
            version: PROTOCOL_VERSION,
            source,
            proxy: Reference::NULL,
            target,
            sequence_id: 0,
            error: FaultCode::Success,
            is_response: false,
            type_id,
            content,
        }
    }

    /// Build the success response to `request`, echoing its correlation
    /// fields with source and target swapped.
    pub fn response_to(request: &Message, content: Content) -> Self {
        Message {
            version: PROTOCOL_VERSION,
            source: request.target,
            proxy: request.proxy,
            target: request.source,
            sequence_id: request.sequence_id,
            error: FaultCode::Success,
            is_response: true,
            type_id: request.type_id,
            content,
        }
    }

    /// Build an error response to `request` with empty content.
    pub fn error_response_to(request: &Message, error: FaultCode) -> Self {
        Message {
            error,
            content: Content::None,
            ..Message::response_to(request, Content::None)
        }
    }

    /// Build a `Data` message carrying `payload`.
    pub fn data(source: Reference, target: Reference, payload: Bytes) -> Self {
        Message::request(source, target, Content::Data { payload })
    }

    pub fn is_success(&self) -> bool {
        self.error.is_success()
    }

    /// Check the envelope invariants: compatible version and content shape
    /// matching `(type_id, is_response)`.
    ///
    /// `Content::None` is accepted only on responses that carry an error.
    pub fn validate(&self) -> Result<(), WireError> {
        if !version_compatible(self.version) {
            return Err(WireError::VersionMismatch {
                got: self.version,
                expected: PROTOCOL_VERSION,
            });
        }
        match self.content.classify() {
            Some((type_id, is_response))
                if type_id == self.type_id && is_response == self.is_response =>
            {
                Ok(())
            }
            None if self.is_response && !self.error.is_success() => Ok(()),
            _ => Err(WireError::ContentMismatch {
                type_id: self.type_id as u32,
                is_response: self.is_response,
            }),
        }
    }
}
