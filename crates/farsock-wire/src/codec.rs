//! Wire codecs — binary and JSON renderings of the envelope.
//!
//! Binary frame layout (all integers big-endian):
//!
//! ```text
//! [version: u32]
//! [source: 16 bytes] [proxy: 16 bytes] [target: 16 bytes]
//! [sequence_id: u32] [error: i32] [is_response: u8] [type_id: u32]
//! [content body, shape selected by (type_id, is_response)]
//! ```
//!
//! Strings are u16-length-prefixed UTF-8; data payloads are u32-length-
//! prefixed raw bytes. A response with a non-success error and an empty
//! body decodes as [`Content::None`]. Trailing bytes after a complete
//! content body are ignored.

use bytes::Bytes;

use crate::error::WireError;
use crate::message::{
    version_compatible, CodecId, Content, FaultCode, Message, MessageType, Property,
    SocketInfo, PROTOCOL_VERSION,
};
use crate::reference::Reference;

/// Maximum encoded frame size (1 MiB), matching the bulk-data transports.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Envelope bytes preceding the content body.
const HEADER_LEN: usize = 4 + 16 * 3 + 4 + 4 + 1 + 4;

/// A schema-driven message serializer.
pub trait MessageCodec: Send + Sync {
    fn id(&self) -> CodecId;
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, WireError>;
    fn decode(&self, bytes: &[u8]) -> Result<Message, WireError>;
}

/// Look up the codec for a wire id.
pub fn codec_for(id: CodecId) -> &'static dyn MessageCodec {
    match id {
        CodecId::Binary => &BinaryCodec,
        CodecId::Json => &JsonCodec,
    }
}

// ── Binary codec ─────────────────────────────────────────────────────

pub struct BinaryCodec;

impl MessageCodec for BinaryCodec {
    fn id(&self) -> CodecId {
        CodecId::Binary
    }

    fn encode(&self, msg: &Message) -> Result<Vec<u8>, WireError> {
        msg.validate()?;

        let mut buf = Vec::with_capacity(HEADER_LEN + 64);
        buf.extend_from_slice(&msg.version.to_be_bytes());
        buf.extend_from_slice(&msg.source.to_bytes());
        buf.extend_from_slice(&msg.proxy.to_bytes());
        buf.extend_from_slice(&msg.target.to_bytes());
        buf.extend_from_slice(&msg.sequence_id.to_be_bytes());
        buf.extend_from_slice(&i32::from(msg.error).to_be_bytes());
        buf.push(msg.is_response as u8);
        buf.extend_from_slice(&u32::from(msg.type_id).to_be_bytes());

        encode_content(&mut buf, &msg.content)?;

        if buf.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(buf.len()));
        }
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, WireError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(bytes.len()));
        }
        let mut r = Reader::new(bytes);

        let version = r.u32()?;
        if !version_compatible(version) {
            return Err(WireError::VersionMismatch {
                got: version,
                expected: PROTOCOL_VERSION,
            });
        }

        let source = r.reference()?;
        let proxy = r.reference()?;
        let target = r.reference()?;
        let sequence_id = r.u32()?;
        let error = FaultCode::from(r.i32()?);
        let is_response = r.u8()? != 0;
        let type_id = MessageType::try_from(r.u32()?)?;

        let content = decode_content(&mut r, type_id, is_response, error)?;

        Ok(Message {
            version,
            source,
            proxy,
            target,
            sequence_id,
            error,
            is_response,
            type_id,
            content,
        })
    }
}

fn encode_content(buf: &mut Vec<u8>, content: &Content) -> Result<(), WireError> {
    match content {
        Content::LinkRequest { info } => encode_socket_info(buf, info)?,
        Content::LinkResponse {
            remote_id,
            local_address,
            peer_address,
        } => {
            buf.extend_from_slice(&remote_id.to_bytes());
            put_str(buf, local_address)?;
            put_str(buf, peer_address)?;
        }
        Content::OpenRequest {
            stream_id,
            codec,
            connection_string,
            polled,
            max_fragment,
        } => {
            buf.extend_from_slice(&stream_id.to_bytes());
            buf.extend_from_slice(&u32::from(*codec).to_be_bytes());
            put_str(buf, connection_string)?;
            buf.push(*polled as u8);
            buf.extend_from_slice(&max_fragment.to_be_bytes());
        }
        Content::SetOptionRequest { option, value } => {
            buf.extend_from_slice(&option.to_be_bytes());
            buf.extend_from_slice(&value.to_be_bytes());
        }
        Content::GetOptionRequest { option } => {
            buf.extend_from_slice(&option.to_be_bytes());
        }
        Content::GetOptionResponse { value } => {
            buf.extend_from_slice(&value.to_be_bytes());
        }
        Content::PollRequest { budget } => {
            buf.extend_from_slice(&budget.to_be_bytes());
        }
        Content::PollResponse { remaining } => {
            buf.extend_from_slice(&remaining.to_be_bytes());
        }
        Content::PingRequest { address } => put_str(buf, address)?,
        Content::Data { payload } => {
            buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            buf.extend_from_slice(payload);
        }
        Content::OpenResponse
        | Content::SetOptionResponse
        | Content::CloseRequest
        | Content::CloseResponse
        | Content::PingResponse
        | Content::None => {}
    }
    Ok(())
}

fn decode_content(
    r: &mut Reader<'_>,
    type_id: MessageType,
    is_response: bool,
    error: FaultCode,
) -> Result<Content, WireError> {
    // Failed responses may omit the body entirely.
    if is_response && !error.is_success() && r.is_empty() {
        return Ok(Content::None);
    }

    let content = match (type_id, is_response) {
        (MessageType::Link, false) => Content::LinkRequest {
            info: decode_socket_info(r)?,
        },
        (MessageType::Link, true) => Content::LinkResponse {
            remote_id: r.reference()?,
            local_address: r.string()?,
            peer_address: r.string()?,
        },
        (MessageType::Open, false) => Content::OpenRequest {
            stream_id: r.reference()?,
            codec: CodecId::try_from(r.u32()?)?,
            connection_string: r.string()?,
            polled: r.u8()? != 0,
            max_fragment: r.u32()?,
        },
        (MessageType::Open, true) => Content::OpenResponse,
        (MessageType::SetOption, false) => Content::SetOptionRequest {
            option: r.u32()?,
            value: r.u64()?,
        },
        (MessageType::SetOption, true) => Content::SetOptionResponse,
        (MessageType::GetOption, false) => Content::GetOptionRequest { option: r.u32()? },
        (MessageType::GetOption, true) => Content::GetOptionResponse { value: r.u64()? },
        (MessageType::Poll, false) => Content::PollRequest { budget: r.u32()? },
        (MessageType::Poll, true) => Content::PollResponse { remaining: r.u32()? },
        (MessageType::Close, false) => Content::CloseRequest,
        (MessageType::Close, true) => Content::CloseResponse,
        (MessageType::Ping, false) => Content::PingRequest { address: r.string()? },
        (MessageType::Ping, true) => Content::PingResponse,
        (MessageType::Data, false) => Content::Data { payload: r.bytes()? },
        (MessageType::Data, true) => {
            // Data has no response pairing.
            return Err(WireError::ContentMismatch {
                type_id: type_id as u32,
                is_response,
            });
        }
    };
    Ok(content)
}

fn encode_socket_info(buf: &mut Vec<u8>, info: &SocketInfo) -> Result<(), WireError> {
    buf.extend_from_slice(&info.family.to_be_bytes());
    buf.extend_from_slice(&info.kind.to_be_bytes());
    buf.extend_from_slice(&info.protocol.to_be_bytes());
    buf.extend_from_slice(&info.flags.to_be_bytes());
    put_str(buf, &info.address)?;
    if info.options.len() > u16::MAX as usize {
        return Err(WireError::FrameTooLarge(info.options.len()));
    }
    buf.extend_from_slice(&(info.options.len() as u16).to_be_bytes());
    for prop in &info.options {
        buf.extend_from_slice(&prop.option.to_be_bytes());
        buf.extend_from_slice(&prop.value.to_be_bytes());
    }
    Ok(())
}

fn decode_socket_info(r: &mut Reader<'_>) -> Result<SocketInfo, WireError> {
    let family = r.u32()?;
    let kind = r.u32()?;
    let protocol = r.u32()?;
    let flags = r.u32()?;
    let address = r.string()?;
    let count = r.u16()? as usize;
    let mut options = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        options.push(Property {
            option: r.u32()?,
            value: r.u64()?,
        });
    }
    Ok(SocketInfo {
        family,
        kind,
        protocol,
        flags,
        address,
        options,
    })
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<(), WireError> {
    if s.len() > u16::MAX as usize {
        return Err(WireError::StringTooLong(s.len()));
    }
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Cursor over a decode buffer. All reads fail with `Truncated` past the end.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated)?;
        if end > self.buf.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn reference(&mut self) -> Result<Reference, WireError> {
        let b = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(Reference::from_bytes(raw))
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u16()? as usize;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| WireError::InvalidString)
    }

    fn bytes(&mut self) -> Result<Bytes, WireError> {
        let len = self.u32()? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(len));
        }
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }
}

// ── JSON codec ───────────────────────────────────────────────────────

pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn id(&self) -> CodecId {
        CodecId::Json
    }

    fn encode(&self, msg: &Message) -> Result<Vec<u8>, WireError> {
        msg.validate()?;
        let buf = serde_json::to_vec(msg)?;
        if buf.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(buf.len()));
        }
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, WireError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(bytes.len()));
        }
        let msg: Message = serde_json::from_slice(bytes)?;
        msg.validate()?;
        Ok(msg)
    }
}
