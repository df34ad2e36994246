//! farsock-wire — envelope model and codecs for the farsock proxy protocol.
//!
//! Everything a control channel or bulk-data stream puts on the wire lives
//! here. No async code, no I/O — the engine crate owns those.
//!
//! # Architecture
//!
//! - **reference**: opaque 128-bit correlation ids (socket/link/stream identity)
//! - **message**: the fixed 9-field envelope and its tagged content variants
//! - **codec**: binary and JSON serialization of the envelope
//! - **error**: decode/encode failures

pub mod codec;
pub mod error;
pub mod message;
pub mod reference;

pub use codec::{codec_for, BinaryCodec, JsonCodec, MessageCodec, MAX_FRAME_SIZE};
pub use error::WireError;
pub use message::{
    CodecId, Content, FaultCode, Message, MessageType, NameRecord, Property, RecordKind,
    SocketInfo, PROTOCOL_VERSION,
};
pub use reference::Reference;
