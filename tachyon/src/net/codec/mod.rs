//! Stateless per-call encoders/decoders parameterized by connection-local
//! framing state. Each channel owns exactly one codec; the reactor maps the
//! status codes below onto watcher changes.

pub mod raw;
pub mod relay;
pub mod resp;

pub use self::raw::RawCodec;
pub use self::relay::{RelayCategory, RelayCodec, RelayFrame};
pub use self::resp::{RespCodec, RespRequest, RespValue};

use crate::net::buffer::Buffer;
use photon::shared::ErrorType;
use photon::WorkerIndex;

/// Result of driving a codec over a channel buffer. The reactor keeps
/// watching on `Pause`/`PartOk`/`PartErr`, keeps write readiness on
/// `WantWrite`, drops it on `WantRead` and discards the channel on the
/// terminal codes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CodecStatus {
    Ok,
    Pause,
    PartOk,
    PartErr,
    WantWrite,
    WantRead,
    Eof,
    Fault(ErrorType),
}

impl CodecStatus {
    /// True for the codes that end the channel.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        match self {
            CodecStatus::Eof | CodecStatus::Fault(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CodecKind {
    Resp,
    Relay,
    Raw,
}

/// A decoded inbound message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Resp(RespValue),
    Relay(RelayFrame),
    Raw(Vec<u8>),
}

/// An outbound message handed to a channel for encoding.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Payload {
    /// A client request; the request's hidden integer slots never reach the
    /// wire and only feed the correlation tables.
    Resp(RespRequest),
    /// A server-side reply.
    RespValue(RespValue),
    Relay(RelayFrame),
    Raw(Vec<u8>),
}

/// One decode step: either a complete frame was consumed off the buffer, or
/// the status says why not.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Decoded {
    Frame(Frame),
    /// No buffered bytes to work on.
    Pause,
    /// A frame prefix is buffered; the cursor is retained until more bytes
    /// arrive.
    PartOk,
    Fault(ErrorType),
}

/// The per-channel codec instance. Tagged dispatch keeps the capability set
/// ({encode, decode, post-connect handshake, ping}) in one place without a
/// trait object in the channel.
pub enum Codec {
    Resp(RespCodec),
    Relay(RelayCodec),
    Raw(RawCodec),
}

impl Codec {
    pub fn new(kind: CodecKind) -> Codec {
        match kind {
            CodecKind::Resp => Codec::Resp(RespCodec::new()),
            CodecKind::Relay => Codec::Relay(RelayCodec::new()),
            CodecKind::Raw => Codec::Raw(RawCodec::new()),
        }
    }

    #[inline]
    pub fn kind(&self) -> CodecKind {
        match self {
            Codec::Resp(_) => CodecKind::Resp,
            Codec::Relay(_) => CodecKind::Relay,
            Codec::Raw(_) => CodecKind::Raw,
        }
    }

    /// Decodes at most one complete frame off the input buffer.
    pub fn decode(&mut self, input: &mut Buffer) -> Decoded {
        match self {
            Codec::Resp(codec) => codec.decode(input),
            Codec::Relay(codec) => codec.decode(input),
            Codec::Raw(codec) => codec.decode(input),
        }
    }

    /// Encodes a payload onto the output buffer. Returns `WantWrite` when
    /// bytes were appended (the caller owns flushing), or a fault when the
    /// payload does not belong to this codec.
    pub fn encode(&mut self, payload: &Payload, output: &mut Buffer) -> CodecStatus {
        match (self, payload) {
            (Codec::Resp(codec), Payload::Resp(request)) => codec.encode_request(request, output),
            (Codec::Resp(codec), Payload::RespValue(value)) => codec.encode_value(value, output),
            (Codec::Relay(codec), Payload::Relay(frame)) => codec.encode(frame, output),
            (Codec::Raw(codec), Payload::Raw(bytes)) => codec.encode(bytes, output),
            _ => CodecStatus::Fault(ErrorType::ProtocolFault),
        }
    }

    /// The frame a client channel emits right after TCP connect completes.
    /// Only the relay codec has one: it tells the peer which worker is
    /// connecting.
    pub fn post_connect_handshake(&self, local_worker: WorkerIndex) -> Option<Payload> {
        match self {
            Codec::Relay(_) => Some(Payload::Relay(RelayFrame::handshake(local_worker))),
            _ => None,
        }
    }

    /// Whether a keep-alive probe exists for this protocol. Channels without
    /// one are discarded on keep-alive expiry instead of pinged.
    pub fn supports_ping(&self) -> bool {
        match self {
            Codec::Resp(_) | Codec::Relay(_) => true,
            Codec::Raw(_) => false,
        }
    }
}
