//! The Redis-cluster router: slot mapping, redirection handling, multi-key
//! splitting and reassembly, replica rotation and topology refresh on top of
//! the reactor's named channel pool.

pub mod command;
pub mod router;
pub mod slot;
pub mod topology;

pub use self::router::{ClusterConfig, RedisCluster};

use crate::net::channel::{ChannelId, ChannelOption};
use crate::net::codec::{CodecKind, Payload, RespRequest, RespValue};
use crate::net::reactor::{Reactor, SendReceipt};
use crate::node::AuthRecord;
use photon::shared::{Identify, NetworkResult};
use photon::StepSeq;

/// Error kinds surfaced to the actor builder. Redirections and `NOAUTH` are
/// recovered internally and never appear here.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StepErrorKind {
    InvalidCommand,
    NoRoute,
    AuthFailed,
    CrossSlot,
    ServerError,
    DeathConnection,
    Timeout,
    Transport,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new<S: Into<String>>(kind: StepErrorKind, message: S) -> StepError {
        StepError {
            kind,
            message: message.into(),
        }
    }
}

/// The actor-builder seam: the router returns results by user step sequence
/// and never holds the steps themselves.
pub trait StepHandler {
    fn on_response(&mut self, step_seq: StepSeq, reply: RespValue);
    fn on_error(&mut self, step_seq: StepSeq, error: StepError);
}

/// What the router needs from the I/O layer. The reactor implements this;
/// tests drive the router against a recording stand-in.
pub trait Dispatch {
    fn send_resp(&mut self, identify: &Identify, request: &RespRequest) -> NetworkResult<SendReceipt>;
    fn discard(&mut self, channel: ChannelId, notify: bool);
    fn has_channel_option(&self, identify: &str) -> bool;
    fn set_channel_option(&mut self, identify: &str, option: ChannelOption);
    fn auth_record(&self, identify: &str) -> Option<AuthRecord>;
}

impl Dispatch for Reactor {
    fn send_resp(&mut self, identify: &Identify, request: &RespRequest) -> NetworkResult<SendReceipt> {
        let step_seq = request.step_seq;
        self.send_to(identify, CodecKind::Resp, &Payload::Resp(request.clone()), step_seq)
    }

    fn discard(&mut self, channel: ChannelId, notify: bool) {
        Reactor::discard(self, channel, notify);
    }

    fn has_channel_option(&self, identify: &str) -> bool {
        self.registry_ref().channel_option(identify).is_some()
    }

    fn set_channel_option(&mut self, identify: &str, option: ChannelOption) {
        self.registry().set_channel_option(identify, option);
    }

    fn auth_record(&self, identify: &str) -> Option<AuthRecord> {
        self.registry_ref().auth(identify).cloned()
    }
}
