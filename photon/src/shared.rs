use crate::WorkerIndex;
use std::fmt;
use std::io;
use std::net;

/// Endpoint identifiers may address a specific worker on the remote node;
/// anything above this is a parse error.
pub const MAX_WORKER_INDEX: WorkerIndex = 200;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NetworkError {
    /// The operation cannot make progress right now and should be retried
    /// when the descriptor is ready again.
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ErrorType {
    AddrParse,
    BadIdentify,
    WorkerIndexRange,
    CodecRebind,
    ProtocolFault,
    PayloadTooLarge,
    ChannelClosed,
    Eof,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// A parsed endpoint identifier: `host:port` with an optional `.worker_index`
/// suffix addressing one worker on the remote node.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Identify {
    pub host: String,
    pub port: u16,
    pub worker: Option<WorkerIndex>,
}

impl Identify {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Identify {
        Identify {
            host: host.into(),
            port,
            worker: None,
        }
    }

    /// Parses `HOST ":" PORT ( "." WORKER_INDEX )?`. The port separator is
    /// the last `:` so IPv6-ish hosts with embedded colons keep working, and
    /// the worker separator is only honored after the port so dotted IPv4
    /// hosts are not mistaken for worker suffixes.
    pub fn parse(identify: &str) -> NetworkResult<Identify> {
        let colon = match identify.rfind(':') {
            Some(pos) => pos,
            None => return Err(NetworkError::Fatal(ErrorType::BadIdentify)),
        };
        let host = &identify[..colon];
        if host.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::BadIdentify));
        }

        let tail = &identify[colon + 1..];
        let (port_str, worker_str) = match tail.find('.') {
            Some(dot) => (&tail[..dot], Some(&tail[dot + 1..])),
            None => (tail, None),
        };

        let port = match port_str.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => return Err(NetworkError::Fatal(ErrorType::BadIdentify)),
        };

        let worker = match worker_str {
            Some("") => None,
            Some(index_str) => match index_str.parse::<WorkerIndex>() {
                Ok(index) if index <= MAX_WORKER_INDEX => Some(index),
                Ok(_) => return Err(NetworkError::Fatal(ErrorType::WorkerIndexRange)),
                Err(_) => return Err(NetworkError::Fatal(ErrorType::BadIdentify)),
            },
            None => None,
        };

        Ok(Identify {
            host: host.to_string(),
            port,
            worker,
        })
    }

    /// The `host:port` part without any worker suffix, which is how channel
    /// pool entries and cluster nodes are keyed.
    pub fn node_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Identify {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.worker {
            Some(index) => write!(f, "{}:{}.{}", self.host, self.port, index),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}
