use crate::net::buffer::Buffer;
use crate::net::codec::{Codec, CodecKind, CodecStatus, Decoded, Frame, Payload};
use photon::logging;
use photon::shared::{ErrorType, Identify, NetworkError, NetworkResult};
use photon::{ChannelSeq, StepSeq};
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io;

pub type ChannelId = usize;

/// Per-endpoint connection options consulted whenever the pool opens a new
/// channel for that identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOption {
    pub with_ssl: bool,
    pub pipeline: bool,
    /// Keep-alive seconds; zero disables the timer.
    pub keep_alive: f64,
}

impl Default for ChannelOption {
    fn default() -> ChannelOption {
        ChannelOption {
            with_ssl: false,
            pipeline: false,
            keep_alive: 0.0,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelStatus {
    /// Client connect in flight; established on the first write readiness.
    TryConnect,
    Established,
    Closed,
}

/// A live bidirectional connection: socket, codec, buffered I/O, outstanding
/// request bookkeeping and keep-alive stamps. The reactor is the only
/// mutator of status and buffers.
pub struct Channel {
    id: Option<ChannelId>,
    sequence: ChannelSeq,

    stream: Option<TcpStream>,
    status: ChannelStatus,
    codec: Codec,

    is_client: bool,
    with_ssl: bool,
    pipeline: bool,
    identify: Option<Identify>,

    // Keep-alive bookkeeping, unix seconds. `next_keepalive` is the timer
    // fire point; it re-arms against `last_recv_time` so an idle but healthy
    // connection is not killed.
    keep_alive: f64,
    next_keepalive: f64,
    last_recv_time: f64,
    last_active_time: f64,
    penultimate_active_time: f64,

    frames_sent: u64,
    frames_recv: u64,

    // Steps awaiting a reply on this channel, oldest first. In pipeline mode
    // the queue can hold many; otherwise at most one.
    outstanding: VecDeque<StepSeq>,

    read_buffer: Buffer,
    write_buffer: Buffer,

    error: Option<(ErrorType, String)>,

    log: logging::Logger,
}

impl Channel {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        sequence: ChannelSeq,
        codec_kind: CodecKind,
        is_client: bool,
        log: L,
    ) -> Channel {
        Channel {
            id: None,
            sequence,
            stream: None,
            status: ChannelStatus::Closed,
            codec: Codec::new(codec_kind),
            is_client,
            with_ssl: false,
            pipeline: false,
            identify: None,
            keep_alive: 0.0,
            next_keepalive: 0.0,
            last_recv_time: 0.0,
            last_active_time: 0.0,
            penultimate_active_time: 0.0,
            frames_sent: 0,
            frames_recv: 0,
            outstanding: VecDeque::new(),
            read_buffer: Buffer::new(),
            write_buffer: Buffer::new(),
            error: None,
            log: logging::component(log),
        }
    }

    /// Takes ownership of a fresh stream. Client channels start in
    /// `TryConnect` and flip on write readiness; accepted channels are
    /// established immediately.
    pub fn open(&mut self, id: ChannelId, stream: TcpStream, now: f64) {
        if self.status != ChannelStatus::Closed {
            panic!("Attempted to open an already open channel");
        }

        self.id = Some(id);
        self.stream = Some(stream);
        self.status = match self.is_client {
            true => ChannelStatus::TryConnect,
            false => ChannelStatus::Established,
        };
        self.last_active_time = now;
        self.penultimate_active_time = now;

        logging::debug!(self.log, "channel opened";
                        "channel_id" => id,
                        "channel_seq" => self.sequence,
                        "is_client" => self.is_client);
    }

    /// Closes the stream and clears all connection state. Returns the steps
    /// that were still awaiting replies so the caller can error them out.
    pub fn close(&mut self) -> Vec<StepSeq> {
        logging::debug!(self.log, "closing channel";
                        "channel_id" => self.id,
                        "channel_seq" => self.sequence,
                        "identify" => self.identify.as_ref().map(|i| i.to_string()),
                        "outstanding" => self.outstanding.len(),
                        "read_size" => self.read_buffer.len(),
                        "write_size" => self.write_buffer.len());

        self.read_buffer.clear();
        self.write_buffer.clear();
        self.id = None;
        self.status = ChannelStatus::Closed;
        self.identify = None;
        self.frames_sent = 0;
        self.frames_recv = 0;
        self.last_recv_time = 0.0;
        self.next_keepalive = 0.0;

        // Dropping the mio stream closes the descriptor.
        self.stream.take();

        self.outstanding.drain(..).collect()
    }

    #[inline]
    pub fn id(&self) -> Option<ChannelId> {
        self.id
    }

    #[inline]
    pub fn sequence(&self) -> ChannelSeq {
        self.sequence
    }

    #[inline]
    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.is_client
    }

    #[inline]
    pub fn codec_kind(&self) -> CodecKind {
        self.codec.kind()
    }

    #[inline]
    pub fn supports_ping(&self) -> bool {
        self.codec.supports_ping()
    }

    #[inline]
    pub fn post_connect_handshake(&self, local_worker: photon::WorkerIndex) -> Option<Payload> {
        self.codec.post_connect_handshake(local_worker)
    }

    #[inline]
    pub fn identify(&self) -> Option<&Identify> {
        self.identify.as_ref()
    }

    #[inline]
    pub fn set_identify(&mut self, identify: Identify) {
        self.identify = Some(identify);
    }

    #[inline]
    pub fn is_pipeline(&self) -> bool {
        self.pipeline
    }

    #[inline]
    pub fn set_pipeline(&mut self, pipeline: bool) {
        self.pipeline = pipeline;
    }

    #[inline]
    pub fn with_ssl(&self) -> bool {
        self.with_ssl
    }

    #[inline]
    pub fn set_with_ssl(&mut self, with_ssl: bool) {
        self.with_ssl = with_ssl;
    }

    #[inline]
    pub fn keep_alive(&self) -> f64 {
        self.keep_alive
    }

    #[inline]
    pub fn set_keep_alive(&mut self, seconds: f64, now: f64) {
        self.keep_alive = seconds;
        if seconds > 0.0 {
            self.next_keepalive = now + seconds;
        }
    }

    #[inline]
    pub fn last_recv_time(&self) -> f64 {
        self.last_recv_time
    }

    #[inline]
    pub fn penultimate_active_time(&self) -> f64 {
        self.penultimate_active_time
    }

    #[inline]
    pub fn last_error(&self) -> Option<&(ErrorType, String)> {
        self.error.as_ref()
    }

    #[inline]
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Flips a connecting client channel to established.
    pub fn mark_established(&mut self) {
        if self.status == ChannelStatus::TryConnect {
            self.status = ChannelStatus::Established;
            logging::debug!(self.log, "channel established";
                            "channel_id" => self.id,
                            "channel_seq" => self.sequence);
        }
    }

    /// Rebinds the codec. Only permitted while no frame has moved in either
    /// direction and both buffers are empty; afterwards the framing state is
    /// load-bearing and a swap would corrupt the stream.
    pub fn rebind_codec(&mut self, kind: CodecKind) -> NetworkResult<()> {
        if kind == self.codec.kind() {
            return Ok(());
        }
        if self.frames_sent > 0
            || self.frames_recv > 0
            || !self.read_buffer.is_empty()
            || !self.write_buffer.is_empty()
        {
            return Err(NetworkError::Fatal(ErrorType::CodecRebind));
        }

        logging::debug!(self.log, "channel codec rebound";
                        "channel_id" => self.id,
                        "channel_seq" => self.sequence);
        self.codec = Codec::new(kind);
        Ok(())
    }

    /// Registers the channel's stream on the poll for read (and optionally
    /// write) readiness.
    pub fn register(&self, poll: &mio::Poll, token: mio::Token, ready: mio::Ready) -> NetworkResult<()> {
        let stream = match self.stream.as_ref() {
            Some(stream) => stream,
            None => return Err(NetworkError::Fatal(ErrorType::ChannelClosed)),
        };
        poll.register(stream, token, ready, mio::PollOpt::edge())
            .map_err(Into::into)
    }

    pub fn reregister(&self, poll: &mio::Poll, token: mio::Token, ready: mio::Ready) -> NetworkResult<()> {
        let stream = match self.stream.as_ref() {
            Some(stream) => stream,
            None => return Err(NetworkError::Fatal(ErrorType::ChannelClosed)),
        };
        poll.reregister(stream, token, ready, mio::PollOpt::edge())
            .map_err(Into::into)
    }

    pub fn deregister(&self, poll: &mio::Poll) -> NetworkResult<()> {
        let stream = match self.stream.as_ref() {
            Some(stream) => stream,
            None => return Err(NetworkError::Fatal(ErrorType::ChannelClosed)),
        };
        poll.deregister(stream).map_err(Into::into)
    }

    /// Pending connect error, checked on the first write readiness.
    pub fn connect_error(&self) -> Option<io::Error> {
        self.stream
            .as_ref()
            .and_then(|stream| stream.take_error().ok().and_then(|err| err))
    }

    /// Encodes a payload onto the output buffer and attempts to flush it.
    /// `step_seq` joins the outstanding queue on client channels so the
    /// reply (or a channel failure) can be correlated back.
    pub fn send(&mut self, payload: &Payload, step_seq: StepSeq, now: f64) -> CodecStatus {
        if self.status == ChannelStatus::Closed {
            return CodecStatus::Fault(ErrorType::ChannelClosed);
        }

        match self.codec.encode(payload, &mut self.write_buffer) {
            CodecStatus::WantWrite => (),
            status => return status,
        }

        self.frames_sent += 1;
        if self.is_client {
            self.outstanding.push_back(step_seq);
        }
        self.touch(now);

        if self.status == ChannelStatus::TryConnect {
            // Flushing waits for connect to finish; the reactor keeps the
            // write watcher armed.
            return CodecStatus::WantWrite;
        }

        self.flush(now)
    }

    /// Drains the output buffer to the socket. `Ok` when everything went
    /// out, `WantWrite` when the socket pushed back.
    pub fn flush(&mut self, now: f64) -> CodecStatus {
        if self.write_buffer.is_empty() {
            return CodecStatus::Ok;
        }
        let stream = match self.stream.as_ref() {
            Some(stream) => stream,
            None => return CodecStatus::Fault(ErrorType::ChannelClosed),
        };

        match self.write_buffer.egress(stream) {
            Ok(_) => {
                self.touch(now);
                CodecStatus::Ok
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.touch(now);
                CodecStatus::WantWrite
            }
            Err(err) => {
                self.record_error(ErrorType::Io(err.kind()), err.to_string());
                CodecStatus::Fault(ErrorType::Io(err.kind()))
            }
        }
    }

    /// Reads everything available off the socket and decodes complete
    /// frames. Client channels pop one outstanding step per frame; the
    /// returned status tells the reactor what to do with the watchers.
    pub fn recv(&mut self, now: f64) -> (Vec<(Option<StepSeq>, Frame)>, CodecStatus) {
        let mut frames = Vec::new();

        let eof = {
            let stream = match self.stream.as_ref() {
                Some(stream) => stream,
                None => return (frames, CodecStatus::Fault(ErrorType::ChannelClosed)),
            };

            match self.read_buffer.ingress(stream) {
                Ok(ingress) => {
                    if ingress.received > 0 {
                        self.last_recv_time = now;
                        self.touch(now);
                    }
                    ingress.eof
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => false,
                Err(err) => {
                    self.record_error(ErrorType::Io(err.kind()), err.to_string());
                    return (frames, CodecStatus::Fault(ErrorType::Io(err.kind())));
                }
            }
        };

        let status = loop {
            match self.codec.decode(&mut self.read_buffer) {
                Decoded::Frame(frame) => {
                    self.frames_recv += 1;
                    let step_seq = match self.is_client {
                        true => self.outstanding.pop_front(),
                        false => None,
                    };
                    frames.push((step_seq, frame));
                }
                Decoded::Pause => break CodecStatus::Pause,
                Decoded::PartOk => break CodecStatus::PartOk,
                Decoded::Fault(fault) => {
                    self.record_error(fault.clone(), "protocol decode fault".to_string());
                    break CodecStatus::Fault(fault);
                }
            }
        };

        if eof && !status.is_terminal() {
            self.record_error(ErrorType::Eof, "peer closed connection".to_string());
            return (frames, CodecStatus::Eof);
        }

        (frames, status)
    }

    /// True when the keep-alive timer would fire at `now`. The fire point
    /// re-arms against the last receive time first, so traffic since the
    /// timer was set pushes it out.
    pub fn keepalive_due(&mut self, now: f64) -> bool {
        if self.keep_alive <= 0.0 || self.status == ChannelStatus::Closed {
            return false;
        }
        if now < self.next_keepalive {
            return false;
        }

        let rearmed = self.last_recv_time + self.keep_alive;
        if rearmed > now {
            self.next_keepalive = rearmed;
            return false;
        }

        self.next_keepalive = now + self.keep_alive;
        true
    }

    fn record_error(&mut self, error_type: ErrorType, message: String) {
        logging::debug!(self.log, "channel error";
                        "channel_id" => self.id,
                        "channel_seq" => self.sequence,
                        "error" => ?error_type,
                        "message" => &message);
        self.error = Some((error_type, message));
    }

    #[inline]
    fn touch(&mut self, now: f64) {
        self.penultimate_active_time = self.last_active_time;
        self.last_active_time = now;
    }
}
