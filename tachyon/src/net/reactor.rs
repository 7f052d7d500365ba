use crate::labor::{LaborMessage, LaborQueue, LaborShared};
use crate::net::channel::{Channel, ChannelId, ChannelOption, ChannelStatus};
use crate::net::codec::{CodecKind, CodecStatus, Frame, Payload, RelayFrame};
use crate::net::pool::NamedPool;
use crate::node::Registry;
use photon::logging;
use photon::shared::{ErrorType, Identify, NetworkError, NetworkResult};
use photon::time::timestamp_f64;
use photon::{ChannelSeq, StepSeq, WorkerIndex, NODE_BEAT};
use indexmap::IndexSet;
use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(0);
const LABOR_TOKEN: Token = Token(1);
const CHANNEL_TOKEN_BASE: usize = 16;

const EVENTS_CAPACITY: usize = 8192;
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// How an accepted downstream connection picks its worker.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WorkerSelect {
    RoundRobin,
    AddrHash,
}

/// Accept-side policy for the supervisor labor.
#[derive(Debug, Clone)]
pub struct AcceptPolicy {
    pub select: WorkerSelect,
    /// Codec bound to accepted downstream channels.
    pub codec: CodecKind,
    pub keep_alive: f64,
    /// Max accepts per client address inside one window; zero disables the
    /// limit.
    pub conn_limit_per_addr: u32,
    pub window_secs: f64,
}

impl Default for AcceptPolicy {
    fn default() -> AcceptPolicy {
        AcceptPolicy {
            select: WorkerSelect::RoundRobin,
            codec: CodecKind::Resp,
            keep_alive: 0.0,
            conn_limit_per_addr: 0,
            window_secs: 10.0,
        }
    }
}

/// What a send actually landed on; the router inspects the stamps for
/// death-connection detection and keys its correlation tables off the
/// channel sequence.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub channel: ChannelId,
    pub sequence: ChannelSeq,
    pub last_recv_time: f64,
    pub penultimate_active_time: f64,
    pub now: f64,
}

/// Everything a single `poll_once` surfaced, in occurrence order.
#[derive(Debug)]
pub enum Event {
    /// A decoded inbound frame. `step_seq` is the oldest outstanding step on
    /// a client channel, popped in FIFO order.
    Frame {
        channel: ChannelId,
        sequence: ChannelSeq,
        identify: Option<Identify>,
        step_seq: Option<StepSeq>,
        frame: Frame,
    },
    /// A downstream connection was adopted by this worker.
    Accepted { channel: ChannelId, peer: SocketAddr },
    ChannelEstablished {
        channel: ChannelId,
        identify: Option<Identify>,
    },
    ChannelClosed {
        channel: ChannelId,
        sequence: ChannelSeq,
        identify: Option<Identify>,
        is_client: bool,
        orphaned: Vec<StepSeq>,
        error: Option<(ErrorType, String)>,
    },
    /// Keep-alive expired on a client channel whose codec can ping; the
    /// owner decides what the probe looks like.
    KeepaliveDue {
        channel: ChannelId,
        identify: Option<Identify>,
    },
    /// An in-process relay frame from another worker.
    Relay { from: WorkerIndex, frame: RelayFrame },
    /// The NODE_BEAT housekeeping tick.
    Periodic,
}

struct AcceptControl {
    policy: AcceptPolicy,
    round_robin: usize,
    frequency: HashMap<IpAddr, (u32, f64)>,
}

/// The per-worker reactor: owns the poll, every channel and its watchers,
/// the named channel pool and the session/node registry. Single threaded;
/// all suspension happens in `poll_once`.
pub struct Reactor {
    poll: Poll,
    events: Events,
    worker_index: WorkerIndex,

    channels: Vec<Channel>,
    free: Vec<ChannelId>,
    live: IndexSet<ChannelId>,
    write_armed: IndexSet<ChannelId>,
    next_sequence: ChannelSeq,

    pool: NamedPool,
    registry: Registry,

    listener: Option<TcpListener>,
    accept: Option<AcceptControl>,
    labor_queue: Option<LaborQueue>,
    labor_shared: Option<LaborShared>,

    periodic_interval: f64,
    next_periodic: f64,

    out_events: Vec<Event>,

    log: logging::Logger,
}

impl Reactor {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        worker_index: WorkerIndex,
        log: L,
    ) -> NetworkResult<Reactor> {
        let now = timestamp_f64();

        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            worker_index,
            channels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            write_armed: IndexSet::new(),
            next_sequence: 1,
            pool: NamedPool::new(),
            registry: Registry::new(),
            listener: None,
            accept: None,
            labor_queue: None,
            labor_shared: None,
            periodic_interval: NODE_BEAT,
            next_periodic: now + NODE_BEAT,
            out_events: Vec::new(),
            log: logging::component(log),
        })
    }

    #[inline]
    pub fn worker_index(&self) -> WorkerIndex {
        self.worker_index
    }

    #[inline]
    pub fn registry(&mut self) -> &mut Registry {
        &mut self.registry
    }

    #[inline]
    pub fn registry_ref(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id).filter(|c| c.status() != ChannelStatus::Closed)
    }

    #[inline]
    pub fn connection_num(&self) -> usize {
        self.live.len()
    }

    /// Installs this worker's labor queue; the shared holder is kept for
    /// targeted wakes and accept transfers.
    pub fn set_labor(&mut self, queue: LaborQueue, shared: LaborShared) -> NetworkResult<()> {
        self.poll
            .register(&queue.registration, LABOR_TOKEN, Ready::readable(), PollOpt::edge())?;
        self.labor_queue = Some(queue);
        self.labor_shared = Some(shared);
        Ok(())
    }

    /// Installs only the shared holder. The accept-only supervisor labor
    /// transfers streams to workers but owns no inbox of its own.
    pub fn set_labor_shared(&mut self, shared: LaborShared) {
        self.labor_shared = Some(shared);
    }

    /// Wakes another worker's reactor.
    pub fn async_wake(&self, worker: WorkerIndex) -> bool {
        self.labor_shared
            .as_ref()
            .map(|shared| shared.async_wake(worker))
            .unwrap_or(false)
    }

    /// Binds the downstream listener. Only the accept-only supervisor labor
    /// calls this.
    pub fn listen(&mut self, address: &str, policy: AcceptPolicy) -> NetworkResult<()> {
        let addr = address.parse::<SocketAddr>()?;
        let listener = TcpListener::bind(&addr)?;
        self.poll
            .register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::edge())?;

        logging::info!(self.log, "listening"; "address" => address);

        self.listener = Some(listener);
        self.accept = Some(AcceptControl {
            policy,
            round_robin: 0,
            frequency: HashMap::new(),
        });
        Ok(())
    }

    /// The locally bound listener address, once `listen` succeeded.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Overrides the housekeeping interval.
    pub fn schedule_periodic(&mut self, interval: f64) {
        let now = timestamp_f64();
        self.periodic_interval = interval;
        self.next_periodic = now + interval;
    }

    /// Opens a client channel to `identify` and watches it for connect
    /// completion. The channel joins the named pool immediately; sends are
    /// buffered until the connect finishes.
    pub fn connect(
        &mut self,
        identify: &Identify,
        codec: CodecKind,
        option: &ChannelOption,
    ) -> NetworkResult<ChannelId> {
        let addr = resolve(identify)?;
        let stream = TcpStream::connect(&addr)?;
        let _ = stream.set_nodelay(true);
        let _ = stream.set_keepalive(Some(TCP_KEEPALIVE));

        let now = timestamp_f64();
        let id = self.allocate(codec, true);
        {
            let channel = &mut self.channels[id];
            channel.open(id, stream, now);
            channel.set_identify(identify.clone());
            channel.set_pipeline(option.pipeline);
            channel.set_with_ssl(option.with_ssl);
            channel.set_keep_alive(option.keep_alive, now);
            channel.register(
                &self.poll,
                Token(CHANNEL_TOKEN_BASE + id),
                Ready::readable() | Ready::writable(),
            )?;
        }
        self.live.insert(id);
        self.write_armed.insert(id);
        self.pool.insert(&identify.to_string(), id);

        logging::debug!(self.log, "connecting";
                        "identify" => identify.to_string(),
                        "channel_id" => id,
                        "channel_seq" => self.channels[id].sequence());
        Ok(id)
    }

    /// Adopts an already connected stream (an accepted downstream socket or
    /// one handed over by the supervisor) as a server channel.
    pub fn adopt_stream(
        &mut self,
        stream: TcpStream,
        codec: CodecKind,
        keep_alive: f64,
    ) -> NetworkResult<ChannelId> {
        let peer = stream.peer_addr()?;
        let now = timestamp_f64();
        let id = self.allocate(codec, false);
        {
            let channel = &mut self.channels[id];
            channel.open(id, stream, now);
            channel.set_keep_alive(keep_alive, now);
            channel.register(&self.poll, Token(CHANNEL_TOKEN_BASE + id), Ready::readable())?;
        }
        self.live.insert(id);
        self.out_events.push(Event::Accepted { channel: id, peer });
        Ok(id)
    }

    /// Sends a payload to a named endpoint, reusing a pooled channel or
    /// opening a new one. Non-pipeline channels are checked out of the pool
    /// until their reply comes back.
    pub fn send_to(
        &mut self,
        identify: &Identify,
        codec: CodecKind,
        payload: &Payload,
        step_seq: StepSeq,
    ) -> NetworkResult<SendReceipt> {
        let key = identify.to_string();
        let id = match self.pool.first(&key) {
            Some(id) => id,
            None => {
                let option = self
                    .registry
                    .channel_option(&key)
                    .cloned()
                    .unwrap_or_default();
                self.connect(identify, codec, &option)?
            }
        };

        // A pooled channel can switch framing, but only while pristine.
        if self.channels[id].codec_kind() != codec {
            self.channels[id].rebind_codec(codec)?;
        }

        let now = timestamp_f64();
        let receipt = SendReceipt {
            channel: id,
            sequence: self.channels[id].sequence(),
            last_recv_time: self.channels[id].last_recv_time(),
            penultimate_active_time: self.channels[id].penultimate_active_time(),
            now,
        };

        let status = self.channels[id].send(payload, step_seq, now);
        match status {
            CodecStatus::Ok => self.disable_write(id),
            CodecStatus::Pause | CodecStatus::PartOk | CodecStatus::WantWrite => {
                self.enable_write(id)
            }
            CodecStatus::WantRead => self.disable_write(id),
            status => {
                logging::info!(self.log, "send failed, discarding channel";
                               "identify" => &key,
                               "status" => ?status);
                self.discard(id, true);
                return Err(NetworkError::Fatal(ErrorType::ChannelClosed));
            }
        }

        if !self.channels[id].is_pipeline() {
            self.pool.remove(&key, id);
        }

        Ok(receipt)
    }

    /// Sends on one specific channel, bypassing the pool.
    pub fn send_on(
        &mut self,
        id: ChannelId,
        payload: &Payload,
        step_seq: StepSeq,
    ) -> NetworkResult<()> {
        if self.channel(id).is_none() {
            return Err(NetworkError::Fatal(ErrorType::ChannelClosed));
        }

        let now = timestamp_f64();
        let status = self.channels[id].send(payload, step_seq, now);
        match status {
            CodecStatus::Ok | CodecStatus::WantRead => {
                self.disable_write(id);
                Ok(())
            }
            CodecStatus::Pause | CodecStatus::PartOk | CodecStatus::WantWrite => {
                self.enable_write(id);
                Ok(())
            }
            _ => {
                self.discard(id, true);
                Err(NetworkError::Fatal(ErrorType::ChannelClosed))
            }
        }
    }

    /// Cancels watchers, closes the descriptor and removes the channel from
    /// every index. With `notify` a `ChannelClosed` event is surfaced so the
    /// builder can fail outstanding steps.
    pub fn discard(&mut self, id: ChannelId, notify: bool) {
        if self.channels.get(id).map(|c| c.status()) == Some(ChannelStatus::Closed) {
            return;
        }
        if id >= self.channels.len() {
            return;
        }

        let identify = self.channels[id].identify().cloned();
        let sequence = self.channels[id].sequence();
        let is_client = self.channels[id].is_client();
        let error = self.channels[id].last_error().cloned();

        if self.channels[id].is_client() && self.channels[id].status() == ChannelStatus::TryConnect {
            if let Some(identify) = identify.as_ref() {
                self.registry.node_failed(&identify.to_string());
            }
        }

        if let Some(identify) = identify.as_ref() {
            self.pool.remove(&identify.to_string(), id);
        }
        let _ = self.channels[id].deregister(&self.poll);
        let orphaned = self.channels[id].close();

        self.live.shift_remove(&id);
        self.write_armed.shift_remove(&id);
        self.free.push(id);

        logging::info!(self.log, "channel discarded";
                       "channel_id" => id,
                       "channel_seq" => sequence,
                       "identify" => identify.as_ref().map(|i| i.to_string()),
                       "orphaned" => orphaned.len());

        if notify {
            self.out_events.push(Event::ChannelClosed {
                channel: id,
                sequence,
                identify,
                is_client,
                orphaned,
                error,
            });
        }
    }

    /// Discards every channel pooled under an identifier.
    pub fn disconnect_named(&mut self, identify: &str, notify: bool) {
        for id in self.pool.discard(identify) {
            self.discard(id, notify);
        }
    }

    /// One reactor turn: wait for readiness, drive channels, sweep timers
    /// and drain the surfaced events.
    pub fn poll_once(&mut self, timeout: Duration) -> NetworkResult<Vec<Event>> {
        let now = timestamp_f64();
        let until_periodic = (self.next_periodic - now).max(0.0);
        let wait = timeout.min(Duration::from_millis((until_periodic * 1000.0) as u64 + 1));

        self.poll.poll(&mut self.events, Some(wait))?;

        let ready: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.readiness()))
            .collect();

        let now = timestamp_f64();
        for (token, readiness) in ready {
            match token {
                LISTENER_TOKEN => self.on_accept_ready(now),
                LABOR_TOKEN => self.on_labor_ready(),
                token => {
                    if token.0 < CHANNEL_TOKEN_BASE {
                        continue;
                    }
                    let id = token.0 - CHANNEL_TOKEN_BASE;
                    if id >= self.channels.len() {
                        continue;
                    }
                    if readiness.is_readable() {
                        self.on_read_ready(id, now);
                    }
                    // The channel may have been closed by the read path.
                    if readiness.is_writable()
                        && self.channels[id].status() != ChannelStatus::Closed
                    {
                        self.on_write_ready(id, now);
                    }
                }
            }
        }

        self.sweep_keepalive(now);

        if now >= self.next_periodic {
            self.next_periodic = now + self.periodic_interval;
            self.out_events.push(Event::Periodic);
        }

        Ok(mem::take(&mut self.out_events))
    }

    fn allocate(&mut self, codec: CodecKind, is_client: bool) -> ChannelId {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        match self.free.pop() {
            Some(id) => {
                self.channels[id] = Channel::new(sequence, codec, is_client, &self.log);
                id
            }
            None => {
                let id = self.channels.len();
                self.channels
                    .push(Channel::new(sequence, codec, is_client, &self.log));
                id
            }
        }
    }

    fn enable_write(&mut self, id: ChannelId) {
        if self.write_armed.insert(id) {
            let _ = self.channels[id].reregister(
                &self.poll,
                Token(CHANNEL_TOKEN_BASE + id),
                Ready::readable() | Ready::writable(),
            );
        }
    }

    fn disable_write(&mut self, id: ChannelId) {
        if self.write_armed.shift_remove(&id) {
            let _ = self.channels[id].reregister(
                &self.poll,
                Token(CHANNEL_TOKEN_BASE + id),
                Ready::readable(),
            );
        }
    }

    fn on_read_ready(&mut self, id: ChannelId, now: f64) {
        if self.channels[id].status() == ChannelStatus::Closed {
            return;
        }

        let (frames, status) = self.channels[id].recv(now);

        if !frames.is_empty() {
            // A non-pipeline client channel goes back into the pool as soon
            // as its single outstanding reply has landed.
            let reinsert = self.channels[id].is_client()
                && !self.channels[id].is_pipeline()
                && self.channels[id].outstanding_len() == 0;
            let sequence = self.channels[id].sequence();
            let identify = self.channels[id].identify().cloned();

            if reinsert {
                if let Some(identify) = identify.as_ref() {
                    self.pool.insert(&identify.to_string(), id);
                }
            }

            for (step_seq, frame) in frames {
                self.out_events.push(Event::Frame {
                    channel: id,
                    sequence,
                    identify: identify.clone(),
                    step_seq,
                    frame,
                });
            }
        }

        match status {
            CodecStatus::Ok | CodecStatus::Pause | CodecStatus::PartOk | CodecStatus::PartErr => (),
            CodecStatus::WantWrite => self.enable_write(id),
            CodecStatus::WantRead => self.disable_write(id),
            _ => self.discard(id, true),
        }
    }

    fn on_write_ready(&mut self, id: ChannelId, now: f64) {
        if self.channels[id].status() == ChannelStatus::TryConnect {
            if let Some(err) = self.channels[id].connect_error() {
                logging::info!(self.log, "connect failed";
                               "channel_id" => id,
                               "error" => %err);
                self.discard(id, true);
                return;
            }

            self.channels[id].mark_established();

            let identify = self.channels[id].identify().cloned();
            if let Some(identify) = identify.as_ref() {
                self.registry.node_recover(&identify.to_string());
            }

            // The relay codec introduces itself right after connect.
            if let Some(handshake) = self.channels[id].post_connect_handshake(self.worker_index) {
                self.channels[id].send(&handshake, 0, now);
            }

            self.out_events.push(Event::ChannelEstablished {
                channel: id,
                identify,
            });
        }

        match self.channels[id].flush(now) {
            CodecStatus::Ok | CodecStatus::WantRead => self.disable_write(id),
            CodecStatus::Pause | CodecStatus::PartOk | CodecStatus::WantWrite => {
                self.enable_write(id)
            }
            _ => self.discard(id, true),
        }
    }

    fn on_accept_ready(&mut self, now: f64) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if !self.accept_allowed(peer.ip(), now) {
                        logging::info!(self.log, "accept rate limited"; "peer" => %peer);
                        continue;
                    }

                    let _ = stream.set_nodelay(true);
                    let _ = stream.set_keepalive(Some(TCP_KEEPALIVE));

                    let (codec, keep_alive) = match self.accept.as_ref() {
                        Some(control) => (control.policy.codec, control.policy.keep_alive),
                        None => (CodecKind::Resp, 0.0),
                    };

                    let has_workers = self
                        .labor_shared
                        .as_ref()
                        .map(|shared| shared.worker_count() > 0)
                        .unwrap_or(false);
                    match has_workers {
                        true => {
                            let worker = self.pick_worker(&peer);
                            let shared = self.labor_shared.as_ref().unwrap();
                            if !shared.transfer(worker, LaborMessage::Accepted { stream, peer }) {
                                logging::warn!(self.log, "worker inbox full, dropping accept";
                                               "worker" => worker,
                                               "peer" => %peer);
                            }
                        }
                        false => {
                            // Single-labor mode: adopt on the spot.
                            if let Err(err) = self.adopt_stream(stream, codec, keep_alive) {
                                logging::warn!(self.log, "failed to adopt stream"; "error" => ?err);
                            }
                        }
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::error!(self.log, "accept error"; "error" => %err);
                    return;
                }
            }
        }
    }

    fn on_labor_ready(&mut self) {
        let mut messages = Vec::new();
        if let Some(queue) = self.labor_queue.as_ref() {
            let _ = queue.wake.set_readiness(Ready::empty());
            while let Ok(message) = queue.receiver.try_recv() {
                messages.push(message);
            }
        }

        for message in messages {
            match message {
                LaborMessage::Accepted { stream, peer } => {
                    let (codec, keep_alive) = match self.accept.as_ref() {
                        Some(control) => (control.policy.codec, control.policy.keep_alive),
                        None => (CodecKind::Resp, 0.0),
                    };
                    match self.adopt_stream(stream, codec, keep_alive) {
                        Ok(id) => {
                            logging::debug!(self.log, "adopted transferred stream";
                                            "channel_id" => id,
                                            "peer" => %peer);
                        }
                        Err(err) => {
                            logging::warn!(self.log, "failed to adopt stream"; "error" => ?err);
                        }
                    }
                }
                LaborMessage::Relay { from, frame } => {
                    self.out_events.push(Event::Relay { from, frame });
                }
            }
        }
    }

    fn sweep_keepalive(&mut self, now: f64) {
        let due: Vec<ChannelId> = self
            .live
            .iter()
            .copied()
            .filter(|&id| self.channels[id].keep_alive() > 0.0)
            .collect();

        for id in due {
            if !self.channels[id].keepalive_due(now) {
                continue;
            }
            if self.channels[id].is_client() && self.channels[id].supports_ping() {
                self.out_events.push(Event::KeepaliveDue {
                    channel: id,
                    identify: self.channels[id].identify().cloned(),
                });
            } else {
                logging::info!(self.log, "keep-alive expired";
                               "channel_id" => id,
                               "channel_seq" => self.channels[id].sequence());
                self.discard(id, true);
            }
        }
    }

    fn accept_allowed(&mut self, addr: IpAddr, now: f64) -> bool {
        let control = match self.accept.as_mut() {
            Some(control) => control,
            None => return true,
        };
        if control.policy.conn_limit_per_addr == 0 {
            return true;
        }

        let window = control.policy.window_secs;
        let limit = control.policy.conn_limit_per_addr;
        let slot = control.frequency.entry(addr).or_insert((0, now));

        if now - slot.1 > window {
            *slot = (0, now);
        }
        slot.0 += 1;
        slot.0 <= limit
    }

    fn pick_worker(&mut self, peer: &SocketAddr) -> WorkerIndex {
        let worker_count = self
            .labor_shared
            .as_ref()
            .map(LaborShared::worker_count)
            .unwrap_or(1)
            .max(1);

        let control = match self.accept.as_mut() {
            Some(control) => control,
            None => return 0,
        };

        match control.policy.select {
            WorkerSelect::RoundRobin => {
                let worker = control.round_robin % worker_count;
                control.round_robin = control.round_robin.wrapping_add(1);
                worker as WorkerIndex
            }
            WorkerSelect::AddrHash => {
                let mut hasher = DefaultHasher::new();
                peer.ip().hash(&mut hasher);
                (hasher.finish() % worker_count as u64) as WorkerIndex
            }
        }
    }
}

fn resolve(identify: &Identify) -> NetworkResult<SocketAddr> {
    (identify.host.as_str(), identify.port)
        .to_socket_addrs()
        .map_err(NetworkError::from)?
        .next()
        .ok_or(NetworkError::Fatal(ErrorType::AddrParse))
}
