use crate::cluster::command::{self, AccessMode, KeyLayout};
use crate::cluster::topology::Topology;
use crate::cluster::{Dispatch, StepError, StepErrorKind, StepHandler};
use crate::net::channel::ChannelOption;
use crate::net::codec::{RespRequest, RespValue};
use hashbrown::HashMap;
use indexmap::IndexMap;
use photon::logging;
use photon::shared::Identify;
use photon::time::timestamp_f64;
use photon::{ChannelSeq, StepSeq};
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::rc::Rc;

/// Minimum seconds between two health check runs.
const MIN_CHECK_INTERVAL: f64 = 2.0;
/// How many step-timeout spans a purged-step tombstone survives; a reply
/// later than that has nothing left to match anyway.
const TOMBSTONE_SPANS: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster label, used to look up credentials in the registry.
    pub identify: String,
    pub with_ssl: bool,
    pub pipeline: bool,
    pub enable_readonly: bool,
    /// Per-step deadline in seconds.
    pub timeout_seconds: f64,
    /// Discovery seeds, tried in rotation.
    pub seed_addresses: Vec<String>,
    pub auth_password: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> ClusterConfig {
        ClusterConfig {
            identify: String::new(),
            with_ssl: false,
            pipeline: true,
            enable_readonly: false,
            timeout_seconds: 7.0,
            seed_addresses: Vec::new(),
            auth_password: None,
        }
    }
}

impl ClusterConfig {
    /// Parses a comma-separated seed list into a config.
    pub fn with_seeds<S: Into<String>>(identify: S, seeds: &str) -> ClusterConfig {
        ClusterConfig {
            identify: identify.into(),
            seed_addresses: seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            ..ClusterConfig::default()
        }
    }
}

/// The Redis-cluster router. Owns the slot map, the failed-node set, both
/// correlation tables and the multi-key aggregation state; user steps are
/// referenced by sequence number only and results flow back through the
/// `StepHandler` seam.
pub struct RedisCluster {
    config: ClusterConfig,
    /// The router's own step sequence; replies correlated to it are
    /// housekeeping (`CLUSTER SLOTS`, `ASKING`, `READONLY`, `AUTH`, `PING`).
    own_seq: StepSeq,

    topology: Topology,
    failed_nodes: IndexMap<String, ()>,
    address_index: usize,
    last_check_time: f64,

    /// Pipeline mode: per-endpoint FIFO of in-flight requests; reply order
    /// equals request order on a channel.
    pipeline_requests: HashMap<String, VecDeque<Rc<RespRequest>>>,
    /// Non-pipeline mode: the single in-flight request per channel sequence.
    stream_requests: HashMap<ChannelSeq, Rc<RespRequest>>,

    /// Multi-key aggregation: outstanding sub-request count and positional
    /// reply slots per user step.
    emit_num: HashMap<StepSeq, usize>,
    replies: HashMap<StepSeq, Vec<Option<RespValue>>>,

    /// Send-time buckets for timeout GC, walked in time order.
    timeout_steps: BTreeMap<i64, Vec<StepSeq>>,
    /// Steps already purged by the GC; a late reply for one of these is
    /// dropped silently.
    purged: HashMap<StepSeq, f64>,

    /// Commands submitted before the first topology reply, drained in
    /// insertion order once it lands.
    waiting: Vec<(StepSeq, RespRequest)>,

    log: logging::Logger,
}

impl RedisCluster {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: ClusterConfig,
        own_seq: StepSeq,
        log: L,
    ) -> RedisCluster {
        RedisCluster {
            config,
            own_seq,
            topology: Topology::new(),
            failed_nodes: IndexMap::new(),
            address_index: 0,
            last_check_time: 0.0,
            pipeline_requests: HashMap::new(),
            stream_requests: HashMap::new(),
            emit_num: HashMap::new(),
            replies: HashMap::new(),
            timeout_steps: BTreeMap::new(),
            purged: HashMap::new(),
            waiting: Vec::new(),
            log: logging::component(log),
        }
    }

    #[inline]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Kicks off topology discovery; called once at startup.
    pub fn emit(&mut self, io: &mut dyn Dispatch, handler: &mut dyn StepHandler) {
        self.send_cluster_slots(io, handler);
    }

    /// Submits a user command under `step_seq`. Before the first topology
    /// reply lands the command is queued and a discovery round is issued.
    pub fn submit(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        step_seq: StepSeq,
        request: RespRequest,
    ) {
        self.register_step(step_seq, timestamp_f64());

        if self.topology.is_empty() {
            self.waiting.push((step_seq, request));
            self.send_cluster_slots(io, handler);
            return;
        }

        self.dispatch(io, handler, step_seq, request);
    }

    fn dispatch(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        step_seq: StepSeq,
        request: RespRequest,
    ) {
        let info = match command::extract(&request) {
            Ok(info) => info,
            Err(error) => {
                handler.on_error(step_seq, error);
                return;
            }
        };

        match info.layout {
            KeyLayout::None => {
                let target = match self.topology.any_master() {
                    Some(target) => target,
                    None => {
                        handler.on_error(
                            step_seq,
                            StepError::new(StepErrorKind::NoRoute, "no known node"),
                        );
                        return;
                    }
                };
                let mut request = request;
                request.step_seq = step_seq;
                self.send_request(io, handler, &target, Rc::new(request));
            }
            KeyLayout::Single { slot } => {
                let mut request = request;
                request.step_seq = step_seq;
                self.route_single(io, handler, info.mode, slot, Rc::new(request));
            }
            KeyLayout::Multi { slots, interval } if slots.len() == 1 => {
                // All keys in one slot: no splitting, the reply passes
                // through whole.
                let _ = interval;
                let mut request = request;
                request.step_seq = step_seq;
                self.route_single(io, handler, info.mode, slots[0], Rc::new(request));
            }
            KeyLayout::Multi { slots, interval } => {
                self.route_multi(io, handler, step_seq, request, info.mode, slots, interval);
            }
        }
    }

    fn route_single(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        mode: AccessMode,
        slot: u16,
        request: Rc<RespRequest>,
    ) {
        let step_seq = request.step_seq;
        let (target, is_master) = match self.pick_node(slot, mode) {
            Ok(picked) => picked,
            Err(error) => {
                self.err_back(handler, step_seq, Some(&request), error);
                return;
            }
        };

        if !is_master && self.need_set_readonly(&target) {
            self.send_readonly(io, handler, &target);
        }
        self.send_request(io, handler, &target, request);
    }

    fn route_multi(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        step_seq: StepSeq,
        request: RespRequest,
        mode: AccessMode,
        slots: Vec<u16>,
        interval: usize,
    ) {
        if slots.len() * interval >= request.len() {
            handler.on_error(
                step_seq,
                StepError::new(StepErrorKind::InvalidCommand, "element count mismatch"),
            );
            return;
        }

        // Group keys by slot, preserving key order inside each group and
        // remembering every key's original position for reassembly.
        let mut groups: IndexMap<u16, RespRequest> = IndexMap::new();
        for (key_pos, slot) in slots.iter().enumerate() {
            let base = key_pos * interval + 1;
            let sub = groups.entry(*slot).or_insert_with(|| {
                let mut sub = RespRequest::new();
                sub.step_seq = step_seq;
                sub.push(request.parts[0].bytes.clone());
                sub
            });
            sub.push_keyed(request.parts[base].bytes.clone(), key_pos as u32);
            for offset in 1..interval {
                sub.push(request.parts[base + offset].bytes.clone());
            }
        }

        // Aggregation state must exist before the first sub-request goes
        // out: a synchronous send failure reports through it.
        self.emit_num.insert(step_seq, groups.len());
        self.replies.insert(step_seq, vec![None; slots.len()]);

        for (slot, sub) in groups {
            let sub = Rc::new(sub);
            match self.pick_node(slot, mode) {
                Ok((target, is_master)) => {
                    if !is_master && self.need_set_readonly(&target) {
                        self.send_readonly(io, handler, &target);
                    }
                    self.send_request(io, handler, &target, sub);
                }
                Err(error) => {
                    self.err_back(handler, step_seq, Some(&sub), error);
                }
            }
        }
    }

    /// Resolves a slot to an endpoint. Writes, disabled read-routing and
    /// fully failed follower sets all land on the master; otherwise the
    /// node's follower rotation is advanced past failed endpoints.
    fn pick_node(&self, slot: u16, mode: AccessMode) -> Result<(String, bool), StepError> {
        let node = self.topology.node_for_slot(slot).ok_or_else(|| {
            StepError::new(
                StepErrorKind::NoRoute,
                format!("no node for slot {}", slot),
            )
        })?;

        if mode == AccessMode::Write || node.followers.is_empty() || !self.config.enable_readonly {
            return Ok((node.master.clone(), true));
        }

        let failed = &self.failed_nodes;
        match node.next_follower(|candidate| !failed.contains_key(candidate)) {
            Some(follower) => Ok((follower.to_string(), false)),
            None => Ok((node.master.clone(), true)),
        }
    }

    /// A follower needs the `READONLY` handshake when nothing is in flight
    /// on its channel yet.
    fn need_set_readonly(&self, identify: &str) -> bool {
        self.pipeline_requests
            .get(identify)
            .map(|queue| queue.is_empty())
            .unwrap_or(true)
    }

    /// Sends one request to an endpoint and records the correlation entry.
    /// Detects dead connections at send time: traffic was recently queued
    /// but nothing has been received for longer than the step timeout.
    fn send_request(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        target: &str,
        request: Rc<RespRequest>,
    ) -> bool {
        let identify = match Identify::parse(target) {
            Ok(identify) => identify,
            Err(err) => {
                logging::error!(self.log, "bad endpoint identify";
                                "target" => target,
                                "error" => ?err);
                self.err_back(
                    handler,
                    request.step_seq,
                    Some(&request),
                    StepError::new(
                        StepErrorKind::Transport,
                        format!("bad endpoint {}", target),
                    ),
                );
                return false;
            }
        };

        if !io.has_channel_option(target) {
            io.set_channel_option(
                target,
                ChannelOption {
                    with_ssl: self.config.with_ssl,
                    pipeline: self.config.pipeline,
                    keep_alive: self.config.timeout_seconds,
                },
            );
        }

        let receipt = match io.send_resp(&identify, &request) {
            Ok(receipt) => receipt,
            Err(err) => {
                logging::error!(self.log, "send failed";
                                "target" => target,
                                "error" => ?err);
                self.failed_nodes.insert(target.to_string(), ());
                self.health_check(io, handler);
                self.err_back(
                    handler,
                    request.step_seq,
                    Some(&request),
                    StepError::new(
                        StepErrorKind::Transport,
                        format!("send to {} failed", target),
                    ),
                );
                return false;
            }
        };

        let check_time = receipt.now - self.config.timeout_seconds;
        if receipt.penultimate_active_time > check_time
            && receipt.last_recv_time > 0.0
            && receipt.last_recv_time < check_time
        {
            logging::error!(self.log, "death connection detected, closing";
                            "target" => target,
                            "channel_seq" => receipt.sequence,
                            "penultimate_active_time" => receipt.penultimate_active_time,
                            "last_recv_time" => receipt.last_recv_time);
            let death = StepError::new(StepErrorKind::DeathConnection, "death connection closed");
            self.err_back_channel(handler, receipt.sequence, target, death.clone());
            self.err_back(handler, request.step_seq, Some(&request), death);
            io.discard(receipt.channel, false);
            return false;
        }

        if self.config.pipeline {
            self.pipeline_requests
                .entry(target.to_string())
                .or_insert_with(VecDeque::new)
                .push_back(request);
        } else if self.stream_requests.contains_key(&receipt.sequence) {
            logging::error!(self.log, "channel already has an in-flight request";
                            "target" => target,
                            "channel_seq" => receipt.sequence);
        } else {
            self.stream_requests.insert(receipt.sequence, request);
        }
        true
    }

    /// Reply entry point: a frame arrived on the channel identified by
    /// `channel_seq`/`identify`. Pops the matching correlation record and
    /// routes the reply.
    pub fn on_reply(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        channel_seq: ChannelSeq,
        identify: &str,
        reply: RespValue,
    ) {
        let request = if self.config.pipeline {
            match self.pipeline_requests.get_mut(identify) {
                Some(queue) => match queue.pop_front() {
                    Some(request) => request,
                    None => {
                        logging::error!(self.log, "reply on channel with empty pipeline queue";
                                        "identify" => identify);
                        return;
                    }
                },
                None => {
                    logging::error!(self.log, "reply on unknown pipeline channel";
                                    "identify" => identify);
                    return;
                }
            }
        } else {
            match self.stream_requests.remove(&channel_seq) {
                Some(request) => request,
                None => {
                    logging::error!(self.log, "reply for unknown channel sequence";
                                    "channel_seq" => channel_seq);
                    return;
                }
            }
        };

        let step_seq = request.step_seq;
        if step_seq == self.own_seq {
            self.on_housekeeping_reply(io, handler, channel_seq, identify, request, reply);
            return;
        }

        if self.purged.remove(&step_seq).is_some() {
            logging::debug!(self.log, "late reply for purged step dropped";
                            "step_seq" => step_seq);
            return;
        }

        if self.emit_num.contains_key(&step_seq) {
            self.on_multi_reply(io, handler, identify, request, reply);
        } else {
            self.on_single_reply(io, handler, identify, request, reply);
        }
    }

    fn on_housekeeping_reply(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        channel_seq: ChannelSeq,
        identify: &str,
        request: Rc<RespRequest>,
        reply: RespValue,
    ) {
        match request.command().as_deref() {
            Some("ASKING") => {
                if let Some(text) = reply.error_text() {
                    logging::error!(self.log, "unexpected ASKING reply";
                                    "identify" => identify,
                                    "message" => text);
                }
            }
            Some("PING") => {
                if reply.is_status_or_bulk() {
                    self.failed_nodes.shift_remove(identify);
                }
            }
            Some("READONLY") => {
                if let Some(text) = reply.error_text() {
                    logging::error!(self.log, "set read only failed";
                                    "identify" => identify,
                                    "message" => text);
                }
            }
            Some("AUTH") => {
                if let Some(text) = reply.error_text() {
                    logging::error!(self.log, "auth failed";
                                    "identify" => identify,
                                    "message" => text);
                    let error = StepError::new(StepErrorKind::AuthFailed, text);
                    self.err_back_channel(handler, channel_seq, identify, error);
                } else if self.topology.is_empty() {
                    self.send_cluster_slots(io, handler);
                }
            }
            _ => {
                // CLUSTER SLOTS.
                if let Some(text) = reply.error_text() {
                    let text = text.to_string();
                    if text.starts_with("NOAUTH") {
                        self.auth(io, handler, identify, None);
                    } else {
                        logging::error!(self.log, "topology discovery failed";
                                        "identify" => identify,
                                        "message" => &text);
                    }
                } else {
                    self.topology.apply_cluster_slots(&reply, &self.log);
                    self.drain_waiting(io, handler);
                }
            }
        }
    }

    fn on_single_reply(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        identify: &str,
        request: Rc<RespRequest>,
        reply: RespValue,
    ) {
        if let Some(text) = reply.error_text() {
            let text = text.to_string();
            if let Some(endpoint) = redirect_endpoint(&text, "MOVED") {
                // Re-send ahead of the asynchronous topology refresh.
                self.send_request(io, handler, &endpoint, request);
                self.send_cluster_slots(io, handler);
                return;
            }
            if let Some(endpoint) = redirect_endpoint(&text, "ASK") {
                self.send_asking(io, handler, &endpoint);
                self.send_request(io, handler, &endpoint, request);
                return;
            }
            if text.starts_with("NOAUTH") {
                self.auth(io, handler, identify, Some(request));
                return;
            }
            if text.starts_with("CROSSSLOT") {
                self.send_cluster_slots(io, handler);
                handler.on_error(
                    request.step_seq,
                    StepError::new(StepErrorKind::CrossSlot, text),
                );
                return;
            }
        }

        // Server errors are forwarded verbatim as the reply value.
        handler.on_response(request.step_seq, reply);
    }

    fn on_multi_reply(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        identify: &str,
        request: Rc<RespRequest>,
        reply: RespValue,
    ) {
        let _ = identify;
        let step_seq = request.step_seq;

        if let RespValue::Array(ref elements) = reply {
            let positions = key_positions(&request);
            match self.replies.get_mut(&step_seq) {
                Some(slots) => {
                    for (offset, position) in positions.iter().enumerate() {
                        let position = *position as usize;
                        if position >= slots.len() {
                            logging::error!(self.log, "key index beyond reply width";
                                            "step_seq" => step_seq,
                                            "position" => position);
                            continue;
                        }
                        match elements.get(offset) {
                            Some(element) => slots[position] = Some(element.clone()),
                            None => {
                                logging::error!(self.log, "sub-reply shorter than key count";
                                                "step_seq" => step_seq,
                                                "offset" => offset);
                            }
                        }
                    }
                    if !elements.is_empty() && positions.len() != elements.len() {
                        logging::error!(self.log, "request and reply width mismatch";
                                        "step_seq" => step_seq,
                                        "keys" => positions.len(),
                                        "elements" => elements.len());
                    }
                }
                None => {
                    logging::error!(self.log, "no reply record for step"; "step_seq" => step_seq);
                    return;
                }
            }
            self.count_down(handler, step_seq);
            return;
        }

        if let Some(text) = reply.error_text() {
            let text = text.to_string();
            if let Some(endpoint) = redirect_endpoint(&text, "MOVED") {
                self.send_request(io, handler, &endpoint, request);
                self.send_cluster_slots(io, handler);
                return;
            }
            if let Some(endpoint) = redirect_endpoint(&text, "ASK") {
                self.send_asking(io, handler, &endpoint);
                self.send_request(io, handler, &endpoint, request);
                return;
            }
            if text.starts_with("CROSSSLOT") {
                self.send_cluster_slots(io, handler);
            }
        }

        // A flat reply (`+OK` for a write sub-request, or an error) lands in
        // every key position this sub-request covered.
        match self.replies.get_mut(&step_seq) {
            Some(slots) => {
                for position in key_positions(&request) {
                    let position = position as usize;
                    if position < slots.len() {
                        slots[position] = Some(reply.clone());
                    } else {
                        logging::error!(self.log, "key index beyond reply width";
                                        "step_seq" => step_seq,
                                        "position" => position);
                    }
                }
            }
            None => {
                logging::error!(self.log, "no reply record for step"; "step_seq" => step_seq);
                return;
            }
        }
        self.count_down(handler, step_seq);
    }

    fn count_down(&mut self, handler: &mut dyn StepHandler, step_seq: StepSeq) {
        let done = match self.emit_num.get_mut(&step_seq) {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if done {
            self.finalize(handler, step_seq);
        }
    }

    /// Assembles the aggregated reply in original key order and delivers it.
    fn finalize(&mut self, handler: &mut dyn StepHandler, step_seq: StepSeq) {
        self.emit_num.remove(&step_seq);
        let slots = self.replies.remove(&step_seq).unwrap_or_default();
        let elements = slots
            .into_iter()
            .map(|slot| slot.unwrap_or(RespValue::Nil))
            .collect();
        handler.on_response(step_seq, RespValue::Array(elements));
    }

    /// Channel failure entry point: records the endpoint as failed, runs a
    /// health check and errors every in-flight step on that channel.
    pub fn on_channel_error(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        channel_seq: ChannelSeq,
        identify: &str,
        error: StepError,
    ) {
        logging::error!(self.log, "channel error";
                        "identify" => identify,
                        "channel_seq" => channel_seq,
                        "kind" => ?error.kind,
                        "message" => &error.message);
        self.failed_nodes.insert(identify.to_string(), ());
        self.health_check(io, handler);
        self.err_back_channel(handler, channel_seq, identify, error);
    }

    /// Keep-alive expiry on one of the cluster's channels: probe it.
    pub fn ping_channel(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        identify: &str,
    ) {
        self.send_ping(io, handler, identify);
    }

    /// Periodic housekeeping: refresh topology while nodes are failed,
    /// probe or prune failed endpoints, and garbage collect timed-out
    /// steps.
    pub fn health_check(&mut self, io: &mut dyn Dispatch, handler: &mut dyn StepHandler) {
        self.health_check_at(io, handler, timestamp_f64());
    }

    fn health_check_at(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        now: f64,
    ) {
        if now - self.last_check_time < MIN_CHECK_INTERVAL {
            return;
        }
        self.last_check_time = now;

        if !self.failed_nodes.is_empty() {
            self.send_cluster_slots(io, handler);
        }

        // Two passes: drop endpoints the topology no longer names, then
        // probe what is left.
        let topology = &self.topology;
        self.failed_nodes
            .retain(|identify, _| topology.contains_node(identify));
        let probes: Vec<String> = self.failed_nodes.keys().cloned().collect();
        for identify in probes {
            self.send_ping(io, handler, &identify);
        }

        loop {
            let bucket = match self.timeout_steps.keys().next() {
                Some(&bucket) => bucket,
                None => break,
            };
            if now - (bucket as f64) < self.config.timeout_seconds {
                break;
            }
            let steps = self.timeout_steps.remove(&bucket).unwrap_or_default();
            for step_seq in steps {
                self.replies.remove(&step_seq);
                self.emit_num.remove(&step_seq);
                self.purged.insert(step_seq, now);
            }
        }

        let horizon = self.config.timeout_seconds * TOMBSTONE_SPANS;
        self.purged.retain(|_, stamp| now - *stamp < horizon);
    }

    fn send_cluster_slots(&mut self, io: &mut dyn Dispatch, handler: &mut dyn StepHandler) -> bool {
        if self.config.seed_addresses.is_empty() {
            logging::error!(self.log, "no seed addresses configured");
            return false;
        }

        let mut request = RespRequest::from_args(&["CLUSTER", "SLOTS"]);
        request.step_seq = self.own_seq;

        if self.address_index >= self.config.seed_addresses.len() {
            self.address_index = 0;
        }
        let target = self.config.seed_addresses[self.address_index].clone();
        self.address_index += 1;

        self.send_request(io, handler, &target, Rc::new(request))
    }

    fn send_asking(&mut self, io: &mut dyn Dispatch, handler: &mut dyn StepHandler, target: &str) {
        let mut request = RespRequest::from_args(&["ASKING"]);
        request.step_seq = self.own_seq;
        self.send_request(io, handler, target, Rc::new(request));
    }

    fn send_readonly(&mut self, io: &mut dyn Dispatch, handler: &mut dyn StepHandler, target: &str) {
        let mut request = RespRequest::from_args(&["READONLY"]);
        request.step_seq = self.own_seq;
        self.send_request(io, handler, target, Rc::new(request));
    }

    fn send_ping(&mut self, io: &mut dyn Dispatch, handler: &mut dyn StepHandler, target: &str) {
        let mut request = RespRequest::from_args(&["PING"]);
        request.step_seq = self.own_seq;
        self.send_request(io, handler, target, Rc::new(request));
    }

    /// Authenticates against one endpoint, replaying `pending` afterwards
    /// when the `NOAUTH` was triggered by a user request.
    fn auth(
        &mut self,
        io: &mut dyn Dispatch,
        handler: &mut dyn StepHandler,
        identify: &str,
        pending: Option<Rc<RespRequest>>,
    ) {
        let password = io
            .auth_record(&self.config.identify)
            .map(|record| record.password)
            .or_else(|| self.config.auth_password.clone());

        let password = match password {
            Some(password) => password,
            None => {
                logging::error!(self.log, "auth required but no credentials configured";
                                "identify" => identify);
                if let Some(pending) = pending {
                    self.err_back(
                        handler,
                        pending.step_seq,
                        Some(&pending),
                        StepError::new(StepErrorKind::AuthFailed, "no credentials configured"),
                    );
                }
                return;
            }
        };

        let mut request = RespRequest::from_args(&["AUTH"]);
        request.push(password.into_bytes());
        request.step_seq = self.own_seq;
        self.send_request(io, handler, identify, Rc::new(request));

        if let Some(pending) = pending {
            self.send_request(io, handler, identify, pending);
        }
    }

    /// Errors one request out. Sub-requests of a multi-key step fill their
    /// key positions with per-key error replies; plain steps surface the
    /// error directly.
    fn err_back(
        &mut self,
        handler: &mut dyn StepHandler,
        step_seq: StepSeq,
        request: Option<&Rc<RespRequest>>,
        error: StepError,
    ) {
        if step_seq == self.own_seq {
            return;
        }

        if self.emit_num.contains_key(&step_seq) {
            if let (Some(slots), Some(request)) = (self.replies.get_mut(&step_seq), request) {
                let reply = RespValue::error(error.message.clone());
                for position in key_positions(request) {
                    let position = position as usize;
                    if position < slots.len() {
                        slots[position] = Some(reply.clone());
                    }
                }
            }
            self.count_down(handler, step_seq);
        } else {
            handler.on_error(step_seq, error);
        }
    }

    /// Errors every in-flight request on one channel.
    fn err_back_channel(
        &mut self,
        handler: &mut dyn StepHandler,
        channel_seq: ChannelSeq,
        identify: &str,
        error: StepError,
    ) {
        if self.config.pipeline {
            let drained: Vec<Rc<RespRequest>> = self
                .pipeline_requests
                .get_mut(identify)
                .map(|queue| queue.drain(..).collect())
                .unwrap_or_default();
            for request in drained {
                self.err_back(handler, request.step_seq, Some(&request), error.clone());
            }
        } else if let Some(request) = self.stream_requests.remove(&channel_seq) {
            self.err_back(handler, request.step_seq, Some(&request), error);
        }
    }

    fn drain_waiting(&mut self, io: &mut dyn Dispatch, handler: &mut dyn StepHandler) {
        let waiting = mem::replace(&mut self.waiting, Vec::new());
        for (step_seq, request) in waiting {
            self.dispatch(io, handler, step_seq, request);
        }
    }

    fn register_step(&mut self, step_seq: StepSeq, now: f64) {
        self.timeout_steps
            .entry(now as i64)
            .or_insert_with(Vec::new)
            .push(step_seq);
    }
}

/// Key positions inside a sub-request: parameter one is always a key, and
/// any later parameter with a recorded original index is one too.
fn key_positions(request: &RespRequest) -> Vec<u32> {
    request
        .parts
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(position, part)| part.key_index > 0 || *position == 1)
        .map(|(_, part)| part.key_index)
        .collect()
}

/// Extracts the endpoint of a `MOVED <slot> <endpoint>` / `ASK <slot>
/// <endpoint>` error reply.
fn redirect_endpoint(text: &str, prefix: &str) -> Option<String> {
    let mut parts = text.split_whitespace();
    if parts.next() != Some(prefix) {
        return None;
    }
    let _slot = parts.next()?;
    parts.next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Dispatch;
    use crate::net::reactor::SendReceipt;
    use crate::node::AuthRecord;
    use hashbrown::HashSet;
    use photon::shared::{ErrorType, NetworkError, NetworkResult};

    const OWN_SEQ: StepSeq = u32::max_value();

    #[derive(Default)]
    struct MockHandler {
        responses: Vec<(StepSeq, RespValue)>,
        errors: Vec<(StepSeq, StepError)>,
    }

    impl StepHandler for MockHandler {
        fn on_response(&mut self, step_seq: StepSeq, reply: RespValue) {
            self.responses.push((step_seq, reply));
        }

        fn on_error(&mut self, step_seq: StepSeq, error: StepError) {
            self.errors.push((step_seq, error));
        }
    }

    struct MockIo {
        sent: Vec<(String, RespRequest)>,
        sequences: HashMap<String, ChannelSeq>,
        next_sequence: ChannelSeq,
        options: HashMap<String, ChannelOption>,
        auth: Option<AuthRecord>,
        refuse: HashSet<String>,
        /// identify -> (now, last_recv, penultimate_active) for fabricated
        /// death-connection stamps.
        stamps: HashMap<String, (f64, f64, f64)>,
        discarded: Vec<crate::net::channel::ChannelId>,
    }

    impl MockIo {
        fn new() -> MockIo {
            MockIo {
                sent: Vec::new(),
                sequences: HashMap::new(),
                next_sequence: 1,
                options: HashMap::new(),
                auth: None,
                refuse: HashSet::new(),
                stamps: HashMap::new(),
                discarded: Vec::new(),
            }
        }

        fn sent_commands(&self) -> Vec<(String, String)> {
            self.sent
                .iter()
                .map(|(identify, request)| (identify.clone(), request.command().unwrap()))
                .collect()
        }

        fn sequence_of(&self, identify: &str) -> ChannelSeq {
            self.sequences[identify]
        }
    }

    impl Dispatch for MockIo {
        fn send_resp(
            &mut self,
            identify: &Identify,
            request: &RespRequest,
        ) -> NetworkResult<SendReceipt> {
            let key = identify.to_string();
            if self.refuse.contains(&key) {
                return Err(NetworkError::Fatal(ErrorType::Io(
                    std::io::ErrorKind::ConnectionRefused,
                )));
            }

            let next = &mut self.next_sequence;
            let sequence = *self.sequences.entry(key.clone()).or_insert_with(|| {
                let sequence = *next;
                *next += 1;
                sequence
            });

            self.sent.push((key.clone(), request.clone()));

            let (now, last_recv, penultimate) =
                self.stamps.get(&key).copied().unwrap_or((1000.0, 0.0, 0.0));
            Ok(SendReceipt {
                channel: sequence as usize,
                sequence,
                last_recv_time: last_recv,
                penultimate_active_time: penultimate,
                now,
            })
        }

        fn discard(&mut self, channel: crate::net::channel::ChannelId, _notify: bool) {
            self.discarded.push(channel);
        }

        fn has_channel_option(&self, identify: &str) -> bool {
            self.options.contains_key(identify)
        }

        fn set_channel_option(&mut self, identify: &str, option: ChannelOption) {
            self.options.insert(identify.to_string(), option);
        }

        fn auth_record(&self, _identify: &str) -> Option<AuthRecord> {
            self.auth.clone()
        }
    }

    fn endpoint(host: &str, port: i64) -> RespValue {
        RespValue::Array(vec![RespValue::bulk(host), RespValue::Integer(port)])
    }

    fn range(from: i64, to: i64, endpoints: Vec<RespValue>) -> RespValue {
        let mut elements = vec![RespValue::Integer(from), RespValue::Integer(to)];
        elements.extend(endpoints);
        RespValue::Array(elements)
    }

    /// Three masters: slots 0-5460 on .1, 5461-10922 on .2, 10923-16383 on
    /// .3; one follower for the first range.
    fn topology_reply() -> RespValue {
        RespValue::Array(vec![
            range(
                0,
                5460,
                vec![endpoint("10.0.0.1", 7000), endpoint("10.0.1.1", 7000)],
            ),
            range(5461, 10922, vec![endpoint("10.0.0.2", 7000)]),
            range(10923, 16383, vec![endpoint("10.0.0.3", 7000)]),
        ])
    }

    fn router() -> RedisCluster {
        let config = ClusterConfig::with_seeds("test-cluster", "10.0.0.1:7000,10.0.0.2:7000");
        RedisCluster::new(config, OWN_SEQ, None)
    }

    /// Builds a router with installed topology by walking the discovery
    /// handshake: submit queues, CLUSTER SLOTS goes to the first seed, the
    /// reply installs the slot map.
    fn routed(io: &mut MockIo, handler: &mut MockHandler) -> RedisCluster {
        let mut cluster = router();
        cluster.emit(io, handler);

        let seed = io.sent[0].0.clone();
        assert_eq!(io.sent[0].1.command().unwrap(), "CLUSTER");
        let sequence = io.sequence_of(&seed);
        cluster.on_reply(io, handler, sequence, &seed, topology_reply());
        io.sent.clear();
        cluster
    }

    #[test]
    fn test_get_routes_to_slot_owner() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        // CRC16("foo") mod 16384 = 12182, owned by 10.0.0.3.
        cluster.submit(&mut io, &mut handler, 7, RespRequest::from_args(&["GET", "foo"]));

        assert_eq!(io.sent_commands(), [("10.0.0.3:7000".to_string(), "GET".to_string())]);

        let sequence = io.sequence_of("10.0.0.3:7000");
        cluster.on_reply(&mut io, &mut handler, sequence, "10.0.0.3:7000", RespValue::bulk("bar"));

        assert_eq!(handler.responses, [(7, RespValue::bulk("bar"))]);
        assert!(handler.errors.is_empty());
    }

    #[test]
    fn test_moved_resends_and_refreshes() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        cluster.submit(&mut io, &mut handler, 9, RespRequest::from_args(&["GET", "foo"]));
        io.sent.clear();

        let sequence = io.sequence_of("10.0.0.3:7000");
        cluster.on_reply(
            &mut io,
            &mut handler,
            sequence,
            "10.0.0.3:7000",
            RespValue::error("MOVED 12182 10.0.0.9:7000"),
        );

        // Re-sent to the new owner before the refresh, then a discovery
        // round against the seed rotation.
        let commands = io.sent_commands();
        assert_eq!(commands[0], ("10.0.0.9:7000".to_string(), "GET".to_string()));
        assert!(commands.iter().any(|(_, cmd)| cmd == "CLUSTER"));
        assert!(handler.responses.is_empty());

        // The re-sent request still answers to the original step.
        let sequence = io.sequence_of("10.0.0.9:7000");
        cluster.on_reply(&mut io, &mut handler, sequence, "10.0.0.9:7000", RespValue::bulk("bar"));
        assert_eq!(handler.responses, [(9, RespValue::bulk("bar"))]);
    }

    #[test]
    fn test_ask_is_one_shot() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        cluster.submit(&mut io, &mut handler, 9, RespRequest::from_args(&["GET", "foo"]));
        io.sent.clear();

        let sequence = io.sequence_of("10.0.0.3:7000");
        cluster.on_reply(
            &mut io,
            &mut handler,
            sequence,
            "10.0.0.3:7000",
            RespValue::error("ASK 12182 10.0.0.9:7000"),
        );

        let commands = io.sent_commands();
        assert_eq!(
            commands,
            [
                ("10.0.0.9:7000".to_string(), "ASKING".to_string()),
                ("10.0.0.9:7000".to_string(), "GET".to_string()),
            ]
        );
        // No topology refresh on ASK.
        assert!(!commands.iter().any(|(_, cmd)| cmd == "CLUSTER"));
    }

    #[test]
    fn test_mget_split_and_reassembled_in_key_order() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        // Slots: a=15495 (.3), b=3300 (.1), c=7365 (.2) — three shards.
        cluster.submit(
            &mut io,
            &mut handler,
            21,
            RespRequest::from_args(&["MGET", "a", "b", "c"]),
        );

        let commands = io.sent_commands();
        assert_eq!(commands.len(), 3);
        assert!(commands.iter().all(|(_, cmd)| cmd == "MGET"));

        // Answer out of original key order.
        let replies = [
            ("10.0.0.1:7000", RespValue::Array(vec![RespValue::bulk("2")])),
            ("10.0.0.3:7000", RespValue::Array(vec![RespValue::bulk("1")])),
            ("10.0.0.2:7000", RespValue::Array(vec![RespValue::bulk("3")])),
        ];
        for (identify, reply) in replies.iter() {
            let sequence = io.sequence_of(identify);
            cluster.on_reply(&mut io, &mut handler, sequence, identify, reply.clone());
        }

        assert_eq!(
            handler.responses,
            [(
                21,
                RespValue::Array(vec![
                    RespValue::bulk("1"),
                    RespValue::bulk("2"),
                    RespValue::bulk("3"),
                ])
            )]
        );
    }

    #[test]
    fn test_mset_split_aggregates_statuses() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        // k1=12539 (.3), k2=449 (.1): two sub-requests of two pairs.
        cluster.submit(
            &mut io,
            &mut handler,
            33,
            RespRequest::from_args(&["MSET", "k1", "v1", "k2", "v2"]),
        );

        let commands = io.sent_commands();
        assert_eq!(commands.len(), 2);
        for (_, request) in io.sent.iter() {
            assert_eq!(request.len(), 3);
        }

        for identify in ["10.0.0.3:7000", "10.0.0.1:7000"].iter() {
            let sequence = io.sequence_of(identify);
            cluster.on_reply(&mut io, &mut handler, sequence, identify, RespValue::status("OK"));
        }

        assert_eq!(
            handler.responses,
            [(
                33,
                RespValue::Array(vec![RespValue::status("OK"), RespValue::status("OK")])
            )]
        );
    }

    #[test]
    fn test_multi_key_same_slot_not_split() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        cluster.submit(
            &mut io,
            &mut handler,
            40,
            RespRequest::from_args(&["MGET", "{tag}a", "{tag}b"]),
        );

        // One slot, one shard: delivered whole and the reply passes through.
        assert_eq!(io.sent.len(), 1);
        let (identify, request) = io.sent[0].clone();
        assert_eq!(request.len(), 3);

        let sequence = io.sequence_of(&identify);
        let reply = RespValue::Array(vec![RespValue::bulk("1"), RespValue::bulk("2")]);
        cluster.on_reply(&mut io, &mut handler, sequence, &identify, reply.clone());

        assert_eq!(handler.responses, [(40, reply)]);
    }

    #[test]
    fn test_pipeline_replies_delivered_in_submission_order() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        let steps: Vec<StepSeq> = (100..200).collect();
        for &step in steps.iter() {
            cluster.submit(
                &mut io,
                &mut handler,
                step,
                RespRequest::from_args(&["GET", "foo"]),
            );
        }

        let sequence = io.sequence_of("10.0.0.3:7000");
        for index in 0..steps.len() {
            cluster.on_reply(
                &mut io,
                &mut handler,
                sequence,
                "10.0.0.3:7000",
                RespValue::bulk(format!("value-{}", index)),
            );
        }

        let delivered: Vec<StepSeq> = handler.responses.iter().map(|(step, _)| *step).collect();
        assert_eq!(delivered, steps);
    }

    #[test]
    fn test_submit_before_topology_queues_until_discovery() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = router();

        cluster.submit(&mut io, &mut handler, 5, RespRequest::from_args(&["GET", "foo"]));

        // Nothing routed yet: only a discovery round against the seed.
        assert_eq!(io.sent_commands(), [("10.0.0.1:7000".to_string(), "CLUSTER".to_string())]);

        let sequence = io.sequence_of("10.0.0.1:7000");
        cluster.on_reply(&mut io, &mut handler, sequence, "10.0.0.1:7000", topology_reply());

        // The waiting list drained and the GET went out.
        assert!(io
            .sent_commands()
            .contains(&("10.0.0.3:7000".to_string(), "GET".to_string())));
    }

    #[test]
    fn test_seed_rotation_advances_once_per_attempt() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = router();

        cluster.emit(&mut io, &mut handler);
        cluster.send_cluster_slots(&mut io, &mut handler);
        cluster.send_cluster_slots(&mut io, &mut handler);

        let targets: Vec<String> = io.sent.iter().map(|(identify, _)| identify.clone()).collect();
        assert_eq!(targets, ["10.0.0.1:7000", "10.0.0.2:7000", "10.0.0.1:7000"]);
    }

    #[test]
    fn test_readonly_handshake_before_follower_read() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);
        cluster.config.enable_readonly = true;

        // "bar" is slot 5061, owned by 10.0.0.1 with follower 10.0.1.1.
        cluster.submit(&mut io, &mut handler, 8, RespRequest::from_args(&["GET", "bar"]));

        assert_eq!(
            io.sent_commands(),
            [
                ("10.0.1.1:7000".to_string(), "READONLY".to_string()),
                ("10.0.1.1:7000".to_string(), "GET".to_string()),
            ]
        );
    }

    #[test]
    fn test_failed_follower_falls_back_to_master() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);
        cluster.config.enable_readonly = true;
        cluster.failed_nodes.insert("10.0.1.1:7000".to_string(), ());

        cluster.submit(&mut io, &mut handler, 8, RespRequest::from_args(&["GET", "bar"]));

        assert_eq!(io.sent_commands(), [("10.0.0.1:7000".to_string(), "GET".to_string())]);
    }

    #[test]
    fn test_writes_always_use_master() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);
        cluster.config.enable_readonly = true;

        cluster.submit(
            &mut io,
            &mut handler,
            8,
            RespRequest::from_args(&["SET", "bar", "v"]),
        );

        assert_eq!(io.sent_commands(), [("10.0.0.1:7000".to_string(), "SET".to_string())]);
    }

    #[test]
    fn test_noauth_triggers_auth_and_replay() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);
        cluster.config.auth_password = Some("hunter2".to_string());

        cluster.submit(&mut io, &mut handler, 11, RespRequest::from_args(&["GET", "foo"]));
        io.sent.clear();

        let sequence = io.sequence_of("10.0.0.3:7000");
        cluster.on_reply(
            &mut io,
            &mut handler,
            sequence,
            "10.0.0.3:7000",
            RespValue::error("NOAUTH Authentication required."),
        );

        let commands = io.sent_commands();
        assert_eq!(
            commands,
            [
                ("10.0.0.3:7000".to_string(), "AUTH".to_string()),
                ("10.0.0.3:7000".to_string(), "GET".to_string()),
            ]
        );
        assert_eq!(io.sent[0].1.parts[1].bytes, b"hunter2");
        // Recovered internally, nothing surfaced.
        assert!(handler.errors.is_empty());
    }

    #[test]
    fn test_auth_prefers_registry_credentials() {
        let mut io = MockIo::new();
        io.auth = Some(AuthRecord {
            auth: "default".to_string(),
            password: "from-registry".to_string(),
        });
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);
        cluster.config.auth_password = Some("from-config".to_string());

        cluster.auth(&mut io, &mut handler, "10.0.0.3:7000", None);

        assert_eq!(io.sent[0].1.parts[1].bytes, b"from-registry");
    }

    #[test]
    fn test_crossslot_surfaces_error_and_refreshes() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        cluster.submit(&mut io, &mut handler, 13, RespRequest::from_args(&["GET", "foo"]));
        io.sent.clear();

        let sequence = io.sequence_of("10.0.0.3:7000");
        cluster.on_reply(
            &mut io,
            &mut handler,
            sequence,
            "10.0.0.3:7000",
            RespValue::error("CROSSSLOT Keys in request don't hash to the same slot"),
        );

        assert!(io.sent_commands().iter().any(|(_, cmd)| cmd == "CLUSTER"));
        assert_eq!(handler.errors.len(), 1);
        assert_eq!(handler.errors[0].0, 13);
        assert_eq!(handler.errors[0].1.kind, StepErrorKind::CrossSlot);
    }

    #[test]
    fn test_server_error_forwarded_verbatim() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        cluster.submit(&mut io, &mut handler, 14, RespRequest::from_args(&["GET", "foo"]));
        let sequence = io.sequence_of("10.0.0.3:7000");
        let error = RespValue::error("WRONGTYPE Operation against a key holding the wrong kind of value");
        cluster.on_reply(&mut io, &mut handler, sequence, "10.0.0.3:7000", error.clone());

        assert_eq!(handler.responses, [(14, error)]);
    }

    #[test]
    fn test_death_connection_closes_and_errors_step() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        // Requests were queued moments ago but nothing has been received
        // for longer than the step timeout.
        io.stamps.insert(
            "10.0.0.3:7000".to_string(),
            (1000.0, 900.0, 999.5),
        );

        cluster.submit(&mut io, &mut handler, 17, RespRequest::from_args(&["GET", "foo"]));

        assert_eq!(handler.errors.len(), 1);
        assert_eq!(handler.errors[0].0, 17);
        assert_eq!(handler.errors[0].1.kind, StepErrorKind::DeathConnection);
        assert_eq!(io.discarded.len(), 1);
        // The correlation entry did not survive.
        assert!(cluster
            .pipeline_requests
            .get("10.0.0.3:7000")
            .map(|queue| queue.is_empty())
            .unwrap_or(true));
    }

    #[test]
    fn test_channel_error_fails_all_inflight_steps() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        for step in [51, 52, 53].iter() {
            cluster.submit(
                &mut io,
                &mut handler,
                *step,
                RespRequest::from_args(&["GET", "foo"]),
            );
        }

        let sequence = io.sequence_of("10.0.0.3:7000");
        cluster.on_channel_error(
            &mut io,
            &mut handler,
            sequence,
            "10.0.0.3:7000",
            StepError::new(StepErrorKind::Transport, "connection reset"),
        );

        let failed: Vec<StepSeq> = handler.errors.iter().map(|(step, _)| *step).collect();
        assert_eq!(failed, [51, 52, 53]);
        assert!(cluster.failed_nodes.contains_key("10.0.0.3:7000"));
    }

    #[test]
    fn test_health_check_pings_failed_and_prunes_unknown() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        cluster.failed_nodes.insert("10.0.0.3:7000".to_string(), ());
        cluster.failed_nodes.insert("10.9.9.9:7000".to_string(), ());

        cluster.health_check_at(&mut io, &mut handler, 2000.0);

        let commands = io.sent_commands();
        // Refresh because the failed set is non-empty, then one ping for
        // the endpoint that is still part of the topology.
        assert!(commands.iter().any(|(_, cmd)| cmd == "CLUSTER"));
        assert!(commands
            .iter()
            .any(|(identify, cmd)| cmd == "PING" && identify == "10.0.0.3:7000"));
        assert!(!commands.iter().any(|(identify, _)| identify == "10.9.9.9:7000"));
        assert!(!cluster.failed_nodes.contains_key("10.9.9.9:7000"));
    }

    #[test]
    fn test_ping_reply_recovers_failed_node() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        cluster.failed_nodes.insert("10.0.0.3:7000".to_string(), ());
        cluster.send_ping(&mut io, &mut handler, "10.0.0.3:7000");

        let sequence = io.sequence_of("10.0.0.3:7000");
        cluster.on_reply(&mut io, &mut handler, sequence, "10.0.0.3:7000", RespValue::status("PONG"));

        assert!(!cluster.failed_nodes.contains_key("10.0.0.3:7000"));
    }

    #[test]
    fn test_health_check_respects_min_interval() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);
        cluster.failed_nodes.insert("10.0.0.3:7000".to_string(), ());

        cluster.health_check_at(&mut io, &mut handler, 2000.0);
        let first_round = io.sent.len();
        cluster.health_check_at(&mut io, &mut handler, 2001.0);

        assert_eq!(io.sent.len(), first_round);
    }

    #[test]
    fn test_timeout_purges_aggregation_and_drops_late_reply() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        cluster.submit(
            &mut io,
            &mut handler,
            61,
            RespRequest::from_args(&["MGET", "a", "b", "c"]),
        );
        assert!(cluster.emit_num.contains_key(&61));

        // Force the registration into the past and run the GC.
        let steps: Vec<StepSeq> = cluster.timeout_steps.values().flatten().copied().collect();
        cluster.timeout_steps.clear();
        cluster.timeout_steps.insert(100, steps);
        cluster.health_check_at(&mut io, &mut handler, 2000.0);

        assert!(!cluster.emit_num.contains_key(&61));
        assert!(!cluster.replies.contains_key(&61));

        // A straggler reply is dropped without reaching the builder.
        let sequence = io.sequence_of("10.0.0.3:7000");
        cluster.on_reply(
            &mut io,
            &mut handler,
            sequence,
            "10.0.0.3:7000",
            RespValue::Array(vec![RespValue::bulk("1")]),
        );
        assert!(handler.responses.is_empty());
    }

    #[test]
    fn test_unknown_sequence_reply_is_dropped() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        cluster.on_reply(&mut io, &mut handler, 999, "10.0.0.3:7000", RespValue::status("OK"));

        assert!(handler.responses.is_empty());
        assert!(handler.errors.is_empty());
    }

    #[test]
    fn test_invalid_command_rejected() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        cluster.submit(
            &mut io,
            &mut handler,
            71,
            RespRequest::from_args(&["SUBSCRIBE", "chan"]),
        );

        assert!(io.sent.is_empty());
        assert_eq!(handler.errors[0].0, 71);
        assert_eq!(handler.errors[0].1.kind, StepErrorKind::InvalidCommand);
    }

    #[test]
    fn test_send_failure_marks_node_failed() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);
        io.refuse.insert("10.0.0.3:7000".to_string());

        cluster.submit(&mut io, &mut handler, 81, RespRequest::from_args(&["GET", "foo"]));

        assert!(cluster.failed_nodes.contains_key("10.0.0.3:7000"));
        assert_eq!(handler.errors[0].0, 81);
        assert_eq!(handler.errors[0].1.kind, StepErrorKind::Transport);
    }

    #[test]
    fn test_multi_key_partial_error_fills_positions() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = routed(&mut io, &mut handler);

        cluster.submit(
            &mut io,
            &mut handler,
            91,
            RespRequest::from_args(&["MGET", "a", "b", "c"]),
        );

        // One shard answers, one errors out, one answers.
        let a_seq = io.sequence_of("10.0.0.3:7000");
        cluster.on_reply(
            &mut io,
            &mut handler,
            a_seq,
            "10.0.0.3:7000",
            RespValue::Array(vec![RespValue::bulk("1")]),
        );
        let b_seq = io.sequence_of("10.0.0.1:7000");
        cluster.on_reply(
            &mut io,
            &mut handler,
            b_seq,
            "10.0.0.1:7000",
            RespValue::error("LOADING server is loading"),
        );
        let c_seq = io.sequence_of("10.0.0.2:7000");
        cluster.on_reply(
            &mut io,
            &mut handler,
            c_seq,
            "10.0.0.2:7000",
            RespValue::Array(vec![RespValue::bulk("3")]),
        );

        assert_eq!(
            handler.responses,
            [(
                91,
                RespValue::Array(vec![
                    RespValue::bulk("1"),
                    RespValue::error("LOADING server is loading"),
                    RespValue::bulk("3"),
                ])
            )]
        );
    }

    #[test]
    fn test_channel_options_seeded_for_new_endpoints() {
        let mut io = MockIo::new();
        let mut handler = MockHandler::default();
        let mut cluster = router();
        cluster.config.with_ssl = true;

        cluster.emit(&mut io, &mut handler);

        let option = io.options.get("10.0.0.1:7000").unwrap();
        assert!(option.with_ssl);
        assert!(option.pipeline);
        assert_eq!(option.keep_alive, 7.0);
    }
}
