//! The worker loop: pumps the reactor and feeds cluster-bound events into
//! the router. Everything the router does not own (downstream requests,
//! relay frames, accept notices) is handed back to the caller.

use crate::cluster::{RedisCluster, StepError, StepErrorKind, StepHandler};
use crate::net::codec::Frame;
use crate::net::reactor::{Event, Reactor};
use photon::shared::NetworkResult;
use std::time::Duration;

pub struct Worker<H: StepHandler> {
    reactor: Reactor,
    cluster: Option<RedisCluster>,
    handler: H,
}

impl<H: StepHandler> Worker<H> {
    pub fn new(reactor: Reactor, handler: H) -> Worker<H> {
        Worker {
            reactor,
            cluster: None,
            handler,
        }
    }

    pub fn with_cluster(mut self, cluster: RedisCluster) -> Worker<H> {
        self.cluster = Some(cluster);
        self
    }

    #[inline]
    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    #[inline]
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    #[inline]
    pub fn cluster_mut(&mut self) -> Option<&mut RedisCluster> {
        self.cluster.as_mut()
    }

    /// Kicks off cluster topology discovery.
    pub fn start_cluster(&mut self) {
        if let Some(cluster) = self.cluster.as_mut() {
            cluster.emit(&mut self.reactor, &mut self.handler);
        }
    }

    /// One reactor turn. Cluster traffic is consumed; everything else is
    /// returned for the caller to act on.
    pub fn run_once(&mut self, timeout: Duration) -> NetworkResult<Vec<Event>> {
        let events = self.reactor.poll_once(timeout)?;
        let mut leftover = Vec::new();

        for event in events {
            match event {
                Event::Frame {
                    sequence,
                    identify: Some(identify),
                    frame: Frame::Resp(value),
                    ..
                } if self.cluster.is_some() => {
                    let cluster = self.cluster.as_mut().expect("Cluster checked above");
                    cluster.on_reply(
                        &mut self.reactor,
                        &mut self.handler,
                        sequence,
                        &identify.to_string(),
                        value,
                    );
                }
                Event::ChannelClosed {
                    sequence,
                    identify: Some(identify),
                    is_client: true,
                    error,
                    ..
                } if self.cluster.is_some() => {
                    let cluster = self.cluster.as_mut().expect("Cluster checked above");
                    let error = match error {
                        Some((kind, message)) => StepError::new(
                            StepErrorKind::Transport,
                            format!("{} ({:?})", message, kind),
                        ),
                        None => StepError::new(StepErrorKind::Transport, "connection closed"),
                    };
                    cluster.on_channel_error(
                        &mut self.reactor,
                        &mut self.handler,
                        sequence,
                        &identify.to_string(),
                        error,
                    );
                }
                Event::KeepaliveDue {
                    identify: Some(identify),
                    ..
                } if self.cluster.is_some() => {
                    let cluster = self.cluster.as_mut().expect("Cluster checked above");
                    cluster.ping_channel(
                        &mut self.reactor,
                        &mut self.handler,
                        &identify.to_string(),
                    );
                }
                Event::Periodic => {
                    if let Some(cluster) = self.cluster.as_mut() {
                        cluster.health_check(&mut self.reactor, &mut self.handler);
                    }
                    leftover.push(Event::Periodic);
                }
                other => leftover.push(other),
            }
        }

        Ok(leftover)
    }
}
