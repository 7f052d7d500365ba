//! Process-wide worker wiring. Workers share nothing except these bounded
//! queues and the wake handles that tell a sleeping reactor to drain them.

use crate::net::codec::RelayFrame;
use mio::net::TcpStream;
use mio::{Registration, SetReadiness};
use photon::WorkerIndex;
use std::net::SocketAddr;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

/// Depth of each worker's inbox. Pushing into a full inbox drops the
/// message; the accept path treats that as backpressure.
const QUEUE_DEPTH: usize = 4096;

/// A message crossing worker boundaries.
pub enum LaborMessage {
    /// A freshly accepted downstream connection handed over by the
    /// accept-only supervisor labor.
    Accepted { stream: TcpStream, peer: SocketAddr },
    /// An in-process relay frame from another worker.
    Relay { from: WorkerIndex, frame: RelayFrame },
}

/// The shared side: one sender and one wake handle per worker. Built once
/// the worker count is known and torn down on shutdown; every worker and
/// the supervisor hold a clone.
pub struct LaborShared {
    endpoints: Vec<LaborEndpoint>,
}

#[derive(Clone)]
struct LaborEndpoint {
    sender: SyncSender<LaborMessage>,
    wake: SetReadiness,
}

/// The receiving side, moved into exactly one worker's reactor.
pub struct LaborQueue {
    pub worker: WorkerIndex,
    pub receiver: Receiver<LaborMessage>,
    pub registration: Registration,
    pub wake: SetReadiness,
}

impl LaborShared {
    /// Builds the shared holder plus one queue per worker. The queues are
    /// handed to the workers at startup; the shared holder is cloned freely.
    pub fn new(worker_count: usize) -> (LaborShared, Vec<LaborQueue>) {
        let mut endpoints = Vec::with_capacity(worker_count);
        let mut queues = Vec::with_capacity(worker_count);

        for worker in 0..worker_count {
            let (sender, receiver) = sync_channel(QUEUE_DEPTH);
            let (registration, wake) = Registration::new2();

            endpoints.push(LaborEndpoint {
                sender,
                wake: wake.clone(),
            });
            queues.push(LaborQueue {
                worker: worker as WorkerIndex,
                receiver,
                registration,
                wake,
            });
        }

        (LaborShared { endpoints }, queues)
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Enqueues a message for `worker` and wakes its reactor. Returns false
    /// when the worker's inbox is full or gone.
    pub fn transfer(&self, worker: WorkerIndex, message: LaborMessage) -> bool {
        let endpoint = match self.endpoints.get(worker as usize) {
            Some(endpoint) => endpoint,
            None => return false,
        };

        match endpoint.sender.try_send(message) {
            Ok(()) => {
                endpoint
                    .wake
                    .set_readiness(mio::Ready::readable())
                    .is_ok()
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Wakes a worker without a message, e.g. to force a shutdown sweep.
    pub fn async_wake(&self, worker: WorkerIndex) -> bool {
        self.endpoints
            .get(worker as usize)
            .map(|endpoint| endpoint.wake.set_readiness(mio::Ready::readable()).is_ok())
            .unwrap_or(false)
    }
}

impl Clone for LaborShared {
    fn clone(&self) -> LaborShared {
        LaborShared {
            endpoints: self.endpoints.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::RelayFrame;

    #[test]
    fn test_transfer_reaches_target_queue() {
        let (shared, queues) = LaborShared::new(2);

        assert!(shared.transfer(
            1,
            LaborMessage::Relay {
                from: 0,
                frame: RelayFrame::beat(0),
            },
        ));

        match queues[1].receiver.try_recv().unwrap() {
            LaborMessage::Relay { from, frame } => {
                assert_eq!(from, 0);
                assert_eq!(frame, RelayFrame::beat(0));
            }
            _ => panic!("Unexpected message kind"),
        }
        assert!(queues[0].receiver.try_recv().is_err());
    }

    #[test]
    fn test_transfer_to_unknown_worker_fails() {
        let (shared, _queues) = LaborShared::new(1);

        assert!(!shared.transfer(
            5,
            LaborMessage::Relay {
                from: 0,
                frame: RelayFrame::beat(0),
            },
        ));
    }

    #[test]
    fn test_wake_without_message() {
        let (shared, _queues) = LaborShared::new(1);

        assert!(shared.async_wake(0));
        assert!(!shared.async_wake(3));
    }
}
