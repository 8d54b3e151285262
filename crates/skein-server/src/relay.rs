//! Cross-worker broadcast relay.
//!
//! A worker publishes every message it appended and receives everyone else's
//! through an unbounded channel handed out at attach time. Events carry the
//! origin worker id; the driver drops its own. Publishing never re-appends:
//! the log already holds the canonical offset.

#![allow(clippy::disallowed_types, reason = "Peer list is only touched in short synchronous sections")]

use std::sync::{Arc, Mutex};

use skein_proto::BroadcastEvent;
use tokio::sync::mpsc;

use crate::error::ClusterError;

/// Publish side of the relay fabric.
pub trait Relay: Send + Sync + 'static {
    /// Hand an event to every other worker. Does not wait for delivery.
    ///
    /// # Errors
    ///
    /// - `ClusterError::Closed` if the fabric is gone
    fn publish(&self, event: BroadcastEvent) -> Result<(), ClusterError>;
}

/// Receive side of a relay attachment.
pub type RelayReceiver = mpsc::UnboundedReceiver<BroadcastEvent>;

/// In-process relay for workers that share one process.
#[derive(Clone, Default)]
pub struct LocalRelay {
    peers: Arc<Mutex<Vec<Peer>>>,
}

struct Peer {
    worker_id: u32,
    sender: mpsc::UnboundedSender<BroadcastEvent>,
}

impl LocalRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the relay as `worker_id`.
    pub fn attach(&self, worker_id: u32) -> (LocalRelayHandle, RelayReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().push(Peer { worker_id, sender });
        (LocalRelayHandle { relay: self.clone(), worker_id }, receiver)
    }

    /// Attached workers whose receiver is still alive.
    pub fn peer_count(&self) -> usize {
        let mut peers = self.lock();
        peers.retain(|peer| !peer.sender.is_closed());
        peers.len()
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Peer>> {
        self.peers.lock().expect("invariant: relay lock holders do not panic")
    }
}

/// One worker's handle on a [`LocalRelay`].
#[derive(Clone)]
pub struct LocalRelayHandle {
    relay: LocalRelay,
    worker_id: u32,
}

impl LocalRelayHandle {
    /// Worker this handle publishes for.
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }
}

impl Relay for LocalRelayHandle {
    fn publish(&self, event: BroadcastEvent) -> Result<(), ClusterError> {
        let mut peers = self.relay.lock();
        peers.retain(|peer| !peer.sender.is_closed());

        for peer in peers.iter().filter(|peer| peer.worker_id != event.origin) {
            // A receiver dropped since the retain above is a worker that is
            // shutting down.
            let _ = peer.sender.send(event.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(offset: u64, origin: u32) -> BroadcastEvent {
        BroadcastEvent { content: format!("m{offset}"), offset, origin }
    }

    #[test]
    fn events_reach_other_workers_only() {
        let relay = LocalRelay::new();
        let (a, mut a_rx) = relay.attach(1);
        let (_b, mut b_rx) = relay.attach(2);

        a.publish(event(1, 1)).unwrap();

        assert_eq!(b_rx.try_recv().unwrap(), event(1, 1));
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn publish_order_is_preserved() {
        let relay = LocalRelay::new();
        let (a, _a_rx) = relay.attach(1);
        let (_b, mut b_rx) = relay.attach(2);

        for offset in 1..=5 {
            a.publish(event(offset, 1)).unwrap();
        }

        let received: Vec<u64> = std::iter::from_fn(|| b_rx.try_recv().ok()).map(|e| e.offset).collect();
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn detached_workers_are_pruned() {
        let relay = LocalRelay::new();
        let (a, _a_rx) = relay.attach(1);
        let (_b, b_rx) = relay.attach(2);
        drop(b_rx);

        a.publish(event(1, 1)).unwrap();
        assert_eq!(relay.peer_count(), 1);
    }
}
