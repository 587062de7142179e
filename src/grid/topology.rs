//! Shared view of grid membership and leadership.
//!
//! The raft actor is the only writer; endpoints and strategies read the
//! current peer set synchronously and follow changes through the leader watch
//! and the peer-event broadcast.

use crate::types::{EndpointId, PeerEvent};
use parking_lot::RwLock;
use std::collections::HashSet;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Membership and leadership state of one grid, updated by the raft actor.
pub struct GridTopology {
    local_id: EndpointId,
    remote: RwLock<HashSet<EndpointId>>,
    leader_tx: watch::Sender<Option<EndpointId>>,
    events_tx: broadcast::Sender<PeerEvent>,
}

impl GridTopology {
    /// Create the topology of a freshly started peer: no remotes, no leader.
    pub fn new(local_id: EndpointId) -> Self {
        let (leader_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(256);
        Self {
            local_id,
            remote: RwLock::new(HashSet::new()),
            leader_tx,
            events_tx,
        }
    }

    /// This peer's endpoint identifier.
    pub fn local_endpoint_id(&self) -> EndpointId {
        self.local_id
    }

    /// Snapshot of the currently known remote endpoints.
    pub fn remote_endpoint_ids(&self) -> HashSet<EndpointId> {
        self.remote.read().clone()
    }

    /// Number of currently known remote endpoints.
    pub fn remote_count(&self) -> usize {
        self.remote.read().len()
    }

    /// The current raft leader, if one is known.
    pub fn current_leader(&self) -> Option<EndpointId> {
        *self.leader_tx.borrow()
    }

    /// Follow leader changes.
    pub fn leader_watch(&self) -> watch::Receiver<Option<EndpointId>> {
        self.leader_tx.subscribe()
    }

    /// Follow join/detach/leader-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    /// Record a newly seen peer. Returns true when it was unknown.
    pub(crate) fn add_peer(&self, peer: EndpointId) -> bool {
        let added = self.remote.write().insert(peer);
        if added {
            info!(local = %self.local_id, peer = %peer, "remote endpoint joined");
            let _ = self.events_tx.send(PeerEvent::Joined(peer));
        }
        added
    }

    /// Remove a silent peer. Returns true when it was known.
    pub(crate) fn remove_peer(&self, peer: EndpointId) -> bool {
        let removed = self.remote.write().remove(&peer);
        if removed {
            info!(local = %self.local_id, peer = %peer, "remote endpoint detached");
            let _ = self.events_tx.send(PeerEvent::Detached(peer));
        }
        removed
    }

    /// Publish a leader change.
    pub(crate) fn set_leader(&self, leader: Option<EndpointId>) {
        let changed = self.leader_tx.send_if_modified(|current| {
            if *current == leader {
                return false;
            }
            *current = leader;
            true
        });
        if changed {
            info!(local = %self.local_id, leader = ?leader, "raft leader changed");
            let _ = self.events_tx.send(PeerEvent::LeaderChanged(leader));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_add_and_remove_peer() {
        let topology = GridTopology::new(Uuid::new_v4());
        let peer = Uuid::new_v4();

        assert!(topology.add_peer(peer));
        assert!(!topology.add_peer(peer));
        assert_eq!(topology.remote_count(), 1);

        assert!(topology.remove_peer(peer));
        assert!(!topology.remove_peer(peer));
        assert!(topology.remote_endpoint_ids().is_empty());
    }

    #[tokio::test]
    async fn test_events_reflect_membership() {
        let topology = GridTopology::new(Uuid::new_v4());
        let mut events = topology.subscribe();
        let peer = Uuid::new_v4();

        topology.add_peer(peer);
        topology.set_leader(Some(peer));
        topology.remove_peer(peer);

        assert_eq!(events.recv().await.unwrap(), PeerEvent::Joined(peer));
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::LeaderChanged(Some(peer))
        );
        assert_eq!(events.recv().await.unwrap(), PeerEvent::Detached(peer));
    }

    #[test]
    fn test_leader_watch_deduplicates() {
        let topology = GridTopology::new(Uuid::new_v4());
        let watch = topology.leader_watch();
        let leader = Uuid::new_v4();

        topology.set_leader(Some(leader));
        topology.set_leader(Some(leader));

        assert_eq!(*watch.borrow(), Some(leader));
    }
}
