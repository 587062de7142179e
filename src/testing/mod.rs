//! Testing utilities for the storage grid.
//!
//! [`SimulatedBus`] is an in-process [`MessageBus`] connecting any number of
//! grids inside one test, with directed message drops, full partitions and a
//! published-message log for asserting wire behavior. The helpers below poll
//! cluster state with a deadline instead of sleeping fixed amounts.

mod backup_tests;
mod federated_tests;
mod raft_tests;
mod replicated_tests;
mod separated_tests;

use crate::bus::MessageBus;
use crate::config::{GridConfig, RaftConfig};
use crate::grid::message::GridMessage;
use crate::grid::StorageGrid;
use crate::types::EndpointId;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// In-process message bus with failure injection.
///
/// Every published message is delivered to every subscriber (including the
/// publisher, whose grid filters its own broadcasts) unless a drop rule or
/// isolation applies. Self-delivery is never blocked so leader-directed
/// requests keep working on the leader itself.
pub struct SimulatedBus {
    subscribers: RwLock<HashMap<EndpointId, mpsc::UnboundedSender<GridMessage>>>,
    blocked: RwLock<HashSet<(EndpointId, EndpointId)>>,
    isolated: RwLock<HashSet<EndpointId>>,
    log: Mutex<Vec<GridMessage>>,
}

impl SimulatedBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashSet::new()),
            isolated: RwLock::new(HashSet::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Drop every message from `from` to `to` (one direction).
    pub fn block(&self, from: EndpointId, to: EndpointId) {
        self.blocked.write().insert((from, to));
    }

    /// Remove a directed drop rule.
    pub fn unblock(&self, from: EndpointId, to: EndpointId) {
        self.blocked.write().remove(&(from, to));
    }

    /// Cut an endpoint off from every other endpoint, both directions.
    pub fn isolate(&self, endpoint: EndpointId) {
        self.isolated.write().insert(endpoint);
    }

    /// Reconnect a previously isolated endpoint.
    pub fn rejoin(&self, endpoint: EndpointId) {
        self.isolated.write().remove(&endpoint);
    }

    /// Drop all partitions and drop rules.
    pub fn heal(&self) {
        self.blocked.write().clear();
        self.isolated.write().clear();
    }

    /// Snapshot of every message published so far.
    pub fn published(&self) -> Vec<GridMessage> {
        self.log.lock().clone()
    }

    /// Count published messages matching a predicate.
    pub fn count_published(&self, predicate: impl Fn(&GridMessage) -> bool) -> usize {
        self.log.lock().iter().filter(|m| predicate(m)).count()
    }

    /// Forget the message log, keeping subscriptions and drop rules.
    pub fn clear_log(&self) {
        self.log.lock().clear();
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for SimulatedBus {
    fn publish(&self, message: GridMessage) {
        self.log.lock().push(message.clone());
        let subscribers = self.subscribers.read();
        let blocked = self.blocked.read();
        let isolated = self.isolated.read();
        for (subscriber, tx) in subscribers.iter() {
            let crosses_isolation = message.source != *subscriber
                && (isolated.contains(&message.source) || isolated.contains(subscriber));
            if crosses_isolation || blocked.contains(&(message.source, *subscriber)) {
                continue;
            }
            let _ = tx.send(message.clone());
        }
    }

    fn subscribe(&self, endpoint: EndpointId) -> mpsc::UnboundedReceiver<GridMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().insert(endpoint, tx);
        rx
    }

    fn unsubscribe(&self, endpoint: EndpointId) {
        self.subscribers.write().remove(&endpoint);
    }
}

/// Install a fmt subscriber honoring `RUST_LOG` for test output. Safe to
/// call from every test; only the first call wins.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Grid configuration with timings tightened for in-process tests.
pub fn test_grid_config() -> GridConfig {
    #[cfg(test)]
    init_test_logging();
    GridConfig::default()
        .with_request_timeout(Duration::from_secs(1))
        .with_max_collected_events(100)
        .with_max_collected_time(Duration::from_millis(40))
        .with_raft_config(
            RaftConfig::default()
                .with_heartbeat_interval(Duration::from_millis(30))
                .with_min_election_timeout(Duration::from_millis(150))
                .with_peer_timeout(Duration::from_millis(400)),
        )
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Wait until every grid agrees on the same, existing leader.
pub async fn wait_for_leader(grids: &[&StorageGrid], timeout: Duration) -> Option<EndpointId> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let leaders: HashSet<Option<EndpointId>> =
            grids.iter().map(|grid| grid.current_leader()).collect();
        if leaders.len() == 1 {
            if let Some(Some(leader)) = leaders.into_iter().next() {
                if grids.iter().any(|grid| grid.local_endpoint_id() == leader) {
                    return Some(leader);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

/// Wait until every grid has discovered all the others.
pub async fn wait_for_full_mesh(grids: &[&StorageGrid], timeout: Duration) -> bool {
    let expected = grids.len() - 1;
    wait_for(
        || {
            grids
                .iter()
                .all(|grid| grid.remote_endpoint_ids().len() == expected)
        },
        timeout,
    )
    .await
}
