//! The storage grid runtime.
//!
//! A [`StorageGrid`] is one peer's membership in the grid: it owns the bus
//! subscription, the raft coordinator and the registry of local storages.
//! Inbound messages are routed by protocol tag, then by storage identifier,
//! to the endpoint that registered for them; raft traffic goes to the raft
//! actor. The grid must outlive every storage built on it.

pub mod backups;
pub mod batcher;
pub mod endpoint;
pub mod federated;
pub mod iterator;
pub mod message;
pub mod replicated;
pub mod separated;
pub mod topology;

use crate::bus::MessageBus;
use crate::config::GridConfig;
use crate::error::{Error, Result};
use crate::raft::{self, RaftHandle};
use crate::types::{EndpointId, PeerEvent, StorageId};
use dashmap::DashMap;
use federated::FederatedStorageBuilder;
use message::{GridMessage, ProtocolTag};
use replicated::ReplicatedStorageBuilder;
use separated::SeparatedStorageBuilder;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use topology::GridTopology;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One peer of the storage grid.
pub struct StorageGrid {
    inner: Arc<GridInner>,
}

pub(crate) struct GridInner {
    config: GridConfig,
    bus: Arc<dyn MessageBus>,
    topology: Arc<GridTopology>,
    raft: RaftHandle,
    registry: DashMap<(ProtocolTag, StorageId), mpsc::UnboundedSender<GridMessage>>,
    closed: AtomicBool,
}

impl GridInner {
    pub(crate) fn config(&self) -> &GridConfig {
        &self.config
    }

    pub(crate) fn bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    pub(crate) fn topology(&self) -> Arc<GridTopology> {
        self.topology.clone()
    }

    pub(crate) fn register(
        &self,
        protocol: ProtocolTag,
        storage_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<GridMessage>> {
        use dashmap::mapref::entry::Entry;
        match self.registry.entry((protocol, storage_id.to_string())) {
            Entry::Occupied(_) => Err(Error::Config(format!(
                "storage '{storage_id}' is already registered for {protocol}"
            ))),
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::unbounded_channel();
                vacant.insert(tx);
                Ok(rx)
            }
        }
    }

    pub(crate) fn deregister(&self, protocol: ProtocolTag, storage_id: &str) {
        self.registry.remove(&(protocol, storage_id.to_string()));
    }
}

impl StorageGrid {
    /// Join the grid reachable through `bus` with a fresh endpoint identity.
    ///
    /// Must be called within a Tokio runtime. The bus must outlive the grid;
    /// the grid must outlive its storages.
    pub fn new(config: GridConfig, bus: Arc<dyn MessageBus>) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let endpoint_id = Uuid::new_v4();
        let topology = Arc::new(GridTopology::new(endpoint_id));
        let raft = raft::spawn(config.raft.clone(), bus.clone(), topology.clone());

        let inner = Arc::new(GridInner {
            config,
            bus: bus.clone(),
            topology,
            raft,
            registry: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        let rx = bus.subscribe(endpoint_id);
        tokio::spawn(run_ingress(inner.clone(), rx));

        info!(endpoint = %endpoint_id, "storage grid started");
        Ok(Self { inner })
    }

    /// This peer's endpoint identifier.
    pub fn local_endpoint_id(&self) -> EndpointId {
        self.inner.topology.local_endpoint_id()
    }

    /// Snapshot of the currently known remote endpoints.
    pub fn remote_endpoint_ids(&self) -> HashSet<EndpointId> {
        self.inner.topology.remote_endpoint_ids()
    }

    /// The current raft leader, if known.
    pub fn current_leader(&self) -> Option<EndpointId> {
        self.inner.topology.current_leader()
    }

    /// Whether this peer currently leads the grid.
    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.local_endpoint_id())
    }

    /// Follow leader changes.
    pub fn leader_watch(&self) -> watch::Receiver<Option<EndpointId>> {
        self.inner.topology.leader_watch()
    }

    /// Follow join/detach/leader-change notifications.
    pub fn subscribe_peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.topology.subscribe()
    }

    /// The raft coordinator handle.
    pub fn raft(&self) -> &RaftHandle {
        &self.inner.raft
    }

    /// The grid-wide configuration.
    pub fn config(&self) -> &GridConfig {
        &self.inner.config
    }

    /// Start building a separated storage on this grid.
    pub fn separated_storage<K, V>(&self) -> SeparatedStorageBuilder<K, V>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        SeparatedStorageBuilder::new(self.inner.clone())
    }

    /// Start building a replicated storage on this grid.
    pub fn replicated_storage<K, V>(&self) -> ReplicatedStorageBuilder<K, V>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        ReplicatedStorageBuilder::new(self.inner.clone())
    }

    /// Start building a federated storage on this grid.
    pub fn federated_storage<K, V>(&self) -> FederatedStorageBuilder<K, V>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        FederatedStorageBuilder::new(self.inner.clone())
    }

    /// Leave the grid: stop raft, drop the bus subscription and release every
    /// storage registration. Storages should be closed first.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.inner.registry.is_empty() {
            warn!(
                endpoint = %self.local_endpoint_id(),
                storages = self.inner.registry.len(),
                "grid closed with storages still registered"
            );
        }
        self.inner.raft.shutdown();
        self.inner.bus.unsubscribe(self.local_endpoint_id());
        self.inner.registry.clear();
        info!(endpoint = %self.local_endpoint_id(), "storage grid closed");
    }
}

/// Route every observed bus message to its subsystem.
async fn run_ingress(inner: Arc<GridInner>, mut rx: mpsc::UnboundedReceiver<GridMessage>) {
    let local = inner.topology.local_endpoint_id();
    while let Some(message) = rx.recv().await {
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        // Own broadcasts come back from the bus; only self-addressed unicast
        // (a leader-directed request while leading) is kept.
        if message.source == local && message.destination != Some(local) {
            continue;
        }
        if let Some(destination) = message.destination {
            if destination != local {
                continue;
            }
        }

        match message.protocol {
            ProtocolTag::Raft => inner.raft.deliver(message),
            protocol => {
                let Some(storage_id) = message.storage_id.clone() else {
                    warn!(
                        endpoint = %local,
                        protocol = %protocol,
                        "storage message without storage id dropped"
                    );
                    continue;
                };
                match inner.registry.get(&(protocol, storage_id.clone())) {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => {
                        debug!(
                            endpoint = %local,
                            protocol = %protocol,
                            storage = %storage_id,
                            "message for unregistered storage dropped"
                        );
                    }
                }
            }
        }
    }
    debug!(endpoint = %local, "grid ingress stopped");
}
