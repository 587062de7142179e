//! Backup storage: eviction-aware replication buffer for separated stores.
//!
//! Every entry a separated store owns is copied to exactly one remote peer,
//! chosen round-robin and sticky per key. When the owner detaches, the peer
//! holding the copy extracts it and restores ownership locally. Save, delete
//! and evict travel as notifications on the `backup-storage` protocol; only
//! the rejoin reconciliation `backup-get` is a correlated request.

use crate::error::Result;
use crate::grid::batcher::{chunk_entries, chunk_keys};
use crate::grid::endpoint::{Destination, StorageEndpoint};
use crate::grid::message::{GridMessage, MessageKind};
use crate::types::{EndpointId, PeerEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Counters exposed by a backup storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupMetrics {
    /// Entries this peer holds on behalf of other owners.
    pub stored_entries: usize,

    /// Own entries currently assigned to a remote holder.
    pub saved_entries: usize,
}

struct BackupState<K, V> {
    /// Where each of our keys is backed up.
    saved: HashMap<K, EndpointId>,

    /// Entries held on behalf of each remote owner.
    stored: HashMap<EndpointId, HashMap<K, V>>,

    /// Round-robin cursor over the live peer list.
    cursor: usize,
}

/// Replication buffer bound to one separated storage.
pub struct BackupStorage<K, V> {
    endpoint: Arc<StorageEndpoint<K, V>>,
    state: Mutex<BackupState<K, V>>,
}

impl<K, V> BackupStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(endpoint: Arc<StorageEndpoint<K, V>>) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            state: Mutex::new(BackupState {
                saved: HashMap::new(),
                stored: HashMap::new(),
                cursor: 0,
            }),
        })
    }

    /// Place each entry on one remote peer, keeping the previous holder for
    /// keys already backed up. Entries are silently skipped while no remote
    /// peer exists.
    pub fn save(&self, entries: HashMap<K, V>) {
        if entries.is_empty() {
            return;
        }
        let mut peers: Vec<EndpointId> =
            self.endpoint.remote_endpoint_ids().into_iter().collect();
        if peers.is_empty() {
            debug!(
                storage = %self.endpoint.storage_id(),
                "no remote peers, skipping backup save"
            );
            return;
        }
        peers.sort();

        let mut grouped: HashMap<EndpointId, HashMap<K, V>> = HashMap::new();
        {
            let mut state = self.state.lock();
            for (key, value) in entries {
                let previous = state.saved.get(&key).copied();
                let holder = match previous {
                    Some(holder) if peers.contains(&holder) => holder,
                    _ => {
                        let holder = peers[state.cursor % peers.len()];
                        state.cursor = state.cursor.wrapping_add(1);
                        holder
                    }
                };
                state.saved.insert(key.clone(), holder);
                grouped.entry(holder).or_default().insert(key, value);
            }
        }

        let batch_size = self.endpoint.config().entry_batch_size();
        for (holder, batch) in grouped {
            for chunk in chunk_entries(&batch, batch_size) {
                if let Err(error) = self.endpoint.notify_entries(
                    MessageKind::BackupSaveNotification,
                    &chunk,
                    Some(holder),
                ) {
                    warn!(
                        storage = %self.endpoint.storage_id(),
                        holder = %holder,
                        %error,
                        "failed to send backup save"
                    );
                }
            }
        }
    }

    /// Remove the backup copies of `keys`.
    pub fn delete(&self, keys: HashSet<K>) {
        self.remove(keys, MessageKind::BackupDeleteNotification);
    }

    /// Evict the backup copies of `keys`.
    pub fn evict(&self, keys: HashSet<K>) {
        self.remove(keys, MessageKind::BackupEvictNotification);
    }

    fn remove(&self, keys: HashSet<K>, kind: MessageKind) {
        if keys.is_empty() {
            return;
        }
        let mut grouped: HashMap<EndpointId, HashSet<K>> = HashMap::new();
        {
            let mut state = self.state.lock();
            for key in keys {
                if let Some(holder) = state.saved.remove(&key) {
                    grouped.entry(holder).or_default().insert(key);
                }
            }
        }
        let batch_size = self.endpoint.config().max_message_keys;
        for (holder, batch) in grouped {
            for chunk in chunk_keys(&batch, batch_size) {
                if let Err(error) =
                    self.endpoint.notify_keys(kind.clone(), &chunk, Some(holder))
                {
                    warn!(
                        storage = %self.endpoint.storage_id(),
                        holder = %holder,
                        %error,
                        "failed to send backup removal"
                    );
                }
            }
        }
    }

    /// Drain every entry held on behalf of `owner`. Called when that peer
    /// detaches so the caller can restore ownership locally.
    pub fn extract(&self, owner: EndpointId) -> HashMap<K, V> {
        self.state.lock().stored.remove(&owner).unwrap_or_default()
    }

    /// Fetch the entries remote peers hold on behalf of this endpoint; used
    /// to reconcile after a rejoin.
    pub async fn fetch_remote_backups(&self) -> Result<HashMap<K, V>> {
        let responses = self
            .endpoint
            .request(
                MessageKind::BackupGetRequest,
                Vec::new(),
                Vec::new(),
                Destination::Broadcast,
            )
            .await?;
        Ok(self.endpoint.merge_entry_responses(&responses))
    }

    /// Current backup counters.
    pub fn metrics(&self) -> BackupMetrics {
        let state = self.state.lock();
        BackupMetrics {
            stored_entries: state.stored.values().map(HashMap::len).sum(),
            saved_entries: state.saved.len(),
        }
    }

    /// Drop all local backup bookkeeping.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.saved.clear();
        state.stored.clear();
        state.cursor = 0;
    }

    pub(crate) fn close(&self) {
        self.endpoint.close();
    }

    pub(crate) fn spawn_dispatch(self: Arc<Self>, rx: mpsc::UnboundedReceiver<GridMessage>) {
        let events = self.endpoint.topology().subscribe();
        tokio::spawn(self.run_dispatch(rx, events));
    }

    async fn run_dispatch(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<GridMessage>,
        mut events: broadcast::Receiver<PeerEvent>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(PeerEvent::Detached(peer)) => {
                        self.endpoint.release_waiters_for(peer);
                        // Assignments to a dead holder are void; the next
                        // save picks a live peer.
                        self.state.lock().saved.retain(|_, holder| *holder != peer);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            storage = %self.endpoint.storage_id(),
                            skipped,
                            "backup peer event stream lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    fn handle_message(&self, message: GridMessage) {
        if message.kind.is_response() {
            self.endpoint.on_response(message);
            return;
        }
        match &message.kind {
            MessageKind::BackupSaveNotification => {
                let entries = match self.endpoint.decode_entries(&message) {
                    Ok(entries) => entries,
                    Err(error) => {
                        warn!(
                            storage = %self.endpoint.storage_id(),
                            %error,
                            "dropping malformed backup save"
                        );
                        return;
                    }
                };
                let mut state = self.state.lock();
                state
                    .stored
                    .entry(message.source)
                    .or_default()
                    .extend(entries);
            }
            MessageKind::BackupDeleteNotification | MessageKind::BackupEvictNotification => {
                let keys = match self.endpoint.decode_key_set(&message) {
                    Ok(keys) => keys,
                    Err(error) => {
                        warn!(
                            storage = %self.endpoint.storage_id(),
                            %error,
                            "dropping malformed backup removal"
                        );
                        return;
                    }
                };
                let mut state = self.state.lock();
                if let Some(held) = state.stored.get_mut(&message.source) {
                    for key in keys {
                        held.remove(&key);
                    }
                }
            }
            MessageKind::BackupGetRequest => {
                let entries = self
                    .state
                    .lock()
                    .stored
                    .get(&message.source)
                    .cloned()
                    .unwrap_or_default();
                info!(
                    storage = %self.endpoint.storage_id(),
                    owner = %message.source,
                    entries = entries.len(),
                    "answering backup reconciliation request"
                );
                self.endpoint
                    .respond_entries(&message, MessageKind::BackupGetResponse, &entries);
            }
            other => {
                warn!(
                    storage = %self.endpoint.storage_id(),
                    kind = ?other,
                    "unexpected message kind on backup protocol"
                );
            }
        }
    }
}
