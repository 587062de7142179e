//! Replicated storage: every peer holds a full copy.
//!
//! Writes are serialized through the raft leader: the caller sends a request
//! to the leader, the leader applies it locally, broadcasts the matching
//! notification to followers and answers the originator with the pre-write
//! values. A peer with no remote peers is standalone and acts as a plain
//! local store; once a leader is learned it dumps its entries into the
//! cluster.

use crate::codec::Codec;
use crate::config::StorageConfig;
use crate::error::{Error, Result, StorageError};
use crate::grid::batcher::{chunk_entries, chunk_keys};
use crate::grid::endpoint::{Destination, StorageEndpoint, StorageHandlers};
use crate::grid::iterator::BatchedIterator;
use crate::grid::message::{MessageKind, ProtocolTag};
use crate::grid::GridInner;
use crate::storage::events::{EventBatch, StorageEvent};
use crate::storage::memory::ConcurrentMemoryStorage;
use crate::storage::{DistributedStorage, Storage};
use crate::types::EndpointId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Distributed storage replicating every entry on every peer.
pub struct ReplicatedStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<ReplicatedInner<K, V>>,
}

pub(crate) struct ReplicatedInner<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    storage: Arc<dyn Storage<K, V>>,
    endpoint: Arc<StorageEndpoint<K, V>>,
    config: StorageConfig,
    grid: Arc<GridInner>,
    standalone: AtomicBool,
    closed: AtomicBool,
}

impl<K, V> ReplicatedStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn create(
        grid: Arc<GridInner>,
        config: StorageConfig,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        storage: Option<Arc<dyn Storage<K, V>>>,
    ) -> Result<Self> {
        let storage_rx = grid.register(ProtocolTag::ReplicatedStorage, &config.storage_id)?;

        let storage = storage.unwrap_or_else(|| {
            Arc::new(ConcurrentMemoryStorage::with_event_window(
                config.storage_id.clone(),
                config.max_collected_events,
                config.max_collected_time,
            ))
        });

        let endpoint = StorageEndpoint::new(
            ProtocolTag::ReplicatedStorage,
            config.clone(),
            grid.bus(),
            grid.topology(),
            key_codec,
            value_codec,
        );

        let standalone = endpoint.remote_endpoint_ids().is_empty();
        let inner = Arc::new(ReplicatedInner {
            storage,
            endpoint: endpoint.clone(),
            config,
            grid,
            standalone: AtomicBool::new(standalone),
            closed: AtomicBool::new(false),
        });
        let peer_events = endpoint.topology().subscribe();
        tokio::spawn(endpoint.run_dispatch(inner.clone(), storage_rx, peer_events));
        tokio::spawn(run_expiry_relay(inner.clone(), inner.storage.events()));

        Ok(Self { inner })
    }

    /// Whether this peer currently acts as a plain local store.
    pub fn is_standalone(&self) -> bool {
        self.inner.standalone.load(Ordering::Acquire)
    }

    /// Chunked iterator over the whole logical storage.
    pub async fn iter(&self) -> Result<BatchedIterator<'_, K, V, Self>> {
        BatchedIterator::new(self, self.inner.config.iterator_batch_size).await
    }

    fn illegal(&self, operation: &'static str) -> Error {
        StorageError::IllegalOperation {
            storage_id: self.inner.config.storage_id.clone(),
            operation,
        }
        .into()
    }
}

#[async_trait]
impl<K, V> DistributedStorage<K, V> for ReplicatedStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn id(&self) -> &str {
        &self.inner.config.storage_id
    }

    async fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.inner.storage.get(key))
    }

    async fn get_all(&self, keys: HashSet<K>) -> Result<HashMap<K, V>> {
        Ok(self.inner.storage.get_all(&keys))
    }

    async fn set(&self, key: K, value: V) -> Result<Option<V>> {
        if self.is_standalone() {
            return Ok(self.inner.storage.set(key, value));
        }
        let old = self
            .inner
            .endpoint
            .request_update_entries(&HashMap::from([(key.clone(), value)]), Destination::Leader)
            .await?;
        Ok(old.get(&key).cloned())
    }

    async fn set_all(&self, entries: HashMap<K, V>) -> Result<HashMap<K, V>> {
        if self.is_standalone() {
            return Ok(self.inner.storage.set_all(entries));
        }
        let mut result = HashMap::new();
        for chunk in chunk_entries(&entries, self.inner.config.entry_batch_size()) {
            let old = self
                .inner
                .endpoint
                .request_update_entries(&chunk, Destination::Leader)
                .await?;
            result.extend(old);
        }
        Ok(result)
    }

    async fn insert_all(&self, entries: HashMap<K, V>) -> Result<HashMap<K, V>> {
        if entries.is_empty() {
            return Ok(HashMap::new());
        }
        if self.is_standalone() {
            return Ok(self.inner.storage.insert_all(entries));
        }
        let mut result = HashMap::new();
        for chunk in chunk_entries(&entries, self.inner.config.entry_batch_size()) {
            let existing = self
                .inner
                .endpoint
                .request_insert_entries(&chunk, Destination::Leader)
                .await?;
            result.extend(existing);
        }
        Ok(result)
    }

    async fn delete(&self, key: &K) -> Result<bool> {
        if self.is_standalone() {
            return Ok(self.inner.storage.delete(key));
        }
        let deleted = self
            .inner
            .endpoint
            .request_delete_entries(&HashSet::from([key.clone()]), Destination::Leader)
            .await?;
        Ok(deleted.contains(key))
    }

    async fn delete_all(&self, keys: HashSet<K>) -> Result<HashSet<K>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        if self.is_standalone() {
            return Ok(self.inner.storage.delete_all(&keys));
        }
        let mut result = HashSet::new();
        for chunk in chunk_keys(&keys, self.inner.config.max_message_keys) {
            let deleted = self
                .inner
                .endpoint
                .request_delete_entries(&chunk, Destination::Leader)
                .await?;
            result.extend(deleted);
        }
        Ok(result)
    }

    async fn keys(&self) -> Result<HashSet<K>> {
        Ok(self.inner.storage.keys())
    }

    fn size(&self) -> usize {
        self.inner.storage.size()
    }

    fn is_empty(&self) -> bool {
        self.inner.storage.is_empty()
    }

    fn clear(&self) {
        self.inner.storage.clear();
    }

    fn evict(&self, _key: &K) -> Result<()> {
        Err(self.illegal("evict"))
    }

    fn evict_all(&self, _keys: &HashSet<K>) -> Result<()> {
        Err(self.illegal("evict"))
    }

    fn restore(&self, _key: K, _value: V) -> Result<()> {
        Err(self.illegal("restore"))
    }

    fn restore_all(&self, _entries: HashMap<K, V>) -> Result<()> {
        Err(self.illegal("restore"))
    }

    fn local_keys(&self) -> HashSet<K> {
        self.inner.storage.keys()
    }

    fn local_size(&self) -> usize {
        self.inner.storage.size()
    }

    fn local_is_empty(&self) -> bool {
        self.inner.storage.is_empty()
    }

    fn local_clear(&self) {
        self.inner.storage.clear();
    }

    fn events(&self) -> broadcast::Receiver<EventBatch<K, V>> {
        self.inner.storage.events()
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.endpoint.close();
        self.inner.storage.close();
        self.inner
            .grid
            .deregister(ProtocolTag::ReplicatedStorage, &self.inner.config.storage_id);
    }
}

#[async_trait]
impl<K, V> StorageHandlers<K, V> for ReplicatedInner<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn on_get_entries_request(&self, keys: HashSet<K>) -> HashMap<K, V> {
        self.storage.get_all(&keys)
    }

    async fn on_get_keys_request(&self) -> HashSet<K> {
        self.storage.keys()
    }

    async fn on_update_entries_request(
        &self,
        entries: HashMap<K, V>,
        _source: EndpointId,
    ) -> HashMap<K, V> {
        let old = self.storage.set_all(entries.clone());
        if let Err(error) =
            self.endpoint
                .notify_entries(MessageKind::UpdateEntriesNotification, &entries, None)
        {
            warn!(
                storage = %self.config.storage_id,
                %error,
                "failed to broadcast update notification"
            );
        }
        old
    }

    async fn on_insert_entries_request(
        &self,
        entries: HashMap<K, V>,
        _source: EndpointId,
    ) -> HashMap<K, V> {
        let existing = self.storage.insert_all(entries.clone());
        if let Err(error) =
            self.endpoint
                .notify_entries(MessageKind::InsertEntriesNotification, &entries, None)
        {
            warn!(
                storage = %self.config.storage_id,
                %error,
                "failed to broadcast insert notification"
            );
        }
        existing
    }

    async fn on_delete_entries_request(
        &self,
        keys: HashSet<K>,
        _source: EndpointId,
    ) -> HashSet<K> {
        let deleted = self.storage.delete_all(&keys);
        // The requested keys are broadcast rather than the deleted subset:
        // an expired entry is already gone on the leader yet must still be
        // removed from followers.
        if let Err(error) =
            self.endpoint
                .notify_keys(MessageKind::DeleteEntriesNotification, &keys, None)
        {
            warn!(
                storage = %self.config.storage_id,
                %error,
                "failed to broadcast delete notification"
            );
        }
        deleted
    }

    async fn on_update_entries_notification(
        &self,
        entries: HashMap<K, V>,
        _source: EndpointId,
    ) {
        if !entries.is_empty() {
            self.storage.set_all(entries);
        }
    }

    async fn on_insert_entries_notification(
        &self,
        entries: HashMap<K, V>,
        _source: EndpointId,
    ) {
        if !entries.is_empty() {
            self.storage.insert_all(entries);
        }
    }

    async fn on_delete_entries_notification(&self, keys: HashSet<K>, _source: EndpointId) {
        self.storage.delete_all(&keys);
    }

    async fn on_remote_endpoint_detached(&self, _peer: EndpointId) {
        let standalone = self.endpoint.remote_endpoint_ids().is_empty();
        self.standalone.store(standalone, Ordering::Release);
    }

    async fn on_leader_changed(&self, leader: Option<EndpointId>) {
        let Some(leader) = leader else {
            return;
        };
        if self.endpoint.remote_endpoint_ids().is_empty() {
            return;
        }
        if !self.standalone.swap(false, Ordering::AcqRel) {
            return;
        }

        // Dump everything collected while standalone into the cluster.
        let keys = self.storage.keys();
        if keys.is_empty() {
            return;
        }
        let entries = self.storage.get_all(&keys);
        let batch_size = self.config.entry_batch_size();
        info!(
            storage = %self.config.storage_id,
            entries = entries.len(),
            "dumping standalone entries into the cluster"
        );

        if leader == self.endpoint.local_endpoint_id() {
            // The leader's copy is authoritative; push it to followers.
            for chunk in chunk_entries(&entries, batch_size) {
                if let Err(error) = self.endpoint.notify_entries(
                    MessageKind::UpdateEntriesNotification,
                    &chunk,
                    None,
                ) {
                    warn!(
                        storage = %self.config.storage_id,
                        %error,
                        "failed to push standalone entries"
                    );
                }
            }
            return;
        }

        for chunk in chunk_entries(&entries, batch_size) {
            match self
                .endpoint
                .request_insert_entries(&chunk, Destination::Unicast(leader))
                .await
            {
                Ok(existing) => {
                    if !existing.is_empty() {
                        warn!(
                            storage = %self.config.storage_id,
                            conflicts = existing.len(),
                            "standalone entries already existed on the leader"
                        );
                    }
                }
                Err(error) => {
                    warn!(
                        storage = %self.config.storage_id,
                        %error,
                        "standalone dump batch failed"
                    );
                }
            }
        }
    }
}

/// Translate locally expired entries into cluster-wide deletes, leader only.
/// Followers swallow their expirations; the leader's delete notification
/// removes the entries everywhere.
async fn run_expiry_relay<K, V>(
    inner: Arc<ReplicatedInner<K, V>>,
    mut events: broadcast::Receiver<EventBatch<K, V>>,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        match events.recv().await {
            Ok(batch) => {
                let mut closing = false;
                let expired: HashSet<K> = batch
                    .iter()
                    .filter_map(|event| match event {
                        StorageEvent::Expired { key, .. } => Some(key.clone()),
                        StorageEvent::Closing => {
                            closing = true;
                            None
                        }
                        _ => None,
                    })
                    .collect();
                if !expired.is_empty() && inner.endpoint.is_leader() {
                    for chunk in chunk_keys(&expired, inner.config.max_message_keys) {
                        if let Err(error) = inner
                            .endpoint
                            .request_delete_entries(&chunk, Destination::Leader)
                            .await
                        {
                            warn!(
                                storage = %inner.config.storage_id,
                                %error,
                                "failed to relay expirations"
                            );
                        }
                    }
                }
                if closing {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "expiry relay lagged behind storage events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Builder for a [`ReplicatedStorage`], obtained from
/// [`StorageGrid::replicated_storage`](crate::grid::StorageGrid::replicated_storage).
pub struct ReplicatedStorageBuilder<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    grid: Arc<GridInner>,
    storage_id: Option<String>,
    key_codec: Option<Arc<dyn Codec<K>>>,
    value_codec: Option<Arc<dyn Codec<V>>>,
    storage: Option<Arc<dyn Storage<K, V>>>,
    request_timeout: Option<Duration>,
    max_message_keys: Option<usize>,
    max_message_values: Option<usize>,
    max_collected_events: Option<usize>,
    max_collected_time: Option<Duration>,
    iterator_batch_size: Option<usize>,
}

impl<K, V> ReplicatedStorageBuilder<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(grid: Arc<GridInner>) -> Self {
        Self {
            grid,
            storage_id: None,
            key_codec: None,
            value_codec: None,
            storage: None,
            request_timeout: None,
            max_message_keys: None,
            max_message_values: None,
            max_collected_events: None,
            max_collected_time: None,
            iterator_batch_size: None,
        }
    }

    /// Set the storage identifier. Required.
    pub fn with_storage_id(mut self, storage_id: impl Into<String>) -> Self {
        self.storage_id = Some(storage_id.into());
        self
    }

    /// Set the key codec. Required.
    pub fn with_key_codec(mut self, codec: impl Codec<K> + 'static) -> Self {
        self.key_codec = Some(Arc::new(codec));
        self
    }

    /// Set the value codec. Required.
    pub fn with_value_codec(mut self, codec: impl Codec<V> + 'static) -> Self {
        self.value_codec = Some(Arc::new(codec));
        self
    }

    /// Supply the local store; defaults to a concurrent memory storage.
    pub fn with_storage(mut self, storage: Arc<dyn Storage<K, V>>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Override the request deadline for this storage.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Override the per-message key threshold for this storage.
    pub fn with_max_message_keys(mut self, max: usize) -> Self {
        self.max_message_keys = Some(max);
        self
    }

    /// Override the per-message value threshold for this storage.
    pub fn with_max_message_values(mut self, max: usize) -> Self {
        self.max_message_values = Some(max);
        self
    }

    /// Override the event batch size threshold for this storage.
    pub fn with_max_collected_events(mut self, max: usize) -> Self {
        self.max_collected_events = Some(max);
        self
    }

    /// Override the event batch time window for this storage.
    pub fn with_max_collected_time(mut self, window: Duration) -> Self {
        self.max_collected_time = Some(window);
        self
    }

    /// Override the iteration batch size for this storage.
    pub fn with_iterator_batch_size(mut self, size: usize) -> Self {
        self.iterator_batch_size = Some(size);
        self
    }

    /// Build the storage and register it on the grid.
    pub fn build(self) -> Result<ReplicatedStorage<K, V>> {
        let storage_id = self
            .storage_id
            .ok_or_else(|| Error::Config("storage_id is required".to_string()))?;
        let key_codec = self
            .key_codec
            .ok_or_else(|| Error::Config("key codec is required".to_string()))?;
        let value_codec = self
            .value_codec
            .ok_or_else(|| Error::Config("value codec is required".to_string()))?;

        let mut config = StorageConfig::from_grid(storage_id, self.grid.config());
        if let Some(timeout) = self.request_timeout {
            config.request_timeout = timeout;
        }
        if let Some(max) = self.max_message_keys {
            config.max_message_keys = max;
        }
        if let Some(max) = self.max_message_values {
            config.max_message_values = max;
        }
        if let Some(max) = self.max_collected_events {
            config.max_collected_events = max;
        }
        if let Some(window) = self.max_collected_time {
            config.max_collected_time = window;
        }
        if let Some(size) = self.iterator_batch_size {
            config.iterator_batch_size = size;
        }

        ReplicatedStorage::create(self.grid, config, key_codec, value_codec, self.storage)
    }
}
