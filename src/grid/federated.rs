//! Federated storage: partial copies reconciled by a merge operator.
//!
//! Each peer folds every `set` it observes into its local value with the
//! configured merge operator: its own calls directly, remote calls through
//! update notifications carrying the caller's contribution. Local values
//! converge to the merge-reduction of all observed contributions, in
//! observation order; the outcome is permutation-invariant exactly when the
//! operator is commutative and associative. Reads broadcast and combine the
//! responses with the local value.

use crate::codec::Codec;
use crate::config::StorageConfig;
use crate::error::{Error, Result, StorageError};
use crate::grid::batcher::{chunk_entries, chunk_keys};
use crate::grid::endpoint::{Destination, StorageEndpoint, StorageHandlers};
use crate::grid::iterator::BatchedIterator;
use crate::grid::message::{MessageKind, ProtocolTag};
use crate::grid::GridInner;
use crate::storage::events::EventBatch;
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

/// Binary merge operator reconciling two values of the same key.
pub type MergeOperator<V> = Arc<dyn Fn(V, V) -> V + Send + Sync>;

/// Distributed storage where concurrent writes reconcile through a merge
/// operator.
pub struct FederatedStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<FederatedInner<K, V>>,
}

pub(crate) struct FederatedInner<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    storage: Arc<dyn Storage<K, V>>,
    endpoint: Arc<StorageEndpoint<K, V>>,
    merge: MergeOperator<V>,
    config: StorageConfig,
    grid: Arc<GridInner>,
    closed: AtomicBool,
}

impl<K, V> FederatedInner<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Fold one contribution into the local value, returning the old value.
    fn merge_in(&self, key: K, contribution: V) -> Option<V> {
        let old = self.storage.get(&key);
        let merged = match old.clone() {
            Some(present) => (self.merge)(present, contribution),
            None => contribution,
        };
        self.storage.set(key, merged);
        old
    }
}

impl<K, V> FederatedStorage<K, V>
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
        merge: MergeOperator<V>,
    ) -> Result<Self> {
        let storage_rx = grid.register(ProtocolTag::FederatedStorage, &config.storage_id)?;

        let storage = storage.unwrap_or_else(|| {
            Arc::new(ConcurrentMemoryStorage::with_event_window(
                config.storage_id.clone(),
                config.max_collected_events,
                config.max_collected_time,
            ))
        });

        let endpoint = StorageEndpoint::new(
            ProtocolTag::FederatedStorage,
            config.clone(),
            grid.bus(),
            grid.topology(),
            key_codec,
            value_codec,
        );

        let inner = Arc::new(FederatedInner {
            storage,
            endpoint: endpoint.clone(),
            merge,
            config,
            grid,
            closed: AtomicBool::new(false),
        });
        let peer_events = endpoint.topology().subscribe();
        tokio::spawn(endpoint.run_dispatch(inner.clone(), storage_rx, peer_events));

        Ok(Self { inner })
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

    /// Broadcast a read and combine the responses with the local slice,
    /// last writer wins on duplicate keys with a warning; the local value
    /// takes precedence over remote copies.
    async fn fetch_merged(&self, keys: &HashSet<K>) -> Result<HashMap<K, V>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let responses = self
            .inner
            .endpoint
            .request(
                MessageKind::GetEntriesRequest,
                self.inner.endpoint.encode_keys(keys)?,
                Vec::new(),
                Destination::Broadcast,
            )
            .await?;
        let mut result = self.inner.endpoint.merge_entry_responses(&responses);
        result.extend(self.inner.storage.get_all(keys));
        Ok(result)
    }
}

#[async_trait]
impl<K, V> DistributedStorage<K, V> for FederatedStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn id(&self) -> &str {
        &self.inner.config.storage_id
    }

    async fn get(&self, key: &K) -> Result<Option<V>> {
        let mut merged = self.fetch_merged(&HashSet::from([key.clone()])).await?;
        Ok(merged.remove(key))
    }

    async fn get_all(&self, keys: HashSet<K>) -> Result<HashMap<K, V>> {
        let mut result = HashMap::new();
        for chunk in chunk_keys(&keys, self.inner.config.max_message_keys) {
            result.extend(self.fetch_merged(&chunk).await?);
        }
        Ok(result)
    }

    async fn set(&self, key: K, value: V) -> Result<Option<V>> {
        let old = self.inner.merge_in(key.clone(), value.clone());
        // The contribution, not the merged aggregate, goes on the wire: every
        // peer folds it in with the same operator.
        self.inner.endpoint.notify_entries(
            MessageKind::UpdateEntriesNotification,
            &HashMap::from([(key, value)]),
            None,
        )?;
        Ok(old)
    }

    async fn set_all(&self, entries: HashMap<K, V>) -> Result<HashMap<K, V>> {
        let mut old_entries = HashMap::new();
        for (key, value) in &entries {
            if let Some(old) = self.inner.merge_in(key.clone(), value.clone()) {
                old_entries.insert(key.clone(), old);
            }
        }
        for chunk in chunk_entries(&entries, self.inner.config.entry_batch_size()) {
            self.inner.endpoint.notify_entries(
                MessageKind::UpdateEntriesNotification,
                &chunk,
                None,
            )?;
        }
        Ok(old_entries)
    }

    async fn insert_all(&self, entries: HashMap<K, V>) -> Result<HashMap<K, V>> {
        if entries.is_empty() {
            return Ok(HashMap::new());
        }
        let existing = self.inner.storage.insert_all(entries.clone());
        let inserted: HashMap<K, V> = entries
            .into_iter()
            .filter(|(key, _)| !existing.contains_key(key))
            .collect();
        for chunk in chunk_entries(&inserted, self.inner.config.entry_batch_size()) {
            self.inner.endpoint.notify_entries(
                MessageKind::InsertEntriesNotification,
                &chunk,
                None,
            )?;
        }
        Ok(existing)
    }

    async fn delete(&self, key: &K) -> Result<bool> {
        let local = self.inner.storage.delete(key);
        let remote = self
            .inner
            .endpoint
            .request_delete_entries(&HashSet::from([key.clone()]), Destination::Broadcast)
            .await?;
        Ok(local || remote.contains(key))
    }

    async fn delete_all(&self, keys: HashSet<K>) -> Result<HashSet<K>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let mut deleted = self.inner.storage.delete_all(&keys);
        for chunk in chunk_keys(&keys, self.inner.config.max_message_keys) {
            let remote = self
                .inner
                .endpoint
                .request_delete_entries(&chunk, Destination::Broadcast)
                .await?;
            deleted.extend(remote);
        }
        Ok(deleted)
    }

    async fn keys(&self) -> Result<HashSet<K>> {
        let mut keys = self.inner.endpoint.request_get_keys().await?;
        keys.extend(self.inner.storage.keys());
        Ok(keys)
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
            .deregister(ProtocolTag::FederatedStorage, &self.inner.config.storage_id);
    }
}

#[async_trait]
impl<K, V> StorageHandlers<K, V> for FederatedInner<K, V>
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
        let mut old_entries = HashMap::new();
        for (key, contribution) in entries {
            if let Some(old) = self.merge_in(key.clone(), contribution) {
                old_entries.insert(key, old);
            }
        }
        old_entries
    }

    async fn on_update_entries_notification(
        &self,
        entries: HashMap<K, V>,
        _source: EndpointId,
    ) {
        for (key, contribution) in entries {
            self.merge_in(key, contribution);
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

    async fn on_delete_entries_request(
        &self,
        keys: HashSet<K>,
        _source: EndpointId,
    ) -> HashSet<K> {
        self.storage.delete_all(&keys)
    }

    async fn on_delete_entries_notification(&self, keys: HashSet<K>, _source: EndpointId) {
        self.storage.delete_all(&keys);
    }
}

/// Builder for a [`FederatedStorage`], obtained from
/// [`StorageGrid::federated_storage`](crate::grid::StorageGrid::federated_storage).
///
/// Building without a merge operator is refused.
pub struct FederatedStorageBuilder<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    grid: Arc<GridInner>,
    storage_id: Option<String>,
    key_codec: Option<Arc<dyn Codec<K>>>,
    value_codec: Option<Arc<dyn Codec<V>>>,
    storage: Option<Arc<dyn Storage<K, V>>>,
    merge: Option<MergeOperator<V>>,
    request_timeout: Option<Duration>,
    max_message_keys: Option<usize>,
    max_message_values: Option<usize>,
    max_collected_events: Option<usize>,
    max_collected_time: Option<Duration>,
    iterator_batch_size: Option<usize>,
}

impl<K, V> FederatedStorageBuilder<K, V>
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
            merge: None,
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

    /// Set the merge operator. Required.
    pub fn with_merge_operator(
        mut self,
        merge: impl Fn(V, V) -> V + Send + Sync + 'static,
    ) -> Self {
        self.merge = Some(Arc::new(merge));
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
    pub fn build(self) -> Result<FederatedStorage<K, V>> {
        let storage_id = self
            .storage_id
            .ok_or_else(|| Error::Config("storage_id is required".to_string()))?;
        let key_codec = self
            .key_codec
            .ok_or_else(|| Error::Config("key codec is required".to_string()))?;
        let value_codec = self
            .value_codec
            .ok_or_else(|| Error::Config("value codec is required".to_string()))?;
        let merge = self
            .merge
            .ok_or_else(|| Error::Config("merge operator is required".to_string()))?;

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

        FederatedStorage::create(
            self.grid,
            config,
            key_codec,
            value_codec,
            self.storage,
            merge,
        )
    }
}
