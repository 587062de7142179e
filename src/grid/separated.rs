//! Separated storage: every key is owned by exactly one peer.
//!
//! The first peer to insert a key owns it; later writes from anywhere in the
//! grid are routed to the owner through update requests, which cannot create
//! entries. Reads fall back to a broadcast on local miss. A backup storage
//! keeps a copy of every owned entry on one remote peer so ownership can be
//! handed over when the owner detaches.

use crate::codec::Codec;
use crate::config::StorageConfig;
use crate::error::{Error, Result, StorageError};
use crate::grid::backups::{BackupMetrics, BackupStorage};
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

/// Distributed storage where each key lives on exactly one peer.
pub struct SeparatedStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<SeparatedInner<K, V>>,
}

pub(crate) struct SeparatedInner<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    storage: Arc<dyn Storage<K, V>>,
    endpoint: Arc<StorageEndpoint<K, V>>,
    backup: Arc<BackupStorage<K, V>>,
    config: StorageConfig,
    grid: Arc<GridInner>,
    closed: AtomicBool,
}

impl<K, V> SeparatedStorage<K, V>
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
        let storage_rx = grid.register(ProtocolTag::SeparatedStorage, &config.storage_id)?;
        let backup_rx = match grid.register(ProtocolTag::BackupStorage, &config.storage_id) {
            Ok(rx) => rx,
            Err(error) => {
                grid.deregister(ProtocolTag::SeparatedStorage, &config.storage_id);
                return Err(error);
            }
        };

        let storage = storage.unwrap_or_else(|| {
            Arc::new(ConcurrentMemoryStorage::with_event_window(
                config.storage_id.clone(),
                config.max_collected_events,
                config.max_collected_time,
            ))
        });

        let endpoint = StorageEndpoint::new(
            ProtocolTag::SeparatedStorage,
            config.clone(),
            grid.bus(),
            grid.topology(),
            key_codec.clone(),
            value_codec.clone(),
        );
        // The backup buffer gets a dedicated endpoint on its own protocol
        // tag; backup traffic never rides the storage endpoint.
        let backup_endpoint = StorageEndpoint::new(
            ProtocolTag::BackupStorage,
            config.clone(),
            grid.bus(),
            grid.topology(),
            key_codec,
            value_codec,
        );
        let backup = BackupStorage::new(backup_endpoint);
        backup.clone().spawn_dispatch(backup_rx);

        let inner = Arc::new(SeparatedInner {
            storage,
            endpoint: endpoint.clone(),
            backup: backup.clone(),
            config,
            grid,
            closed: AtomicBool::new(false),
        });
        let peer_events = endpoint.topology().subscribe();
        tokio::spawn(endpoint.run_dispatch(inner.clone(), storage_rx, peer_events));
        tokio::spawn(run_backup_wiring(backup, inner.storage.events()));

        Ok(Self { inner })
    }

    /// Counters of the attached backup storage.
    pub fn backup_metrics(&self) -> BackupMetrics {
        self.inner.backup.metrics()
    }

    /// Fetch the entries remote peers hold on behalf of this endpoint; used
    /// to reconcile after a rejoin.
    pub async fn fetch_remote_backups(&self) -> Result<HashMap<K, V>> {
        self.inner.backup.fetch_remote_backups().await
    }

    /// Chunked iterator over the whole logical storage.
    pub async fn iter(&self) -> Result<BatchedIterator<'_, K, V, Self>> {
        BatchedIterator::new(self, self.inner.config.iterator_batch_size).await
    }

    fn batch_size(&self) -> usize {
        self.inner.config.entry_batch_size()
    }
}

#[async_trait]
impl<K, V> DistributedStorage<K, V> for SeparatedStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn id(&self) -> &str {
        &self.inner.config.storage_id
    }

    async fn get(&self, key: &K) -> Result<Option<V>> {
        if let Some(value) = self.inner.storage.get(key) {
            return Ok(Some(value));
        }
        let mut remote = self
            .inner
            .endpoint
            .request_get_entries(&HashSet::from([key.clone()]), Destination::Broadcast)
            .await?;
        Ok(remote.remove(key))
    }

    async fn get_all(&self, keys: HashSet<K>) -> Result<HashMap<K, V>> {
        let mut result = self.inner.storage.get_all(&keys);
        if result.len() >= keys.len() {
            return Ok(result);
        }
        let missing: HashSet<K> = keys
            .into_iter()
            .filter(|key| !result.contains_key(key))
            .collect();
        for chunk in chunk_keys(&missing, self.inner.config.max_message_keys) {
            let remote = self
                .inner
                .endpoint
                .request_get_entries(&chunk, Destination::Broadcast)
                .await?;
            result.extend(remote);
        }
        Ok(result)
    }

    async fn set(&self, key: K, value: V) -> Result<Option<V>> {
        if self.inner.storage.get(&key).is_some() {
            let old = self.inner.storage.set(key.clone(), value.clone());
            self.inner.endpoint.notify_entries(
                MessageKind::UpdateEntriesNotification,
                &HashMap::from([(key, value)]),
                None,
            )?;
            return Ok(old);
        }
        // Update requests cannot create entries on remote peers; if nobody
        // claims the key, this peer becomes its owner.
        let updated = self
            .inner
            .endpoint
            .request_update_entries(
                &HashMap::from([(key.clone(), value.clone())]),
                Destination::Broadcast,
            )
            .await?;
        if let Some(old) = updated.get(&key) {
            return Ok(Some(old.clone()));
        }
        Ok(self.inner.storage.set(key, value))
    }

    async fn set_all(&self, entries: HashMap<K, V>) -> Result<HashMap<K, V>> {
        let keys: HashSet<K> = entries.keys().cloned().collect();
        let local_old = self.inner.storage.get_all(&keys);
        let mut missing: HashSet<K> = keys
            .into_iter()
            .filter(|key| !local_old.contains_key(key))
            .collect();

        if !local_old.is_empty() {
            let local_updates: HashMap<K, V> = entries
                .iter()
                .filter(|(key, _)| local_old.contains_key(*key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            self.inner.storage.set_all(local_updates.clone());
            for chunk in chunk_entries(&local_updates, self.batch_size()) {
                self.inner.endpoint.notify_entries(
                    MessageKind::UpdateEntriesNotification,
                    &chunk,
                    None,
                )?;
            }
        }
        let mut result = local_old;
        if missing.is_empty() {
            return Ok(result);
        }

        let remaining: HashMap<K, V> = entries
            .iter()
            .filter(|(key, _)| missing.contains(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for chunk in chunk_entries(&remaining, self.batch_size()) {
            let updated = self
                .inner
                .endpoint
                .request_update_entries(&chunk, Destination::Broadcast)
                .await?;
            for key in updated.keys() {
                missing.remove(key);
            }
            result.extend(updated);
        }

        if !missing.is_empty() {
            let new_entries: HashMap<K, V> = entries
                .into_iter()
                .filter(|(key, _)| missing.contains(key))
                .collect();
            self.inner.storage.set_all(new_entries);
        }
        Ok(result)
    }

    async fn insert_all(&self, entries: HashMap<K, V>) -> Result<HashMap<K, V>> {
        if entries.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: HashSet<K> = entries.keys().cloned().collect();
        let mut result = self.inner.storage.get_all(&keys);
        let mut missing: HashSet<K> = keys
            .into_iter()
            .filter(|key| !result.contains_key(key))
            .collect();
        if missing.is_empty() {
            return Ok(result);
        }

        for chunk in chunk_keys(&missing, self.inner.config.max_message_keys) {
            let remote_existing = self
                .inner
                .endpoint
                .request_get_entries(&chunk, Destination::Broadcast)
                .await?;
            for key in remote_existing.keys() {
                missing.remove(key);
            }
            result.extend(remote_existing);
        }
        if missing.is_empty() {
            return Ok(result);
        }

        let new_entries: HashMap<K, V> = entries
            .into_iter()
            .filter(|(key, _)| missing.contains(key))
            .collect();
        result.extend(self.inner.storage.insert_all(new_entries));
        Ok(result)
    }

    async fn delete(&self, key: &K) -> Result<bool> {
        if self.inner.storage.delete(key) {
            return Ok(true);
        }
        let deleted = self
            .inner
            .endpoint
            .request_delete_entries(&HashSet::from([key.clone()]), Destination::Broadcast)
            .await?;
        Ok(deleted.contains(key))
    }

    async fn delete_all(&self, keys: HashSet<K>) -> Result<HashSet<K>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let mut deleted = self.inner.storage.delete_all(&keys);
        if deleted.len() == keys.len() {
            return Ok(deleted);
        }
        let remaining: HashSet<K> = keys
            .into_iter()
            .filter(|key| !deleted.contains(key))
            .collect();
        for chunk in chunk_keys(&remaining, self.inner.config.max_message_keys) {
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
        self.inner.backup.close();
        self.inner.storage.close();
        self.inner
            .grid
            .deregister(ProtocolTag::SeparatedStorage, &self.inner.config.storage_id);
        self.inner
            .grid
            .deregister(ProtocolTag::BackupStorage, &self.inner.config.storage_id);
    }
}

impl<K, V> SeparatedStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn illegal(&self, operation: &'static str) -> Error {
        StorageError::IllegalOperation {
            storage_id: self.inner.config.storage_id.clone(),
            operation,
        }
        .into()
    }
}

#[async_trait]
impl<K, V> StorageHandlers<K, V> for SeparatedInner<K, V>
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
        // Only entries this peer owns are updated; the old values answer the
        // request so the originator learns who claimed which key.
        let keys: HashSet<K> = entries.keys().cloned().collect();
        let old = self.storage.get_all(&keys);
        let owned: HashMap<K, V> = entries
            .into_iter()
            .filter(|(key, _)| old.contains_key(key))
            .collect();
        if !owned.is_empty() {
            self.storage.set_all(owned);
        }
        old
    }

    async fn on_update_entries_notification(
        &self,
        entries: HashMap<K, V>,
        _source: EndpointId,
    ) {
        let keys: HashSet<K> = entries.keys().cloned().collect();
        let existing = self.storage.get_all(&keys);
        let owned: HashMap<K, V> = entries
            .into_iter()
            .filter(|(key, _)| existing.contains_key(key))
            .collect();
        if !owned.is_empty() {
            self.storage.set_all(owned);
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

    async fn on_remote_endpoint_detached(&self, peer: EndpointId) {
        let entries = self.backup.extract(peer);
        if entries.is_empty() {
            return;
        }
        info!(
            storage = %self.config.storage_id,
            owner = %peer,
            entries = entries.len(),
            "restoring entries of detached owner"
        );
        if let Err(error) = self.storage.restore_all(entries) {
            warn!(
                storage = %self.config.storage_id,
                %error,
                "failed to restore backup entries"
            );
        }
    }
}

/// Mirror local mutations into the backup storage, one event batch at a time.
async fn run_backup_wiring<K, V>(
    backup: Arc<BackupStorage<K, V>>,
    mut events: broadcast::Receiver<EventBatch<K, V>>,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        match events.recv().await {
            Ok(batch) => {
                let mut to_save = HashMap::new();
                let mut to_delete = HashSet::new();
                let mut to_evict = HashSet::new();
                let mut closing = false;
                for event in batch.iter() {
                    match event {
                        StorageEvent::Created { key, value } => {
                            to_save.insert(key.clone(), value.clone());
                        }
                        StorageEvent::Updated { key, new_value, .. } => {
                            to_save.insert(key.clone(), new_value.clone());
                        }
                        StorageEvent::Deleted { key, .. }
                        | StorageEvent::Expired { key, .. } => {
                            to_save.remove(key);
                            to_delete.insert(key.clone());
                        }
                        StorageEvent::Evicted { key, .. } => {
                            to_save.remove(key);
                            to_evict.insert(key.clone());
                        }
                        StorageEvent::Restored { .. } => {}
                        StorageEvent::Closing => closing = true,
                    }
                }
                backup.save(to_save);
                backup.delete(to_delete);
                backup.evict(to_evict);
                if closing {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "backup wiring lagged behind storage events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Builder for a [`SeparatedStorage`], obtained from
/// [`StorageGrid::separated_storage`](crate::grid::StorageGrid::separated_storage).
pub struct SeparatedStorageBuilder<K, V>
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

impl<K, V> SeparatedStorageBuilder<K, V>
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
    pub fn build(self) -> Result<SeparatedStorage<K, V>> {
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

        SeparatedStorage::create(self.grid, config, key_codec, value_codec, self.storage)
    }
}
