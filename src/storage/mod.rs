//! Local store contract and the distributed storage surface.
//!
//! A [`Storage`] is the thread-safe, in-process map a distribution strategy
//! sits on top of. The grid mutates it both through the public API and from
//! inbound message handlers. [`DistributedStorage`] is the cluster-facing
//! surface shared by the three strategies.

pub mod events;
pub mod memory;
pub mod time_limited;

use crate::error::Result;
use async_trait::async_trait;
use events::EventBatch;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Instant;
use tokio::sync::broadcast;

/// One entry of a store, with its optional expiration instant.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageEntry<K, V> {
    pub key: K,
    pub value: V,
    pub expires_at: Option<Instant>,
}

impl<K, V> StorageEntry<K, V> {
    /// Create an entry without an expiration.
    pub fn new(key: K, value: V) -> Self {
        Self {
            key,
            value,
            expires_at: None,
        }
    }
}

/// The local store contract consumed by the distribution strategies.
///
/// Implementations must be thread-safe: the public API and the grid's inbound
/// handlers mutate the store concurrently. All mutations emit events through
/// the store's pipeline, in per-key occurrence order.
pub trait Storage<K, V>: Send + Sync
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// The store identifier.
    fn id(&self) -> &str;

    /// Get a single value.
    fn get(&self, key: &K) -> Option<V>;

    /// Get every present entry among `keys`.
    fn get_all(&self, keys: &HashSet<K>) -> HashMap<K, V>;

    /// Set a single entry, returning the previous value.
    fn set(&self, key: K, value: V) -> Option<V>;

    /// Set every entry, returning the previous values of the keys that
    /// already existed.
    fn set_all(&self, entries: HashMap<K, V>) -> HashMap<K, V>;

    /// Insert entries that are not yet present. Returns the existing entries
    /// that blocked their keys from being inserted.
    fn insert_all(&self, entries: HashMap<K, V>) -> HashMap<K, V>;

    /// Delete a single key. Returns whether it was present.
    fn delete(&self, key: &K) -> bool;

    /// Delete every listed key, returning the keys actually deleted.
    fn delete_all(&self, keys: &HashSet<K>) -> HashSet<K>;

    /// Remove a key without treating it as a logical delete.
    fn evict(&self, key: &K);

    /// Evict every listed key.
    fn evict_all(&self, keys: &HashSet<K>);

    /// Re-insert an entry handed over from a backup copy. Fails if the key is
    /// already present.
    fn restore(&self, key: K, value: V) -> Result<()>;

    /// Restore a set of entries; fails without applying anything if any key
    /// is already present.
    fn restore_all(&self, entries: HashMap<K, V>) -> Result<()>;

    /// Snapshot of the present keys.
    fn keys(&self) -> HashSet<K>;

    /// Number of entries.
    fn size(&self) -> usize;

    /// Whether the store holds no entries.
    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Evict every entry.
    fn clear(&self);

    /// Snapshot iterator over the current entries.
    fn iter(&self) -> Box<dyn Iterator<Item = StorageEntry<K, V>> + Send>;

    /// Subscribe to this store's batched event stream.
    fn events(&self) -> broadcast::Receiver<EventBatch<K, V>>;

    /// Emit the closing event and release the event pipeline.
    fn close(&self);
}

/// The cluster-facing surface shared by the separated, replicated and
/// federated strategies.
///
/// Operations that may consult remote peers are async and suspend the caller
/// until the correlated response set resolves or the request deadline passes.
/// The `local_*` variants operate on the local store only.
#[async_trait]
pub trait DistributedStorage<K, V>: Send + Sync
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// The storage identifier shared by all peers of this logical storage.
    fn id(&self) -> &str;

    /// Get a single value.
    async fn get(&self, key: &K) -> Result<Option<V>>;

    /// Get every reachable entry among `keys`.
    async fn get_all(&self, keys: HashSet<K>) -> Result<HashMap<K, V>>;

    /// Set a single entry, returning the previous value.
    async fn set(&self, key: K, value: V) -> Result<Option<V>>;

    /// Set every entry, returning the previous values of keys that existed.
    async fn set_all(&self, entries: HashMap<K, V>) -> Result<HashMap<K, V>>;

    /// Insert entries not yet present anywhere in the cluster. Returns the
    /// existing entries that blocked insertion.
    async fn insert_all(&self, entries: HashMap<K, V>) -> Result<HashMap<K, V>>;

    /// Delete a single key. Returns whether it was deleted anywhere.
    async fn delete(&self, key: &K) -> Result<bool>;

    /// Delete every listed key, returning the keys actually deleted.
    async fn delete_all(&self, keys: HashSet<K>) -> Result<HashSet<K>>;

    /// The keys of this logical storage across the cluster.
    async fn keys(&self) -> Result<HashSet<K>>;

    /// Number of locally held entries.
    fn size(&self) -> usize;

    /// Whether the local store holds no entries.
    fn is_empty(&self) -> bool;

    /// Clear the local store.
    fn clear(&self);

    /// Evicting through the distributed surface is an illegal operation;
    /// eviction is an internal transition reserved for backup handoff.
    fn evict(&self, key: &K) -> Result<()>;

    /// See [`DistributedStorage::evict`].
    fn evict_all(&self, keys: &HashSet<K>) -> Result<()>;

    /// Restoring through the distributed surface is an illegal operation;
    /// restore is an internal transition reserved for backup handoff.
    fn restore(&self, key: K, value: V) -> Result<()>;

    /// See [`DistributedStorage::restore`].
    fn restore_all(&self, entries: HashMap<K, V>) -> Result<()>;

    /// Keys held by the local store.
    fn local_keys(&self) -> HashSet<K>;

    /// Number of locally held entries.
    fn local_size(&self) -> usize;

    /// Whether the local store is empty.
    fn local_is_empty(&self) -> bool;

    /// Clear the local store.
    fn local_clear(&self);

    /// Subscribe to the local store's batched event stream.
    fn events(&self) -> broadcast::Receiver<EventBatch<K, V>>;

    /// Close the storage: dispose subscriptions, cancel outstanding requests
    /// and clear the local store.
    fn close(&self);
}
