//! Concurrent in-memory storage.

use crate::error::{Result, StorageError};
use crate::storage::events::{EventBatch, EventPipeline, StorageEvent};
use crate::storage::{Storage, StorageEntry};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::broadcast;

/// Thread-safe hash-map store with event emission.
///
/// The default local store behind every distributed storage builder. Events
/// are published while the write lock is held so per-key ordering matches
/// mutation order.
pub struct ConcurrentMemoryStorage<K, V> {
    id: String,
    map: RwLock<HashMap<K, V>>,
    events: EventPipeline<K, V>,
}

impl<K, V> ConcurrentMemoryStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a store with the default event batching window.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_event_window(id, 100, Duration::from_millis(100))
    }

    /// Create a store with an explicit event batching window.
    pub fn with_event_window(
        id: impl Into<String>,
        max_collected_events: usize,
        max_collected_time: Duration,
    ) -> Self {
        let id = id.into();
        let events = EventPipeline::new(id.clone(), max_collected_events, max_collected_time);
        Self {
            id,
            map: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl<K, V> Storage<K, V> for ConcurrentMemoryStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn get(&self, key: &K) -> Option<V> {
        self.map.read().get(key).cloned()
    }

    fn get_all(&self, keys: &HashSet<K>) -> HashMap<K, V> {
        let map = self.map.read();
        keys.iter()
            .filter_map(|key| map.get(key).map(|value| (key.clone(), value.clone())))
            .collect()
    }

    fn set(&self, key: K, value: V) -> Option<V> {
        let mut map = self.map.write();
        let old = map.insert(key.clone(), value.clone());
        match &old {
            Some(old_value) => self.events.publish(StorageEvent::Updated {
                key,
                old_value: old_value.clone(),
                new_value: value,
            }),
            None => self.events.publish(StorageEvent::Created { key, value }),
        }
        old
    }

    fn set_all(&self, entries: HashMap<K, V>) -> HashMap<K, V> {
        let mut map = self.map.write();
        let mut old_entries = HashMap::new();
        for (key, value) in entries {
            match map.insert(key.clone(), value.clone()) {
                Some(old_value) => {
                    self.events.publish(StorageEvent::Updated {
                        key: key.clone(),
                        old_value: old_value.clone(),
                        new_value: value,
                    });
                    old_entries.insert(key, old_value);
                }
                None => self.events.publish(StorageEvent::Created { key, value }),
            }
        }
        old_entries
    }

    fn insert_all(&self, entries: HashMap<K, V>) -> HashMap<K, V> {
        let mut map = self.map.write();
        let mut existing = HashMap::new();
        for (key, value) in entries {
            match map.get(&key) {
                Some(present) => {
                    existing.insert(key, present.clone());
                }
                None => {
                    map.insert(key.clone(), value.clone());
                    self.events.publish(StorageEvent::Created { key, value });
                }
            }
        }
        existing
    }

    fn delete(&self, key: &K) -> bool {
        let mut map = self.map.write();
        match map.remove(key) {
            Some(value) => {
                self.events.publish(StorageEvent::Deleted {
                    key: key.clone(),
                    value,
                });
                true
            }
            None => false,
        }
    }

    fn delete_all(&self, keys: &HashSet<K>) -> HashSet<K> {
        let mut map = self.map.write();
        let mut deleted = HashSet::new();
        for key in keys {
            if let Some(value) = map.remove(key) {
                self.events.publish(StorageEvent::Deleted {
                    key: key.clone(),
                    value,
                });
                deleted.insert(key.clone());
            }
        }
        deleted
    }

    fn evict(&self, key: &K) {
        let mut map = self.map.write();
        if let Some(value) = map.remove(key) {
            self.events.publish(StorageEvent::Evicted {
                key: key.clone(),
                value,
            });
        }
    }

    fn evict_all(&self, keys: &HashSet<K>) {
        let mut map = self.map.write();
        for key in keys {
            if let Some(value) = map.remove(key) {
                self.events.publish(StorageEvent::Evicted {
                    key: key.clone(),
                    value,
                });
            }
        }
    }

    fn restore(&self, key: K, value: V) -> Result<()> {
        let mut map = self.map.write();
        if map.contains_key(&key) {
            return Err(StorageError::AlreadyPresent {
                storage_id: self.id.clone(),
            }
            .into());
        }
        map.insert(key.clone(), value.clone());
        self.events.publish(StorageEvent::Restored { key, value });
        Ok(())
    }

    fn restore_all(&self, entries: HashMap<K, V>) -> Result<()> {
        let mut map = self.map.write();
        if entries.keys().any(|key| map.contains_key(key)) {
            return Err(StorageError::AlreadyPresent {
                storage_id: self.id.clone(),
            }
            .into());
        }
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
            self.events.publish(StorageEvent::Restored { key, value });
        }
        Ok(())
    }

    fn keys(&self) -> HashSet<K> {
        self.map.read().keys().cloned().collect()
    }

    fn size(&self) -> usize {
        self.map.read().len()
    }

    fn clear(&self) {
        let mut map = self.map.write();
        for (key, value) in map.drain() {
            self.events.publish(StorageEvent::Evicted { key, value });
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = StorageEntry<K, V>> + Send> {
        let entries: Vec<StorageEntry<K, V>> = self
            .map
            .read()
            .iter()
            .map(|(key, value)| StorageEntry::new(key.clone(), value.clone()))
            .collect();
        Box::new(entries.into_iter())
    }

    fn events(&self) -> broadcast::Receiver<EventBatch<K, V>> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.events.close();
        self.map.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn store() -> ConcurrentMemoryStorage<String, u64> {
        ConcurrentMemoryStorage::with_event_window("test", 10, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let storage = store();
        assert_eq!(storage.set("a".into(), 1), None);
        assert_eq!(storage.set("a".into(), 2), Some(1));
        assert_eq!(storage.get(&"a".into()), Some(2));
        assert_eq!(storage.size(), 1);
    }

    #[tokio::test]
    async fn test_insert_all_reports_blockers() {
        let storage = store();
        storage.set("a".into(), 1);

        let existing = storage.insert_all(HashMap::from([
            ("a".to_string(), 10),
            ("b".to_string(), 20),
        ]));

        assert_eq!(existing, HashMap::from([("a".to_string(), 1)]));
        assert_eq!(storage.get(&"a".into()), Some(1));
        assert_eq!(storage.get(&"b".into()), Some(20));
    }

    #[tokio::test]
    async fn test_delete_all_returns_deleted_keys() {
        let storage = store();
        storage.set("a".into(), 1);
        storage.set("b".into(), 2);

        let deleted =
            storage.delete_all(&HashSet::from(["a".to_string(), "missing".to_string()]));

        assert_eq!(deleted, HashSet::from(["a".to_string()]));
        assert_eq!(storage.size(), 1);
    }

    #[tokio::test]
    async fn test_restore_present_key_fails() {
        let storage = store();
        storage.set("a".into(), 1);
        assert!(storage.restore("a".into(), 2).is_err());
        assert!(storage.restore("b".into(), 2).is_ok());
        assert_eq!(storage.get(&"b".into()), Some(2));
    }

    #[tokio::test]
    async fn test_events_carry_mutations() {
        let storage = store();
        let mut rx = storage.events();

        storage.set("a".into(), 1);
        storage.set("a".into(), 2);
        storage.delete(&"a".into());

        let batch = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("batch")
            .unwrap();
        assert!(matches!(batch[0], StorageEvent::Created { .. }));
        assert!(matches!(batch[1], StorageEvent::Updated { .. }));
        assert!(matches!(batch[2], StorageEvent::Deleted { .. }));
    }

    #[tokio::test]
    async fn test_clear_evicts() {
        let storage = store();
        storage.set("a".into(), 1);
        let mut rx = storage.events();
        storage.clear();

        let batch = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("batch")
            .unwrap();
        assert!(matches!(batch[0], StorageEvent::Evicted { .. }));
        assert!(storage.is_empty());
    }
}
