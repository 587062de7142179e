//! Time-limited in-memory storage.

use crate::error::{Result, StorageError};
use crate::storage::events::{EventBatch, EventPipeline, StorageEvent};
use crate::storage::{Storage, StorageEntry};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// In-memory store whose entries expire a fixed duration after their last
/// write. Expired entries are swept on access and by a background task, and
/// surface as `Expired` events.
pub struct TimeLimitedMemoryStorage<K, V> {
    inner: Arc<TimeLimitedInner<K, V>>,
}

struct TimeLimitedInner<K, V> {
    id: String,
    ttl: Duration,
    map: RwLock<HashMap<K, Timed<V>>>,
    events: EventPipeline<K, V>,
}

struct Timed<V> {
    value: V,
    expires_at: Instant,
}

impl<K, V> TimeLimitedMemoryStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a store whose entries live for `ttl` after each write.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(id: impl Into<String>, ttl: Duration) -> Self {
        Self::with_event_window(id, ttl, 100, Duration::from_millis(100))
    }

    /// Create a store with an explicit event batching window.
    pub fn with_event_window(
        id: impl Into<String>,
        ttl: Duration,
        max_collected_events: usize,
        max_collected_time: Duration,
    ) -> Self {
        let id = id.into();
        let inner = Arc::new(TimeLimitedInner {
            id: id.clone(),
            ttl,
            map: RwLock::new(HashMap::new()),
            events: EventPipeline::new(id, max_collected_events, max_collected_time),
        });

        let sweep_interval = (ttl / 4).max(Duration::from_millis(10));
        tokio::spawn(run_sweeper(Arc::downgrade(&inner), sweep_interval));

        Self { inner }
    }
}

async fn run_sweeper<K, V>(inner: Weak<TimeLimitedInner<K, V>>, interval: Duration)
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        tokio::time::sleep(interval).await;
        match inner.upgrade() {
            Some(inner) => {
                if inner.events.is_closed() {
                    return;
                }
                inner.sweep();
            }
            None => return,
        }
    }
}

impl<K, V> TimeLimitedInner<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn sweep(&self) {
        let now = Instant::now();
        let mut map = self.map.write();
        let expired_keys: Vec<K> = map
            .iter()
            .filter(|(_, timed)| timed.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired_keys {
            if let Some(timed) = map.remove(&key) {
                self.events.publish(StorageEvent::Expired {
                    key,
                    value: timed.value,
                });
            }
        }
    }

    fn timed(&self, value: V) -> Timed<V> {
        Timed {
            value,
            expires_at: Instant::now() + self.ttl,
        }
    }
}

impl<K, V> Storage<K, V> for TimeLimitedMemoryStorage<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn get(&self, key: &K) -> Option<V> {
        self.inner.sweep();
        self.inner.map.read().get(key).map(|t| t.value.clone())
    }

    fn get_all(&self, keys: &HashSet<K>) -> HashMap<K, V> {
        self.inner.sweep();
        let map = self.inner.map.read();
        keys.iter()
            .filter_map(|key| map.get(key).map(|t| (key.clone(), t.value.clone())))
            .collect()
    }

    fn set(&self, key: K, value: V) -> Option<V> {
        self.inner.sweep();
        let mut map = self.inner.map.write();
        let old = map.insert(key.clone(), self.inner.timed(value.clone()));
        match old {
            Some(timed) => {
                self.inner.events.publish(StorageEvent::Updated {
                    key,
                    old_value: timed.value.clone(),
                    new_value: value,
                });
                Some(timed.value)
            }
            None => {
                self.inner
                    .events
                    .publish(StorageEvent::Created { key, value });
                None
            }
        }
    }

    fn set_all(&self, entries: HashMap<K, V>) -> HashMap<K, V> {
        self.inner.sweep();
        let mut map = self.inner.map.write();
        let mut old_entries = HashMap::new();
        for (key, value) in entries {
            match map.insert(key.clone(), self.inner.timed(value.clone())) {
                Some(timed) => {
                    self.inner.events.publish(StorageEvent::Updated {
                        key: key.clone(),
                        old_value: timed.value.clone(),
                        new_value: value,
                    });
                    old_entries.insert(key, timed.value);
                }
                None => self
                    .inner
                    .events
                    .publish(StorageEvent::Created { key, value }),
            }
        }
        old_entries
    }

    fn insert_all(&self, entries: HashMap<K, V>) -> HashMap<K, V> {
        self.inner.sweep();
        let mut map = self.inner.map.write();
        let mut existing = HashMap::new();
        for (key, value) in entries {
            match map.get(&key) {
                Some(present) => {
                    existing.insert(key, present.value.clone());
                }
                None => {
                    map.insert(key.clone(), self.inner.timed(value.clone()));
                    self.inner
                        .events
                        .publish(StorageEvent::Created { key, value });
                }
            }
        }
        existing
    }

    fn delete(&self, key: &K) -> bool {
        self.inner.sweep();
        let mut map = self.inner.map.write();
        match map.remove(key) {
            Some(timed) => {
                self.inner.events.publish(StorageEvent::Deleted {
                    key: key.clone(),
                    value: timed.value,
                });
                true
            }
            None => false,
        }
    }

    fn delete_all(&self, keys: &HashSet<K>) -> HashSet<K> {
        self.inner.sweep();
        let mut map = self.inner.map.write();
        let mut deleted = HashSet::new();
        for key in keys {
            if let Some(timed) = map.remove(key) {
                self.inner.events.publish(StorageEvent::Deleted {
                    key: key.clone(),
                    value: timed.value,
                });
                deleted.insert(key.clone());
            }
        }
        deleted
    }

    fn evict(&self, key: &K) {
        let mut map = self.inner.map.write();
        if let Some(timed) = map.remove(key) {
            self.inner.events.publish(StorageEvent::Evicted {
                key: key.clone(),
                value: timed.value,
            });
        }
    }

    fn evict_all(&self, keys: &HashSet<K>) {
        let mut map = self.inner.map.write();
        for key in keys {
            if let Some(timed) = map.remove(key) {
                self.inner.events.publish(StorageEvent::Evicted {
                    key: key.clone(),
                    value: timed.value,
                });
            }
        }
    }

    fn restore(&self, key: K, value: V) -> Result<()> {
        self.inner.sweep();
        let mut map = self.inner.map.write();
        if map.contains_key(&key) {
            return Err(StorageError::AlreadyPresent {
                storage_id: self.inner.id.clone(),
            }
            .into());
        }
        map.insert(key.clone(), self.inner.timed(value.clone()));
        self.inner
            .events
            .publish(StorageEvent::Restored { key, value });
        Ok(())
    }

    fn restore_all(&self, entries: HashMap<K, V>) -> Result<()> {
        self.inner.sweep();
        let mut map = self.inner.map.write();
        if entries.keys().any(|key| map.contains_key(key)) {
            return Err(StorageError::AlreadyPresent {
                storage_id: self.inner.id.clone(),
            }
            .into());
        }
        for (key, value) in entries {
            map.insert(key.clone(), self.inner.timed(value.clone()));
            self.inner
                .events
                .publish(StorageEvent::Restored { key, value });
        }
        Ok(())
    }

    fn keys(&self) -> HashSet<K> {
        self.inner.sweep();
        self.inner.map.read().keys().cloned().collect()
    }

    fn size(&self) -> usize {
        self.inner.sweep();
        self.inner.map.read().len()
    }

    fn clear(&self) {
        let mut map = self.inner.map.write();
        let drained: Vec<(K, Timed<V>)> = map.drain().collect();
        for (key, timed) in drained {
            self.inner.events.publish(StorageEvent::Evicted {
                key,
                value: timed.value,
            });
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = StorageEntry<K, V>> + Send> {
        self.inner.sweep();
        let entries: Vec<StorageEntry<K, V>> = self
            .inner
            .map
            .read()
            .iter()
            .map(|(key, timed)| StorageEntry {
                key: key.clone(),
                value: timed.value.clone(),
                expires_at: Some(timed.expires_at),
            })
            .collect();
        Box::new(entries.into_iter())
    }

    fn events(&self) -> broadcast::Receiver<EventBatch<K, V>> {
        self.inner.events.subscribe()
    }

    fn close(&self) {
        self.inner.events.close();
        self.inner.map.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_entries_expire() {
        let storage: TimeLimitedMemoryStorage<String, u64> = TimeLimitedMemoryStorage::new(
            "test",
            Duration::from_millis(50),
        );
        storage.set("a".into(), 1);
        assert_eq!(storage.get(&"a".into()), Some(1));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(storage.get(&"a".into()), None);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_expiration_emits_event() {
        let storage: TimeLimitedMemoryStorage<String, u64> =
            TimeLimitedMemoryStorage::with_event_window(
                "test",
                Duration::from_millis(40),
                10,
                Duration::from_millis(20),
            );
        let mut rx = storage.events();
        storage.set("a".into(), 1);

        // First batch carries the creation.
        let created = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("created batch")
            .unwrap();
        assert!(matches!(created[0], StorageEvent::Created { .. }));

        // The sweeper turns the entry into an expired event.
        let expired = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("expired batch")
            .unwrap();
        assert!(matches!(
            expired[0],
            StorageEvent::Expired { key: _, value: 1 }
        ));
    }

    #[tokio::test]
    async fn test_write_refreshes_expiration() {
        let storage: TimeLimitedMemoryStorage<String, u64> = TimeLimitedMemoryStorage::new(
            "test",
            Duration::from_millis(100),
        );
        storage.set("a".into(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        storage.set("a".into(), 2);
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Refreshed on the second write, so still present.
        assert_eq!(storage.get(&"a".into()), Some(2));
    }
}
