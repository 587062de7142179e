//! Chunked cross-cluster iteration.

use crate::error::Result;
use crate::storage::{DistributedStorage, StorageEntry};
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Pulls the entries of a distributed storage in key batches, so iterating a
/// large logical storage never materializes it in one request.
pub struct BatchedIterator<'a, K, V, S>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: DistributedStorage<K, V>,
{
    storage: &'a S,
    keys: Vec<K>,
    position: usize,
    batch_size: usize,
    buffer: VecDeque<StorageEntry<K, V>>,
}

impl<'a, K, V, S> BatchedIterator<'a, K, V, S>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: DistributedStorage<K, V>,
{
    /// Snapshot the key set and prepare batched fetching.
    pub async fn new(storage: &'a S, batch_size: usize) -> Result<Self> {
        let keys: Vec<K> = storage.keys().await?.into_iter().collect();
        Ok(Self {
            storage,
            keys,
            position: 0,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
        })
    }

    /// The next entry, or `None` once the snapshot is exhausted. Keys deleted
    /// since the snapshot are skipped.
    pub async fn next(&mut self) -> Result<Option<StorageEntry<K, V>>> {
        while self.buffer.is_empty() && self.position < self.keys.len() {
            let end = (self.position + self.batch_size).min(self.keys.len());
            let chunk: HashSet<K> = self.keys[self.position..end].iter().cloned().collect();
            self.position = end;
            let entries = self.storage.get_all(chunk).await?;
            self.buffer
                .extend(entries.into_iter().map(|(key, value)| StorageEntry::new(key, value)));
        }
        Ok(self.buffer.pop_front())
    }

    /// Drain the remaining entries into a vector.
    pub async fn collect_remaining(mut self) -> Result<Vec<StorageEntry<K, V>>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await? {
            entries.push(entry);
        }
        Ok(entries)
    }
}
