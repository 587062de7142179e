//! Splitting oversized requests into message-sized chunks.
//!
//! Requests carrying more keys or values than the configured per-message
//! thresholds are split by the caller; each chunk becomes its own correlated
//! request and the caller merges the per-chunk results.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Split a key set into chunks of at most `max` keys.
pub fn chunk_keys<K>(keys: &HashSet<K>, max: usize) -> Vec<HashSet<K>>
where
    K: Clone + Eq + Hash,
{
    let max = max.max(1);
    let mut chunks = Vec::new();
    let mut current = HashSet::new();
    for key in keys {
        current.insert(key.clone());
        if current.len() == max {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split an entry map into chunks of at most `max` entries.
pub fn chunk_entries<K, V>(entries: &HashMap<K, V>, max: usize) -> Vec<HashMap<K, V>>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    let max = max.max(1);
    let mut chunks = Vec::new();
    let mut current = HashMap::new();
    for (key, value) in entries {
        current.insert(key.clone(), value.clone());
        if current.len() == max {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_keys_exact_division() {
        let keys: HashSet<u32> = (0..20).collect();
        let chunks = chunk_keys(&keys, 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.iter().map(HashSet::len).sum::<usize>(), 20);
    }

    #[test]
    fn test_chunk_keys_with_remainder() {
        let keys: HashSet<u32> = (0..25).collect();
        let chunks = chunk_keys(&keys, 10);
        assert_eq!(chunks.len(), 3);
        let total: HashSet<u32> = chunks.into_iter().flatten().collect();
        assert_eq!(total, keys);
    }

    #[test]
    fn test_chunk_empty_input_yields_no_chunks() {
        let keys: HashSet<u32> = HashSet::new();
        assert!(chunk_keys(&keys, 10).is_empty());
        let entries: HashMap<u32, u32> = HashMap::new();
        assert!(chunk_entries(&entries, 10).is_empty());
    }

    #[test]
    fn test_chunk_entries_preserves_pairs() {
        let entries: HashMap<u32, String> = (0..7).map(|i| (i, i.to_string())).collect();
        let chunks = chunk_entries(&entries, 3);
        assert_eq!(chunks.len(), 3);
        let merged: HashMap<u32, String> = chunks.into_iter().flatten().collect();
        assert_eq!(merged, entries);
    }
}
