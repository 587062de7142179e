//! Separated-storage integration tests: ownership, handoff, batching.

#[cfg(test)]
mod tests {
    use crate::codec::BincodeCodec;
    use crate::error::{Error, StorageError};
    use crate::grid::message::{MessageKind, ProtocolTag};
    use crate::grid::separated::SeparatedStorage;
    use crate::grid::StorageGrid;
    use crate::storage::DistributedStorage;
    use crate::testing::{
        test_grid_config, wait_for, wait_for_full_mesh, SimulatedBus,
    };
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;

    fn separated(grid: &StorageGrid, id: &str) -> SeparatedStorage<String, u64> {
        grid.separated_storage::<String, u64>()
            .with_storage_id(id)
            .with_key_codec(BincodeCodec::new())
            .with_value_codec(BincodeCodec::new())
            .build()
            .unwrap()
    }

    async fn cluster(
        bus: &Arc<SimulatedBus>,
        n: usize,
    ) -> (Vec<StorageGrid>, Vec<SeparatedStorage<String, u64>>) {
        let grids: Vec<StorageGrid> = (0..n)
            .map(|_| StorageGrid::new(test_grid_config(), bus.clone()).unwrap())
            .collect();
        let storages: Vec<_> = grids.iter().map(|grid| separated(grid, "cache")).collect();
        let refs: Vec<&StorageGrid> = grids.iter().collect();
        assert!(wait_for_full_mesh(&refs, Duration::from_secs(5)).await);
        (grids, storages)
    }

    #[tokio::test]
    async fn test_first_inserter_owns_key() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 3).await;
        let (a, b, c) = (&storages[0], &storages[1], &storages[2]);

        a.insert_all(HashMap::from([("x".to_string(), 1u64)]))
            .await
            .unwrap();

        assert_eq!(a.local_keys(), HashSet::from(["x".to_string()]));
        assert!(b.local_is_empty());
        assert!(c.local_is_empty());

        assert_eq!(b.get(&"x".to_string()).await.unwrap(), Some(1));
        assert_eq!(c.get(&"x".to_string()).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_ownership_handoff_on_detach() {
        let bus = Arc::new(SimulatedBus::new());
        let (grids, storages) = cluster(&bus, 3).await;
        let (a, b, c) = (&storages[0], &storages[1], &storages[2]);

        a.insert_all(HashMap::from([("x".to_string(), 1u64)]))
            .await
            .unwrap();

        // The entry must reach a backup peer before the owner goes away.
        assert!(
            wait_for(|| a.backup_metrics().saved_entries == 1, Duration::from_secs(5)).await
        );

        bus.isolate(grids[0].local_endpoint_id());

        // Whichever of b/c held the backup becomes the new owner.
        assert!(
            wait_for(
                || b.local_size() + c.local_size() == 1,
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(b.get(&"x".to_string()).await.unwrap(), Some(1));
        assert_eq!(c.get(&"x".to_string()).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_set_on_remote_key_updates_owner() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 3).await;
        let (a, b) = (&storages[0], &storages[1]);

        a.insert_all(HashMap::from([("x".to_string(), 1u64)]))
            .await
            .unwrap();

        let old = b.set("x".to_string(), 2).await.unwrap();
        assert_eq!(old, Some(1));

        // Ownership did not move.
        assert!(b.local_is_empty());
        assert_eq!(a.local_keys(), HashSet::from(["x".to_string()]));
        assert_eq!(a.get(&"x".to_string()).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_set_of_unknown_key_claims_ownership() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 2).await;
        let b = &storages[1];

        let old = b.set("fresh".to_string(), 9).await.unwrap();
        assert_eq!(old, None);
        assert_eq!(b.local_keys(), HashSet::from(["fresh".to_string()]));
    }

    #[tokio::test]
    async fn test_delete_reaches_owner() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 2).await;
        let (a, b) = (&storages[0], &storages[1]);

        a.insert_all(HashMap::from([("x".to_string(), 1u64)]))
            .await
            .unwrap();

        assert!(b.delete(&"x".to_string()).await.unwrap());
        assert!(a.local_is_empty());
        assert_eq!(a.get(&"x".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_spans_the_cluster() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 3).await;
        let (a, b, c) = (&storages[0], &storages[1], &storages[2]);

        a.insert_all(HashMap::from([("x".to_string(), 1u64)]))
            .await
            .unwrap();
        b.insert_all(HashMap::from([("y".to_string(), 2u64)]))
            .await
            .unwrap();

        let keys = c.keys().await.unwrap();
        assert_eq!(keys, HashSet::from(["x".to_string(), "y".to_string()]));
    }

    #[tokio::test]
    async fn test_get_all_merges_local_and_remote() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 2).await;
        let (a, b) = (&storages[0], &storages[1]);

        a.insert_all(HashMap::from([("x".to_string(), 1u64)]))
            .await
            .unwrap();
        b.insert_all(HashMap::from([("y".to_string(), 2u64)]))
            .await
            .unwrap();

        let all = b
            .get_all(HashSet::from(["x".to_string(), "y".to_string()]))
            .await
            .unwrap();
        assert_eq!(
            all,
            HashMap::from([("x".to_string(), 1), ("y".to_string(), 2)])
        );
    }

    #[tokio::test]
    async fn test_insert_all_reports_existing_entries() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 2).await;
        let (a, b) = (&storages[0], &storages[1]);

        a.insert_all(HashMap::from([("x".to_string(), 1u64)]))
            .await
            .unwrap();

        let blocked = b
            .insert_all(HashMap::from([
                ("x".to_string(), 5u64),
                ("y".to_string(), 7u64),
            ]))
            .await
            .unwrap();

        assert_eq!(blocked, HashMap::from([("x".to_string(), 1)]));
        assert_eq!(a.get(&"x".to_string()).await.unwrap(), Some(1));
        assert_eq!(b.local_keys(), HashSet::from(["y".to_string()]));
    }

    #[tokio::test]
    async fn test_evict_and_restore_are_illegal() {
        let bus = Arc::new(SimulatedBus::new());
        let g1 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let a = separated(&g1, "cache");

        assert!(matches!(
            a.evict(&"x".to_string()),
            Err(Error::Storage(StorageError::IllegalOperation { .. }))
        ));
        assert!(matches!(
            a.restore("x".to_string(), 1),
            Err(Error::Storage(StorageError::IllegalOperation { .. }))
        ));
    }

    #[tokio::test]
    async fn test_batched_iterator_walks_the_whole_storage() {
        let bus = Arc::new(SimulatedBus::new());
        let g1 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let g2 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let build = |grid: &StorageGrid| {
            grid.separated_storage::<String, u64>()
                .with_storage_id("scan")
                .with_key_codec(BincodeCodec::new())
                .with_value_codec(BincodeCodec::new())
                .with_iterator_batch_size(10)
                .build()
                .unwrap()
        };
        let a = build(&g1);
        let b = build(&g2);
        assert!(wait_for_full_mesh(&[&g1, &g2], Duration::from_secs(5)).await);

        let entries: HashMap<String, u64> =
            (0..25).map(|i| (format!("key-{i}"), i as u64)).collect();
        a.insert_all(entries.clone()).await.unwrap();

        // Iterating from the non-owner pulls the snapshot in key batches.
        bus.clear_log();
        let mut iter = b.iter().await.unwrap();
        let mut seen = HashMap::new();
        while let Some(entry) = iter.next().await.unwrap() {
            seen.insert(entry.key, entry.value);
        }
        assert_eq!(seen, entries);

        let b_id = g2.local_endpoint_id();
        assert_eq!(
            bus.count_published(|m| m.source == b_id
                && m.protocol == ProtocolTag::SeparatedStorage
                && m.kind == MessageKind::GetEntriesRequest),
            3
        );

        // Draining a fresh iterator yields the same snapshot.
        let remaining = b.iter().await.unwrap().collect_remaining().await.unwrap();
        assert_eq!(remaining.len(), 25);
    }

    #[tokio::test]
    async fn test_oversized_requests_are_chunked() {
        let bus = Arc::new(SimulatedBus::new());
        let g1 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let g2 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let build = |grid: &StorageGrid| {
            grid.separated_storage::<String, u64>()
                .with_storage_id("bulk")
                .with_key_codec(BincodeCodec::new())
                .with_value_codec(BincodeCodec::new())
                .with_max_message_keys(10)
                .with_max_message_values(10)
                .build()
                .unwrap()
        };
        let a = build(&g1);
        let b = build(&g2);
        assert!(wait_for_full_mesh(&[&g1, &g2], Duration::from_secs(5)).await);

        let entries: HashMap<String, u64> =
            (0..25).map(|i| (format!("key-{i}"), i as u64)).collect();
        let keys: HashSet<String> = entries.keys().cloned().collect();
        let a_id = g1.local_endpoint_id();

        bus.clear_log();
        a.insert_all(entries.clone()).await.unwrap();
        assert_eq!(
            bus.count_published(|m| m.source == a_id
                && m.protocol == ProtocolTag::SeparatedStorage
                && m.kind == MessageKind::GetEntriesRequest),
            3
        );
        assert_eq!(a.local_size(), 25);

        let b_id = g2.local_endpoint_id();
        bus.clear_log();
        let fetched = b.get_all(keys).await.unwrap();
        assert_eq!(fetched.len(), 25);
        assert_eq!(fetched, entries);
        assert_eq!(
            bus.count_published(|m| m.source == b_id
                && m.protocol == ProtocolTag::SeparatedStorage
                && m.kind == MessageKind::GetEntriesRequest),
            3
        );
    }
}
