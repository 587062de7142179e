//! Replicated-storage integration tests: leader-serialized writes,
//! standalone mode, the join dump and expiration relaying.

#[cfg(test)]
mod tests {
    use crate::codec::BincodeCodec;
    use crate::grid::message::{MessageKind, ProtocolTag};
    use crate::grid::replicated::ReplicatedStorage;
    use crate::grid::StorageGrid;
    use crate::storage::time_limited::TimeLimitedMemoryStorage;
    use crate::storage::DistributedStorage;
    use crate::testing::{
        test_grid_config, wait_for, wait_for_full_mesh, wait_for_leader, SimulatedBus,
    };
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn replicated(grid: &StorageGrid, id: &str) -> ReplicatedStorage<String, u64> {
        grid.replicated_storage::<String, u64>()
            .with_storage_id(id)
            .with_key_codec(BincodeCodec::new())
            .with_value_codec(BincodeCodec::new())
            .build()
            .unwrap()
    }

    async fn cluster(
        bus: &Arc<SimulatedBus>,
        n: usize,
    ) -> (Vec<StorageGrid>, Vec<ReplicatedStorage<String, u64>>) {
        let grids: Vec<StorageGrid> = (0..n)
            .map(|_| StorageGrid::new(test_grid_config(), bus.clone()).unwrap())
            .collect();
        let storages: Vec<_> = grids.iter().map(|grid| replicated(grid, "repl")).collect();
        let refs: Vec<&StorageGrid> = grids.iter().collect();
        assert!(wait_for_full_mesh(&refs, Duration::from_secs(5)).await);
        assert!(
            wait_for_leader(&refs, Duration::from_secs(5)).await.is_some(),
            "no leader elected within the deadline"
        );
        // Storages leave standalone mode once they observe the leader.
        assert!(
            wait_for(
                || storages.iter().all(|s| !s.is_standalone()),
                Duration::from_secs(5)
            )
            .await
        );
        (grids, storages)
    }

    /// Poll a replica until it reports `expected` for `key`.
    async fn expect_value(
        storage: &ReplicatedStorage<String, u64>,
        key: &str,
        expected: Option<u64>,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if storage.get(&key.to_string()).await.unwrap() == expected {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "replica did not converge to {expected:?} for {key}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_standalone_peer_acts_locally() {
        let bus = Arc::new(SimulatedBus::new());
        let grid = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let storage = replicated(&grid, "repl");

        assert!(storage.is_standalone());
        assert_eq!(storage.set("k".to_string(), 1).await.unwrap(), None);
        assert_eq!(storage.get(&"k".to_string()).await.unwrap(), Some(1));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(grid.current_leader(), None);
        assert!(storage.is_standalone());
    }

    #[tokio::test]
    async fn test_writes_serialize_through_the_leader() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 3).await;
        let (a, b) = (&storages[0], &storages[1]);

        assert_eq!(a.set("k".to_string(), 1).await.unwrap(), None);
        for storage in &storages {
            expect_value(storage, "k", Some(1)).await;
        }

        // The second writer observes the first write as the pre-write value.
        assert_eq!(b.set("k".to_string(), 2).await.unwrap(), Some(1));
        for storage in &storages {
            expect_value(storage, "k", Some(2)).await;
        }
    }

    #[tokio::test]
    async fn test_insert_reports_cluster_conflicts() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 3).await;
        let (a, c) = (&storages[0], &storages[2]);

        a.set("k".to_string(), 1).await.unwrap();
        assert!(
            wait_for(
                || storages.iter().all(|s| s.local_size() == 1),
                Duration::from_secs(5)
            )
            .await
        );

        let blocked = c
            .insert_all(HashMap::from([("k".to_string(), 9u64)]))
            .await
            .unwrap();
        assert_eq!(blocked, HashMap::from([("k".to_string(), 1)]));
        assert_eq!(c.get(&"k".to_string()).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_delete_propagates_to_all_replicas() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 3).await;
        let (a, b) = (&storages[0], &storages[1]);

        a.set("k".to_string(), 1).await.unwrap();
        assert!(
            wait_for(
                || storages.iter().all(|s| s.local_size() == 1),
                Duration::from_secs(5)
            )
            .await
        );

        let deleted = b
            .delete_all(HashSet::from(["k".to_string()]))
            .await
            .unwrap();
        assert_eq!(deleted, HashSet::from(["k".to_string()]));
        assert!(
            wait_for(
                || storages.iter().all(|s| s.local_is_empty()),
                Duration::from_secs(5)
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_standalone_entries_dump_into_the_cluster() {
        let bus = Arc::new(SimulatedBus::new());
        let g1 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let s1 = replicated(&g1, "repl");

        s1.set("x".to_string(), 1).await.unwrap();
        s1.set("y".to_string(), 2).await.unwrap();
        assert!(s1.is_standalone());

        let g2 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let s2 = replicated(&g2, "repl");

        assert!(
            wait_for_leader(&[&g1, &g2], Duration::from_secs(5))
                .await
                .is_some()
        );
        assert!(wait_for(|| s2.local_size() == 2, Duration::from_secs(5)).await);
        assert_eq!(s2.get(&"x".to_string()).await.unwrap(), Some(1));
        assert_eq!(s2.get(&"y".to_string()).await.unwrap(), Some(2));
        assert!(wait_for(|| !s1.is_standalone(), Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_only_the_leader_relays_expirations() {
        let bus = Arc::new(SimulatedBus::new());
        let grids: Vec<StorageGrid> = (0..3)
            .map(|_| StorageGrid::new(test_grid_config(), bus.clone()).unwrap())
            .collect();
        let storages: Vec<ReplicatedStorage<String, u64>> = grids
            .iter()
            .map(|grid| {
                grid.replicated_storage::<String, u64>()
                    .with_storage_id("ttl")
                    .with_key_codec(BincodeCodec::new())
                    .with_value_codec(BincodeCodec::new())
                    .with_storage(Arc::new(TimeLimitedMemoryStorage::with_event_window(
                        "ttl",
                        Duration::from_millis(250),
                        100,
                        Duration::from_millis(30),
                    )))
                    .build()
                    .unwrap()
            })
            .collect();
        let refs: Vec<&StorageGrid> = grids.iter().collect();
        assert!(wait_for_full_mesh(&refs, Duration::from_secs(5)).await);
        let leader = wait_for_leader(&refs, Duration::from_secs(5)).await.unwrap();
        assert!(
            wait_for(
                || storages.iter().all(|s| !s.is_standalone()),
                Duration::from_secs(5)
            )
            .await
        );

        storages[0].set("k".to_string(), 1).await.unwrap();
        assert!(
            wait_for(
                || storages.iter().all(|s| s.local_size() == 1),
                Duration::from_secs(5)
            )
            .await
        );

        // Entries expire; only the leader turns them into cluster deletes.
        assert!(
            wait_for(
                || storages.iter().all(|s| s.local_is_empty()),
                Duration::from_secs(5)
            )
            .await
        );
        let delete_requests: Vec<_> = bus
            .published()
            .into_iter()
            .filter(|m| {
                m.protocol == ProtocolTag::ReplicatedStorage
                    && m.kind == MessageKind::DeleteEntriesRequest
            })
            .collect();
        assert!(!delete_requests.is_empty());
        assert!(delete_requests.iter().all(|m| m.source == leader));
    }
}
