//! Backup-storage integration tests: assignment, removal, reconciliation.

#[cfg(test)]
mod tests {
    use crate::codec::BincodeCodec;
    use crate::grid::separated::SeparatedStorage;
    use crate::grid::StorageGrid;
    use crate::storage::DistributedStorage;
    use crate::testing::{test_grid_config, wait_for, wait_for_full_mesh, SimulatedBus};
    use std::collections::HashMap;
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
    async fn test_entries_spread_round_robin_over_peers() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 3).await;
        let (a, b, c) = (&storages[0], &storages[1], &storages[2]);

        let entries: HashMap<String, u64> =
            (0..4).map(|i| (format!("key-{i}"), i as u64)).collect();
        a.insert_all(entries).await.unwrap();

        assert!(
            wait_for(|| a.backup_metrics().saved_entries == 4, Duration::from_secs(5)).await
        );
        assert!(
            wait_for(
                || {
                    b.backup_metrics().stored_entries + c.backup_metrics().stored_entries == 4
                },
                Duration::from_secs(5)
            )
            .await
        );
        // Two live peers, four keys: round-robin lands two on each.
        assert_eq!(b.backup_metrics().stored_entries, 2);
        assert_eq!(c.backup_metrics().stored_entries, 2);
    }

    #[tokio::test]
    async fn test_delete_removes_the_backup_copy() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 2).await;
        let (a, b) = (&storages[0], &storages[1]);

        a.insert_all(HashMap::from([
            ("x".to_string(), 1u64),
            ("y".to_string(), 2u64),
        ]))
        .await
        .unwrap();
        assert!(
            wait_for(|| b.backup_metrics().stored_entries == 2, Duration::from_secs(5)).await
        );

        a.delete(&"x".to_string()).await.unwrap();

        assert!(
            wait_for(|| b.backup_metrics().stored_entries == 1, Duration::from_secs(5)).await
        );
        assert!(
            wait_for(|| a.backup_metrics().saved_entries == 1, Duration::from_secs(5)).await
        );
    }

    #[tokio::test]
    async fn test_updates_keep_the_same_holder() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 3).await;
        let (a, b, c) = (&storages[0], &storages[1], &storages[2]);

        a.insert_all(HashMap::from([("x".to_string(), 1u64)]))
            .await
            .unwrap();
        assert!(
            wait_for(
                || b.backup_metrics().stored_entries + c.backup_metrics().stored_entries == 1,
                Duration::from_secs(5)
            )
            .await
        );
        let before = (
            b.backup_metrics().stored_entries,
            c.backup_metrics().stored_entries,
        );

        // Repeated writes to the same key must not migrate the copy.
        for value in 2..6u64 {
            a.set("x".to_string(), value).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let after = (
            b.backup_metrics().stored_entries,
            c.backup_metrics().stored_entries,
        );
        assert_eq!(before, after);
        assert_eq!(a.backup_metrics().saved_entries, 1);
    }

    #[tokio::test]
    async fn test_fetch_remote_backups_returns_own_entries() {
        let bus = Arc::new(SimulatedBus::new());
        let (_grids, storages) = cluster(&bus, 3).await;
        let a = &storages[0];

        let entries: HashMap<String, u64> =
            (0..4).map(|i| (format!("key-{i}"), i as u64)).collect();
        a.insert_all(entries.clone()).await.unwrap();
        assert!(
            wait_for(|| a.backup_metrics().saved_entries == 4, Duration::from_secs(5)).await
        );

        let reconciled = a.fetch_remote_backups().await.unwrap();
        assert_eq!(reconciled, entries);
    }

    #[tokio::test]
    async fn test_no_backups_without_remote_peers() {
        let bus = Arc::new(SimulatedBus::new());
        let grid = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let a = separated(&grid, "cache");

        a.insert_all(HashMap::from([("x".to_string(), 1u64)]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let metrics = a.backup_metrics();
        assert_eq!(metrics.saved_entries, 0);
        assert_eq!(metrics.stored_entries, 0);
    }
}
