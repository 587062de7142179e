//! Federated-storage integration tests: merge folding and convergence.

#[cfg(test)]
mod tests {
    use crate::codec::BincodeCodec;
    use crate::error::Error;
    use crate::grid::federated::FederatedStorage;
    use crate::grid::StorageGrid;
    use crate::storage::DistributedStorage;
    use crate::testing::{test_grid_config, wait_for, wait_for_full_mesh, SimulatedBus};
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn summing(grid: &StorageGrid, id: &str) -> FederatedStorage<String, u64> {
        grid.federated_storage::<String, u64>()
            .with_storage_id(id)
            .with_key_codec(BincodeCodec::new())
            .with_value_codec(BincodeCodec::new())
            .with_merge_operator(|a, b| a + b)
            .build()
            .unwrap()
    }

    async fn expect_value(
        storage: &FederatedStorage<String, u64>,
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
                "federated value did not converge to {expected:?} for {key}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_contributions_from_two_peers_sum() {
        let bus = Arc::new(SimulatedBus::new());
        let g1 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let g2 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let a = summing(&g1, "tally");
        let b = summing(&g2, "tally");
        assert!(wait_for_full_mesh(&[&g1, &g2], Duration::from_secs(5)).await);

        a.set("x".to_string(), 3).await.unwrap();
        b.set("x".to_string(), 5).await.unwrap();

        expect_value(&a, "x", Some(8)).await;
        expect_value(&b, "x", Some(8)).await;
    }

    #[tokio::test]
    async fn test_same_peer_folds_sequential_sets() {
        let bus = Arc::new(SimulatedBus::new());
        let g1 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let a = summing(&g1, "tally");

        assert_eq!(a.set("k".to_string(), 3).await.unwrap(), None);
        assert_eq!(a.set("k".to_string(), 5).await.unwrap(), Some(3));
        assert_eq!(a.get(&"k".to_string()).await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn test_delete_removes_the_key_everywhere() {
        let bus = Arc::new(SimulatedBus::new());
        let g1 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let g2 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let a = summing(&g1, "tally");
        let b = summing(&g2, "tally");
        assert!(wait_for_full_mesh(&[&g1, &g2], Duration::from_secs(5)).await);

        a.set("x".to_string(), 3).await.unwrap();
        b.set("x".to_string(), 5).await.unwrap();
        expect_value(&a, "x", Some(8)).await;
        expect_value(&b, "x", Some(8)).await;

        assert!(a.delete(&"x".to_string()).await.unwrap());
        assert!(
            wait_for(
                || a.local_is_empty() && b.local_is_empty(),
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(a.get(&"x".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_does_not_merge() {
        let bus = Arc::new(SimulatedBus::new());
        let g1 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let g2 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let a = summing(&g1, "tally");
        let b = summing(&g2, "tally");
        assert!(wait_for_full_mesh(&[&g1, &g2], Duration::from_secs(5)).await);

        assert!(a
            .insert_all(HashMap::from([("y".to_string(), 10u64)]))
            .await
            .unwrap()
            .is_empty());
        assert!(wait_for(|| b.local_size() == 1, Duration::from_secs(5)).await);

        let blocked = b
            .insert_all(HashMap::from([("y".to_string(), 99u64)]))
            .await
            .unwrap();
        assert_eq!(blocked, HashMap::from([("y".to_string(), 10)]));
        expect_value(&a, "y", Some(10)).await;
        expect_value(&b, "y", Some(10)).await;
    }

    #[tokio::test]
    async fn test_keys_spans_the_cluster() {
        let bus = Arc::new(SimulatedBus::new());
        let g1 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let g2 = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();
        let a = summing(&g1, "tally");
        let b = summing(&g2, "tally");
        assert!(wait_for_full_mesh(&[&g1, &g2], Duration::from_secs(5)).await);

        a.set("x".to_string(), 1).await.unwrap();
        b.set("z".to_string(), 2).await.unwrap();

        assert!(
            wait_for(
                || a.local_size() == 2 && b.local_size() == 2,
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(
            a.keys().await.unwrap(),
            HashSet::from(["x".to_string(), "z".to_string()])
        );
    }

    #[tokio::test]
    async fn test_missing_merge_operator_refuses_to_build() {
        let bus = Arc::new(SimulatedBus::new());
        let grid = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();

        let result = grid
            .federated_storage::<String, u64>()
            .with_storage_id("tally")
            .with_key_codec(BincodeCodec::new())
            .with_value_codec(BincodeCodec::new())
            .build();

        assert!(matches!(result, Err(Error::Config(_))));
    }
}
