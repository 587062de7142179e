//! Raft coordinator integration tests: elections, failover, replication.

#[cfg(test)]
mod tests {
    use crate::grid::message::{MessageKind, ProtocolTag};
    use crate::grid::StorageGrid;
    use crate::testing::{test_grid_config, wait_for_full_mesh, wait_for_leader, SimulatedBus};
    use bytes::Bytes;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start_cluster(bus: &Arc<SimulatedBus>, n: usize) -> Vec<StorageGrid> {
        let grids: Vec<StorageGrid> = (0..n)
            .map(|_| StorageGrid::new(test_grid_config(), bus.clone()).unwrap())
            .collect();
        let refs: Vec<&StorageGrid> = grids.iter().collect();
        assert!(wait_for_full_mesh(&refs, Duration::from_secs(5)).await);
        grids
    }

    #[tokio::test]
    async fn test_no_election_without_peers() {
        let bus = Arc::new(SimulatedBus::new());
        let grid = StorageGrid::new(test_grid_config(), bus.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(grid.current_leader(), None);
    }

    #[tokio::test]
    async fn test_three_peers_elect_one_leader() {
        let bus = Arc::new(SimulatedBus::new());
        let grids = start_cluster(&bus, 3).await;
        let refs: Vec<&StorageGrid> = grids.iter().collect();

        let leader = wait_for_leader(&refs, Duration::from_secs(5)).await;
        assert!(leader.is_some());
    }

    #[tokio::test]
    async fn test_new_leader_after_killing_the_old_one() {
        let bus = Arc::new(SimulatedBus::new());
        let grids = start_cluster(&bus, 5).await;
        let refs: Vec<&StorageGrid> = grids.iter().collect();
        let old_leader = wait_for_leader(&refs, Duration::from_secs(5)).await.unwrap();

        bus.isolate(old_leader);

        let remaining: Vec<&StorageGrid> = grids
            .iter()
            .filter(|grid| grid.local_endpoint_id() != old_leader)
            .collect();
        let new_leader = wait_for_leader(&remaining, Duration::from_secs(10))
            .await
            .expect("survivors elected no leader");
        assert_ne!(new_leader, old_leader);

        // A command submitted to the new leader commits.
        let leader_grid = remaining
            .iter()
            .find(|grid| grid.local_endpoint_id() == new_leader)
            .unwrap();
        let index = leader_grid
            .raft()
            .submit_command(Bytes::from_static(b"after-failover"))
            .await
            .unwrap();
        assert!(index > 0);
    }

    #[tokio::test]
    async fn test_submit_on_follower_is_rejected() {
        let bus = Arc::new(SimulatedBus::new());
        let grids = start_cluster(&bus, 3).await;
        let refs: Vec<&StorageGrid> = grids.iter().collect();
        let leader = wait_for_leader(&refs, Duration::from_secs(5)).await.unwrap();

        let follower = grids
            .iter()
            .find(|grid| grid.local_endpoint_id() != leader)
            .unwrap();
        let result = follower
            .raft()
            .submit_command(Bytes::from_static(b"nope"))
            .await;
        assert!(matches!(
            result,
            Err(crate::error::Error::Raft(
                crate::error::RaftError::NotLeader { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_committed_entries_reach_every_peer_once_in_order() {
        let bus = Arc::new(SimulatedBus::new());
        let grids = start_cluster(&bus, 3).await;
        let refs: Vec<&StorageGrid> = grids.iter().collect();
        let leader = wait_for_leader(&refs, Duration::from_secs(5)).await.unwrap();
        let leader_grid = grids
            .iter()
            .find(|grid| grid.local_endpoint_id() == leader)
            .unwrap();

        let mut streams: Vec<_> = grids
            .iter()
            .map(|grid| grid.raft().subscribe_committed())
            .collect();

        let payloads: Vec<Bytes> = (0..5)
            .map(|i| Bytes::from(format!("command-{i}")))
            .collect();
        for payload in &payloads {
            leader_grid.raft().submit_command(payload.clone()).await.unwrap();
        }

        for stream in &mut streams {
            for expected in &payloads {
                let entry = timeout(Duration::from_secs(5), stream.recv())
                    .await
                    .expect("commit within deadline")
                    .expect("stream open");
                assert_eq!(&entry.payload, expected);
            }
        }
    }

    #[tokio::test]
    async fn test_partitioned_follower_catches_up() {
        let bus = Arc::new(SimulatedBus::new());
        let grids = start_cluster(&bus, 3).await;
        let refs: Vec<&StorageGrid> = grids.iter().collect();
        let leader = wait_for_leader(&refs, Duration::from_secs(5)).await.unwrap();
        let leader_grid = grids
            .iter()
            .find(|grid| grid.local_endpoint_id() == leader)
            .unwrap();
        let follower = grids
            .iter()
            .find(|grid| grid.local_endpoint_id() != leader)
            .unwrap();
        let mut follower_commits = follower.raft().subscribe_committed();

        bus.isolate(follower.local_endpoint_id());
        // Long enough for both sides to declare the other detached.
        tokio::time::sleep(Duration::from_millis(700)).await;

        let payloads: Vec<Bytes> = (0..3)
            .map(|i| Bytes::from(format!("while-away-{i}")))
            .collect();
        for payload in &payloads {
            leader_grid.raft().submit_command(payload.clone()).await.unwrap();
        }

        bus.rejoin(follower.local_endpoint_id());

        for expected in &payloads {
            let entry = timeout(Duration::from_secs(10), follower_commits.recv())
                .await
                .expect("catch-up within deadline")
                .expect("stream open");
            assert_eq!(&entry.payload, expected);
        }
    }

    #[tokio::test]
    async fn test_at_most_one_leader_per_term() {
        let bus = Arc::new(SimulatedBus::new());
        let grids = start_cluster(&bus, 3).await;
        let refs: Vec<&StorageGrid> = grids.iter().collect();
        let first = wait_for_leader(&refs, Duration::from_secs(5)).await.unwrap();

        // Force at least one more election, then let the old leader return.
        bus.isolate(first);
        let remaining: Vec<&StorageGrid> = grids
            .iter()
            .filter(|grid| grid.local_endpoint_id() != first)
            .collect();
        wait_for_leader(&remaining, Duration::from_secs(10))
            .await
            .expect("no second leader");
        bus.rejoin(first);
        wait_for_leader(&refs, Duration::from_secs(10))
            .await
            .expect("cluster did not settle");

        // Append traffic is the leader's signature: per term there must be
        // at most one distinct sender.
        let mut appenders: HashMap<u64, HashSet<crate::types::EndpointId>> = HashMap::new();
        for message in bus.published() {
            if message.protocol == ProtocolTag::Raft {
                if let MessageKind::AppendEntriesRequest { .. } = message.kind {
                    appenders.entry(message.term).or_default().insert(message.source);
                }
            }
        }
        assert!(!appenders.is_empty());
        for (term, sources) in appenders {
            assert!(
                sources.len() <= 1,
                "term {term} had {} distinct leaders",
                sources.len()
            );
        }
    }
}
