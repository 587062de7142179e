//! Configuration types for the storage grid.

use crate::types::StorageId;
use std::time::Duration;

/// Grid-wide configuration. Per-storage settings default to these values and
/// can be overridden on the storage builders.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Deadline for every endpoint request. On expiry the caller receives the
    /// partial aggregate collected so far.
    pub request_timeout: Duration,

    /// Maximum number of keys carried by a single bus message. Larger
    /// requests are split into correlated chunks.
    pub max_message_keys: usize,

    /// Maximum number of values carried by a single bus message.
    pub max_message_values: usize,

    /// Storage-event batch size threshold. A batch is emitted when this many
    /// events have been collected, or when the time window closes.
    pub max_collected_events: usize,

    /// Storage-event batch time window.
    pub max_collected_time: Duration,

    /// Number of entries fetched per batch during cross-cluster iteration.
    pub iterator_batch_size: usize,

    /// Raft coordination timings.
    pub raft: RaftConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            max_message_keys: 1000,
            max_message_values: 1000,
            max_collected_events: 100,
            max_collected_time: Duration::from_millis(100),
            iterator_batch_size: 300,
            raft: RaftConfig::default(),
        }
    }
}

impl GridConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the per-message key batching threshold.
    pub fn with_max_message_keys(mut self, max: usize) -> Self {
        self.max_message_keys = max;
        self
    }

    /// Set the per-message value batching threshold.
    pub fn with_max_message_values(mut self, max: usize) -> Self {
        self.max_message_values = max;
        self
    }

    /// Set the storage-event batch size threshold.
    pub fn with_max_collected_events(mut self, max: usize) -> Self {
        self.max_collected_events = max;
        self
    }

    /// Set the storage-event batch time window.
    pub fn with_max_collected_time(mut self, window: Duration) -> Self {
        self.max_collected_time = window;
        self
    }

    /// Set the cross-cluster iteration batch size.
    pub fn with_iterator_batch_size(mut self, size: usize) -> Self {
        self.iterator_batch_size = size;
        self
    }

    /// Set the Raft timings.
    pub fn with_raft_config(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    /// Validate the configuration and return an error description if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be non-zero".to_string());
        }
        if self.max_message_keys == 0 || self.max_message_values == 0 {
            return Err("message batching thresholds must be at least 1".to_string());
        }
        if self.max_collected_events == 0 {
            return Err("max_collected_events must be at least 1".to_string());
        }
        if self.iterator_batch_size == 0 {
            return Err("iterator_batch_size must be at least 1".to_string());
        }
        self.raft.validate()
    }
}

/// Raft coordination timings.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Lower bound of the election timeout. The actual timeout is drawn
    /// uniformly from `[min, 2 * min]` on every reset.
    pub min_election_timeout: Duration,

    /// Interval between leader heartbeats and membership hello broadcasts.
    pub heartbeat_interval: Duration,

    /// A peer silent for this long is removed from the known-peers set and a
    /// detach notification is delivered to every local storage.
    pub peer_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            min_election_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(100),
            peer_timeout: Duration::from_millis(1500),
        }
    }
}

impl RaftConfig {
    /// Set the minimum election timeout.
    pub fn with_min_election_timeout(mut self, timeout: Duration) -> Self {
        self.min_election_timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the peer silence timeout.
    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    /// Validate the timings and return an error description if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be non-zero".to_string());
        }
        if self.min_election_timeout <= self.heartbeat_interval {
            return Err("min_election_timeout must exceed heartbeat_interval".to_string());
        }
        if self.peer_timeout <= self.heartbeat_interval {
            return Err("peer_timeout must exceed heartbeat_interval".to_string());
        }
        Ok(())
    }
}

/// Per-storage configuration, derived from [`GridConfig`] defaults and
/// overridable on the storage builders.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// The storage identifier.
    pub storage_id: StorageId,

    /// Deadline for endpoint requests issued by this storage.
    pub request_timeout: Duration,

    /// Per-message key batching threshold.
    pub max_message_keys: usize,

    /// Per-message value batching threshold.
    pub max_message_values: usize,

    /// Storage-event batch size threshold.
    pub max_collected_events: usize,

    /// Storage-event batch time window.
    pub max_collected_time: Duration,

    /// Cross-cluster iteration batch size.
    pub iterator_batch_size: usize,
}

impl StorageConfig {
    /// Derive a per-storage configuration from the grid defaults.
    pub fn from_grid(storage_id: impl Into<StorageId>, grid: &GridConfig) -> Self {
        Self {
            storage_id: storage_id.into(),
            request_timeout: grid.request_timeout,
            max_message_keys: grid.max_message_keys,
            max_message_values: grid.max_message_values,
            max_collected_events: grid.max_collected_events,
            max_collected_time: grid.max_collected_time,
            iterator_batch_size: grid.iterator_batch_size,
        }
    }

    /// Chunk size for entry batches: the stricter of the two thresholds.
    pub fn entry_batch_size(&self) -> usize {
        self.max_message_keys.min(self.max_message_values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GridConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_batching_threshold_rejected() {
        let config = GridConfig::default().with_max_message_keys(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_election_timeout_must_exceed_heartbeat() {
        let raft = RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(500))
            .with_min_election_timeout(Duration::from_millis(200));
        assert!(raft.validate().is_err());
    }

    #[test]
    fn test_storage_config_inherits_grid_defaults() {
        let grid = GridConfig::default().with_max_message_keys(42);
        let storage = StorageConfig::from_grid("prices", &grid);
        assert_eq!(storage.storage_id, "prices");
        assert_eq!(storage.max_message_keys, 42);
    }
}
