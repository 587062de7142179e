//! Embedded distributed storage grid.
//!
//! This crate lets a cluster of peer processes expose coherent key-value
//! stores over any message transport. Each peer is simultaneously a client of
//! its own local store and a participant in the grid; there is no central
//! server. Three distribution strategies share one request/response fabric
//! and a Raft coordination plane:
//!
//! - **Separated**: each key is owned by exactly one peer (the first to
//!   insert it), with a backup copy on one other peer for failover.
//! - **Replicated**: every peer holds a full copy; writes are serialized
//!   through the Raft leader.
//! - **Federated**: peers hold partial copies reconciled by a configured
//!   merge operator.
//!
//! # Example
//!
//! ```rust,no_run
//! use gridstore::codec::BincodeCodec;
//! use gridstore::storage::DistributedStorage;
//! use gridstore::testing::SimulatedBus;
//! use gridstore::{GridConfig, StorageGrid};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = Arc::new(SimulatedBus::new());
//!
//!     let grid = StorageGrid::new(GridConfig::default(), bus.clone())?;
//!     let prices = grid
//!         .separated_storage::<String, u64>()
//!         .with_storage_id("prices")
//!         .with_key_codec(BincodeCodec::new())
//!         .with_value_codec(BincodeCodec::new())
//!         .build()?;
//!
//!     prices.set("ore".to_string(), 42).await?;
//!     assert_eq!(prices.get(&"ore".to_string()).await?, Some(42));
//!
//!     prices.close();
//!     grid.close();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │     Separated / Replicated / Federated        │
//! │          DistributedStorage surface           │
//! └───────────────────────────────────────────────┘
//!          │                    │
//!          ▼                    ▼
//! ┌────────────────┐   ┌────────────────┐   ┌──────────────┐
//! │ StorageEndpoint│   │ BackupStorage  │   │ Raft actor   │
//! │ correlated RPC │   │ (separated)    │   │ election +   │
//! └────────────────┘   └────────────────┘   │ replication  │
//!          │                    │           └──────────────┘
//!          └─────────┬──────────┴──────────────────┘
//!                    ▼
//!          ┌──────────────────┐
//!          │    MessageBus    │  unreliable, unordered
//!          └──────────────────┘
//! ```
//!
//! # Consistency model
//!
//! - Separated reads may observe stale values briefly during ownership
//!   handoff; a key is owned by exactly one peer at any time.
//! - Replicated writes are linearizable per leader term; writes in flight
//!   during a leader change may reorder.
//! - Federated values converge when the merge operator is commutative and
//!   associative.
//!
//! Nothing is persisted: a restarted peer joins as a fresh endpoint.

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod grid;
pub mod raft;
pub mod storage;
pub mod testing;
pub mod types;

pub use bus::MessageBus;
pub use config::{GridConfig, RaftConfig, StorageConfig};
pub use error::{CodecError, EndpointError, Error, RaftError, Result, StorageError};
pub use grid::backups::BackupMetrics;
pub use grid::endpoint::{Destination, StorageEndpoint, StorageHandlers};
pub use grid::federated::{FederatedStorage, FederatedStorageBuilder, MergeOperator};
pub use grid::iterator::BatchedIterator;
pub use grid::message::{GridMessage, MessageKind, ProtocolTag};
pub use grid::replicated::{ReplicatedStorage, ReplicatedStorageBuilder};
pub use grid::separated::{SeparatedStorage, SeparatedStorageBuilder};
pub use grid::StorageGrid;
pub use raft::RaftHandle;
pub use storage::events::{EventBatch, StorageEvent};
pub use storage::memory::ConcurrentMemoryStorage;
pub use storage::time_limited::TimeLimitedMemoryStorage;
pub use storage::{DistributedStorage, Storage, StorageEntry};
pub use types::{CorrelationId, EndpointId, PeerEvent, StorageId};
