//! Core types used throughout the storage grid.

use uuid::Uuid;

/// Identifies one participant in the grid for the lifetime of its process.
///
/// Two peers never share an identifier; a restarted peer joins with a fresh one.
pub type EndpointId = Uuid;

/// Operator-chosen name of a storage. Peers using the same identifier form one
/// logical storage and must agree on its strategy, key type and value type.
pub type StorageId = String;

/// Correlates a request with its responses. Unique within the issuing
/// endpoint's process lifetime.
pub type CorrelationId = u64;

/// Membership and coordination notifications emitted by the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// A remote endpoint was seen for the first time.
    Joined(EndpointId),

    /// A remote endpoint went silent past the peer timeout and was removed.
    Detached(EndpointId),

    /// The Raft leader changed; `None` means no leader is currently known.
    LeaderChanged(Option<EndpointId>),
}
