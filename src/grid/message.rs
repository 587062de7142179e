//! The unit crossing the message bus.
//!
//! A [`GridMessage`] is an envelope of routing fields around opaque encoded
//! keys and values. Storage traffic keeps its payload in the `keys`/`values`
//! sequences, which the endpoint never inspects; raft subtypes carry their
//! scalars inside the [`MessageKind`] variant.

use crate::raft::log::LogEntry;
use crate::types::{CorrelationId, EndpointId, StorageId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Protocol tag routing an inbound message to its subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolTag {
    /// Separated-storage traffic.
    SeparatedStorage,
    /// Replicated-storage traffic.
    ReplicatedStorage,
    /// Federated-storage traffic.
    FederatedStorage,
    /// Backup-storage traffic.
    BackupStorage,
    /// Raft coordination traffic.
    Raft,
}

impl std::fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtocolTag::SeparatedStorage => "separated-storage",
            ProtocolTag::ReplicatedStorage => "replicated-storage",
            ProtocolTag::FederatedStorage => "federated-storage",
            ProtocolTag::BackupStorage => "backup-storage",
            ProtocolTag::Raft => "raft",
        };
        f.write_str(name)
    }
}

/// Message type: storage requests, responses and notifications, plus the
/// raft subtypes with their scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageKind {
    GetEntriesRequest,
    GetEntriesResponse,
    GetKeysRequest,
    GetKeysResponse,
    UpdateEntriesRequest,
    UpdateEntriesResponse,
    UpdateEntriesNotification,
    InsertEntriesRequest,
    InsertEntriesResponse,
    InsertEntriesNotification,
    DeleteEntriesRequest,
    DeleteEntriesResponse,
    DeleteEntriesNotification,

    /// Place entries on the receiving peer on behalf of the sender.
    BackupSaveNotification,
    /// Remove backed-up entries of the sender.
    BackupDeleteNotification,
    /// Evict backed-up entries of the sender.
    BackupEvictNotification,
    /// Ask for the entries the receiver holds on behalf of the sender.
    BackupGetRequest,
    BackupGetResponse,

    /// Membership heartbeat; every peer broadcasts it periodically.
    Hello,
    VoteRequest {
        last_log_index: u64,
        last_log_term: u64,
    },
    VoteResponse {
        granted: bool,
    },
    AppendEntriesRequest {
        prev_log_index: u64,
        prev_log_term: u64,
        leader_commit: u64,
        entries: Vec<LogEntry>,
    },
    AppendEntriesResponse {
        success: bool,
        match_index: u64,
    },
}

impl MessageKind {
    /// Whether this kind closes a correlated request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageKind::GetEntriesResponse
                | MessageKind::GetKeysResponse
                | MessageKind::UpdateEntriesResponse
                | MessageKind::InsertEntriesResponse
                | MessageKind::DeleteEntriesResponse
                | MessageKind::BackupGetResponse
        )
    }
}

/// The unit crossing the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridMessage {
    /// Subsystem this message belongs to.
    pub protocol: ProtocolTag,

    /// Message type.
    pub kind: MessageKind,

    /// The publishing endpoint.
    pub source: EndpointId,

    /// Target endpoint; `None` means broadcast.
    pub destination: Option<EndpointId>,

    /// Correlates a response with its request.
    pub correlation_id: Option<CorrelationId>,

    /// The storage this message belongs to; absent on raft traffic.
    pub storage_id: Option<StorageId>,

    /// Encoded keys. Opaque to the endpoint.
    #[serde(default)]
    pub keys: Vec<Bytes>,

    /// Encoded values. Opaque to the endpoint.
    #[serde(default)]
    pub values: Vec<Bytes>,

    /// Raft term of the sender; zero on storage traffic.
    #[serde(default)]
    pub term: u64,
}

impl GridMessage {
    /// Create a broadcast message with empty payload.
    pub fn new(protocol: ProtocolTag, kind: MessageKind, source: EndpointId) -> Self {
        Self {
            protocol,
            kind,
            source,
            destination: None,
            correlation_id: None,
            storage_id: None,
            keys: Vec::new(),
            values: Vec::new(),
            term: 0,
        }
    }

    /// Address the message to a single endpoint.
    pub fn with_destination(mut self, destination: EndpointId) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Attach a correlation identifier.
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach the storage identifier.
    pub fn with_storage_id(mut self, storage_id: impl Into<StorageId>) -> Self {
        self.storage_id = Some(storage_id.into());
        self
    }

    /// Attach encoded keys.
    pub fn with_keys(mut self, keys: Vec<Bytes>) -> Self {
        self.keys = keys;
        self
    }

    /// Attach encoded values.
    pub fn with_values(mut self, values: Vec<Bytes>) -> Self {
        self.values = values;
        self
    }

    /// Attach the sender's raft term.
    pub fn with_term(mut self, term: u64) -> Self {
        self.term = term;
        self
    }

    /// Build the response envelope for this request: addressed back to the
    /// source, carrying the same correlation and storage identifiers.
    pub fn respond(&self, kind: MessageKind, local: EndpointId) -> GridMessage {
        GridMessage {
            protocol: self.protocol,
            kind,
            source: local,
            destination: Some(self.source),
            correlation_id: self.correlation_id,
            storage_id: self.storage_id.clone(),
            keys: Vec::new(),
            values: Vec::new(),
            term: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_respond_mirrors_routing_fields() {
        let requester = Uuid::new_v4();
        let responder = Uuid::new_v4();
        let request = GridMessage::new(
            ProtocolTag::SeparatedStorage,
            MessageKind::GetEntriesRequest,
            requester,
        )
        .with_correlation(7)
        .with_storage_id("prices");

        let response = request.respond(MessageKind::GetEntriesResponse, responder);

        assert_eq!(response.destination, Some(requester));
        assert_eq!(response.source, responder);
        assert_eq!(response.correlation_id, Some(7));
        assert_eq!(response.storage_id.as_deref(), Some("prices"));
    }

    #[test]
    fn test_envelope_round_trip() {
        let msg = GridMessage::new(
            ProtocolTag::Raft,
            MessageKind::VoteRequest {
                last_log_index: 4,
                last_log_term: 2,
            },
            Uuid::new_v4(),
        )
        .with_term(3);

        let encoded = bincode::serialize(&msg).unwrap();
        let decoded: GridMessage = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded.term, 3);
        assert_eq!(decoded.kind, msg.kind);
    }
}
