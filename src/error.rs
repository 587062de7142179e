//! Error types for the storage grid.

use crate::types::EndpointId;
use thiserror::Error;

/// Result type alias for storage grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the storage grid.
#[derive(Error, Debug)]
pub enum Error {
    /// Endpoint request/response errors.
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// Raft coordination errors.
    #[error("raft error: {0}")]
    Raft(#[from] RaftError),

    /// Local storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Key/value codec errors.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration errors; raised at build time, never at runtime.
    #[error("config error: {0}")]
    Config(String),
}

/// Errors raised by the storage endpoint request layer.
///
/// Timeouts are not errors: a timed-out request resolves with the partial
/// aggregate collected so far.
#[derive(Error, Debug)]
pub enum EndpointError {
    /// A leader-directed request was issued while no leader is known.
    #[error("no raft leader is currently known")]
    NoLeader,

    /// The storage was closed while the request was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// The endpoint is closed and accepts no further requests.
    #[error("endpoint closed")]
    Closed,
}

/// Raft coordination errors. Most raft failures are self-healing (retries,
/// re-elections); only conditions a caller can act on are surfaced.
#[derive(Error, Debug)]
pub enum RaftError {
    /// The command was submitted to a non-leader; includes the leader if known.
    #[error("not leader, leader is: {leader:?}")]
    NotLeader { leader: Option<EndpointId> },

    /// The proposal was dropped, typically due to a leader change.
    #[error("proposal dropped")]
    ProposalDropped,

    /// The raft actor has shut down.
    #[error("raft shut down")]
    Shutdown,
}

/// Local storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The operation is not part of this storage's public contract.
    #[error("{operation} is not allowed on {storage_id}")]
    IllegalOperation {
        storage_id: String,
        operation: &'static str,
    },

    /// `restore` was called for a key the store already holds.
    #[error("cannot restore already present key in {storage_id}")]
    AlreadyPresent { storage_id: String },
}

/// Key/value codec errors.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Encoding a key or value failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Decoding a key or value failed.
    #[error("decode failed: {0}")]
    Decode(String),
}
