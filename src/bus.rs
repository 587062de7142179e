//! Message bus contract.
//!
//! The grid treats its transport as an unreliable, unordered message bus:
//! published messages may be dropped, duplicated or reordered. Raft and the
//! endpoint request layer are built to tolerate all three.
//!
//! The bus is process-wide: it must be created before any grid and closed
//! only after every storage and grid using it has been closed.
//!
//! A subscriber receives every message the bus observes, including its own
//! publications; the grid's ingress filters self-sourced broadcasts and
//! messages addressed to other endpoints.

use crate::grid::message::GridMessage;
use crate::types::EndpointId;
use tokio::sync::mpsc;

/// Transport abstraction the grid publishes to and receives from.
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a message. Best effort: delivery is unordered and may drop.
    fn publish(&self, message: GridMessage);

    /// Register the handler channel for one endpoint. Every message observed
    /// by the bus is delivered to it.
    fn subscribe(&self, endpoint: EndpointId) -> mpsc::UnboundedReceiver<GridMessage>;

    /// Remove the handler channel of one endpoint.
    fn unsubscribe(&self, endpoint: EndpointId);
}
