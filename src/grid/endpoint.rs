//! Per-storage request/response endpoint.
//!
//! The endpoint multiplexes correlated request/response pairs over the
//! message bus. An outbound request records the set of expected responders at
//! send time; the waiter resolves when all of them answered or the deadline
//! passed, in which case the caller receives the partial aggregate and the
//! silent destinations are logged. Responders joining mid-flight are ignored;
//! responders detaching mid-flight satisfy their slot immediately.

use crate::bus::MessageBus;
use crate::codec::Codec;
use crate::config::StorageConfig;
use crate::error::{CodecError, EndpointError, Result};
use crate::grid::message::{GridMessage, MessageKind, ProtocolTag};
use crate::grid::topology::GridTopology;
use crate::types::{CorrelationId, EndpointId, PeerEvent};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

/// Where a request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// One explicit endpoint.
    Unicast(EndpointId),

    /// Every currently known remote endpoint.
    Broadcast,

    /// The current raft leader.
    Leader,
}

/// Inbound handlers a distribution strategy registers on its endpoint.
///
/// One method per inbound message kind, each a no-op by default. Request
/// handlers return the response payload; the endpoint takes care of the
/// response envelope and correlation.
#[async_trait]
pub trait StorageHandlers<K, V>: Send + Sync
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn on_get_entries_request(&self, _keys: HashSet<K>) -> HashMap<K, V> {
        HashMap::new()
    }

    async fn on_get_keys_request(&self) -> HashSet<K> {
        HashSet::new()
    }

    async fn on_update_entries_request(
        &self,
        _entries: HashMap<K, V>,
        _source: EndpointId,
    ) -> HashMap<K, V> {
        HashMap::new()
    }

    async fn on_insert_entries_request(
        &self,
        _entries: HashMap<K, V>,
        _source: EndpointId,
    ) -> HashMap<K, V> {
        HashMap::new()
    }

    async fn on_delete_entries_request(
        &self,
        _keys: HashSet<K>,
        _source: EndpointId,
    ) -> HashSet<K> {
        HashSet::new()
    }

    async fn on_update_entries_notification(&self, _entries: HashMap<K, V>, _source: EndpointId) {}

    async fn on_insert_entries_notification(&self, _entries: HashMap<K, V>, _source: EndpointId) {}

    async fn on_delete_entries_notification(&self, _keys: HashSet<K>, _source: EndpointId) {}

    async fn on_remote_endpoint_joined(&self, _peer: EndpointId) {}

    async fn on_remote_endpoint_detached(&self, _peer: EndpointId) {}

    async fn on_leader_changed(&self, _leader: Option<EndpointId>) {}
}

/// Waiter state of one in-flight request.
struct PendingRequest {
    remaining: HashSet<EndpointId>,
    received: Vec<GridMessage>,
    tx: Option<oneshot::Sender<Vec<GridMessage>>>,
}

/// Per-storage messaging front-end.
pub struct StorageEndpoint<K, V> {
    local: EndpointId,
    protocol: ProtocolTag,
    config: StorageConfig,
    bus: Arc<dyn MessageBus>,
    topology: Arc<GridTopology>,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    next_correlation: AtomicU64,
    pending: DashMap<CorrelationId, PendingRequest>,
    closed: AtomicBool,
}

impl<K, V> StorageEndpoint<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        protocol: ProtocolTag,
        config: StorageConfig,
        bus: Arc<dyn MessageBus>,
        topology: Arc<GridTopology>,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local: topology.local_endpoint_id(),
            protocol,
            config,
            bus,
            topology,
            key_codec,
            value_codec,
            next_correlation: AtomicU64::new(1),
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// The storage this endpoint serves.
    pub fn storage_id(&self) -> &str {
        &self.config.storage_id
    }

    /// This peer's endpoint identifier.
    pub fn local_endpoint_id(&self) -> EndpointId {
        self.local
    }

    /// Snapshot of the currently known remote endpoints.
    pub fn remote_endpoint_ids(&self) -> HashSet<EndpointId> {
        self.topology.remote_endpoint_ids()
    }

    /// The current raft leader, if known.
    pub fn current_leader(&self) -> Option<EndpointId> {
        self.topology.current_leader()
    }

    /// Whether this peer currently leads the grid.
    pub fn is_leader(&self) -> bool {
        self.topology.current_leader() == Some(self.local)
    }

    pub(crate) fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub(crate) fn topology(&self) -> &Arc<GridTopology> {
        &self.topology
    }

    /// Cancel all outstanding waiters and refuse further requests.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.clear();
    }

    // ==================== outbound ====================

    /// Send a correlated request and collect its raw responses.
    pub(crate) async fn request(
        &self,
        kind: MessageKind,
        keys: Vec<Bytes>,
        values: Vec<Bytes>,
        destination: Destination,
    ) -> Result<Vec<GridMessage>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EndpointError::Closed.into());
        }

        let (expected, target) = match destination {
            Destination::Unicast(peer) => (HashSet::from([peer]), Some(peer)),
            Destination::Leader => {
                let leader = self
                    .topology
                    .current_leader()
                    .ok_or(EndpointError::NoLeader)?;
                (HashSet::from([leader]), Some(leader))
            }
            Destination::Broadcast => (self.topology.remote_endpoint_ids(), None),
        };
        if expected.is_empty() {
            return Ok(Vec::new());
        }

        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(
            correlation,
            PendingRequest {
                remaining: expected,
                received: Vec::new(),
                tx: Some(tx),
            },
        );

        let mut message = GridMessage::new(self.protocol, kind, self.local)
            .with_correlation(correlation)
            .with_storage_id(self.config.storage_id.clone())
            .with_keys(keys)
            .with_values(values);
        message.destination = target;
        self.bus.publish(message);

        match tokio::time::timeout(self.config.request_timeout, &mut rx).await {
            Ok(Ok(responses)) => Ok(responses),
            Ok(Err(_)) => Err(EndpointError::Cancelled.into()),
            Err(_) => {
                match self.pending.remove(&correlation) {
                    Some((_, pending)) => {
                        warn!(
                            endpoint = %self.local,
                            storage = %self.config.storage_id,
                            missing = ?pending.remaining,
                            "request timed out, returning partial responses"
                        );
                        Ok(pending.received)
                    }
                    // Resolved in the race window between timeout and removal.
                    None => Ok(rx.try_recv().unwrap_or_default()),
                }
            }
        }
    }

    /// Fetch entries for `keys` and merge the responses, last writer wins.
    pub async fn request_get_entries(
        &self,
        keys: &HashSet<K>,
        destination: Destination,
    ) -> Result<HashMap<K, V>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let responses = self
            .request(
                MessageKind::GetEntriesRequest,
                self.encode_keys(keys)?,
                Vec::new(),
                destination,
            )
            .await?;
        Ok(self.merge_entry_responses(&responses))
    }

    /// Fetch every key of this storage across the cluster.
    pub async fn request_get_keys(&self) -> Result<HashSet<K>> {
        let responses = self
            .request(
                MessageKind::GetKeysRequest,
                Vec::new(),
                Vec::new(),
                Destination::Broadcast,
            )
            .await?;
        Ok(self.union_key_responses(&responses))
    }

    /// Apply `entries` on the destination, collecting pre-write values.
    pub async fn request_update_entries(
        &self,
        entries: &HashMap<K, V>,
        destination: Destination,
    ) -> Result<HashMap<K, V>> {
        if entries.is_empty() {
            return Ok(HashMap::new());
        }
        let (keys, values) = self.encode_entries(entries)?;
        let responses = self
            .request(MessageKind::UpdateEntriesRequest, keys, values, destination)
            .await?;
        Ok(self.merge_entry_responses(&responses))
    }

    /// Insert `entries` on the destination, collecting blocking entries.
    pub async fn request_insert_entries(
        &self,
        entries: &HashMap<K, V>,
        destination: Destination,
    ) -> Result<HashMap<K, V>> {
        if entries.is_empty() {
            return Ok(HashMap::new());
        }
        let (keys, values) = self.encode_entries(entries)?;
        let responses = self
            .request(MessageKind::InsertEntriesRequest, keys, values, destination)
            .await?;
        Ok(self.merge_entry_responses(&responses))
    }

    /// Delete `keys` on the destination, collecting actually deleted keys.
    pub async fn request_delete_entries(
        &self,
        keys: &HashSet<K>,
        destination: Destination,
    ) -> Result<HashSet<K>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let responses = self
            .request(
                MessageKind::DeleteEntriesRequest,
                self.encode_keys(keys)?,
                Vec::new(),
                destination,
            )
            .await?;
        Ok(self.union_key_responses(&responses))
    }

    /// Fire-and-forget notification carrying entries.
    pub fn notify_entries(
        &self,
        kind: MessageKind,
        entries: &HashMap<K, V>,
        destination: Option<EndpointId>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let (keys, values) = self.encode_entries(entries)?;
        self.notify(kind, keys, values, destination);
        Ok(())
    }

    /// Fire-and-forget notification carrying keys.
    pub fn notify_keys(
        &self,
        kind: MessageKind,
        keys: &HashSet<K>,
        destination: Option<EndpointId>,
    ) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let encoded = self.encode_keys(keys)?;
        self.notify(kind, encoded, Vec::new(), destination);
        Ok(())
    }

    pub(crate) fn notify(
        &self,
        kind: MessageKind,
        keys: Vec<Bytes>,
        values: Vec<Bytes>,
        destination: Option<EndpointId>,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut message = GridMessage::new(self.protocol, kind, self.local)
            .with_storage_id(self.config.storage_id.clone())
            .with_keys(keys)
            .with_values(values);
        message.destination = destination;
        self.bus.publish(message);
    }

    // ==================== correlation ====================

    /// Record one response; resolves the waiter on a complete set.
    pub(crate) fn on_response(&self, message: GridMessage) {
        let Some(correlation) = message.correlation_id else {
            warn!(
                endpoint = %self.local,
                storage = %self.config.storage_id,
                "response without correlation id dropped"
            );
            return;
        };
        let complete = {
            let Some(mut pending) = self.pending.get_mut(&correlation) else {
                debug!(
                    endpoint = %self.local,
                    correlation,
                    "late or unexpected response discarded"
                );
                return;
            };
            if !pending.remaining.remove(&message.source) {
                debug!(
                    endpoint = %self.local,
                    correlation,
                    source = %message.source,
                    "response from unexpected responder discarded"
                );
                return;
            }
            pending.received.push(message);
            pending.remaining.is_empty()
        };
        if complete {
            self.resolve(correlation);
        }
    }

    /// A detached responder satisfies its slot in every in-flight request.
    pub(crate) fn release_waiters_for(&self, peer: EndpointId) {
        let mut completed = Vec::new();
        for mut entry in self.pending.iter_mut() {
            if entry.remaining.remove(&peer) && entry.remaining.is_empty() {
                completed.push(*entry.key());
            }
        }
        for correlation in completed {
            self.resolve(correlation);
        }
    }

    fn resolve(&self, correlation: CorrelationId) {
        if let Some((_, mut pending)) = self.pending.remove(&correlation) {
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(pending.received);
            }
        }
    }

    // ==================== codecs ====================

    pub(crate) fn encode_keys<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a K>,
    ) -> Result<Vec<Bytes>>
    where
        K: 'a,
    {
        keys.into_iter()
            .map(|key| self.key_codec.encode(key).map_err(Into::into))
            .collect()
    }

    pub(crate) fn encode_entries(
        &self,
        entries: &HashMap<K, V>,
    ) -> Result<(Vec<Bytes>, Vec<Bytes>)> {
        let mut keys = Vec::with_capacity(entries.len());
        let mut values = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            keys.push(self.key_codec.encode(key)?);
            values.push(self.value_codec.encode(value)?);
        }
        Ok((keys, values))
    }

    pub(crate) fn decode_key_set(&self, message: &GridMessage) -> Result<HashSet<K>> {
        message
            .keys
            .iter()
            .map(|data| self.key_codec.decode(data).map_err(Into::into))
            .collect()
    }

    pub(crate) fn decode_entries(&self, message: &GridMessage) -> Result<Vec<(K, V)>> {
        if message.keys.len() != message.values.len() {
            return Err(CodecError::Decode(format!(
                "key/value arity mismatch: {} keys, {} values",
                message.keys.len(),
                message.values.len()
            ))
            .into());
        }
        message
            .keys
            .iter()
            .zip(message.values.iter())
            .map(|(key, value)| {
                Ok((self.key_codec.decode(key)?, self.value_codec.decode(value)?))
            })
            .collect()
    }

    /// Merge entry responses; on key collision the last writer wins, with a
    /// warning.
    pub(crate) fn merge_entry_responses(&self, responses: &[GridMessage]) -> HashMap<K, V> {
        let mut merged = HashMap::new();
        for response in responses {
            let entries = match self.decode_entries(response) {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(
                        endpoint = %self.local,
                        storage = %self.config.storage_id,
                        %error,
                        "dropping malformed response"
                    );
                    continue;
                }
            };
            for (key, value) in entries {
                if merged.insert(key, value).is_some() {
                    warn!(
                        endpoint = %self.local,
                        storage = %self.config.storage_id,
                        "duplicate key while merging responses, keeping last"
                    );
                }
            }
        }
        merged
    }

    pub(crate) fn union_key_responses(&self, responses: &[GridMessage]) -> HashSet<K> {
        let mut merged = HashSet::new();
        for response in responses {
            match self.decode_key_set(response) {
                Ok(keys) => merged.extend(keys),
                Err(error) => warn!(
                    endpoint = %self.local,
                    storage = %self.config.storage_id,
                    %error,
                    "dropping malformed response"
                ),
            }
        }
        merged
    }

    // ==================== inbound ====================

    pub(crate) fn respond_entries(
        &self,
        request: &GridMessage,
        kind: MessageKind,
        entries: &HashMap<K, V>,
    ) {
        if request.correlation_id.is_none() {
            warn!(
                endpoint = %self.local,
                storage = %self.config.storage_id,
                "request without correlation id dropped"
            );
            return;
        }
        let (keys, values) = match self.encode_entries(entries) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(endpoint = %self.local, %error, "failed to encode response");
                return;
            }
        };
        let mut response = request.respond(kind, self.local);
        response.keys = keys;
        response.values = values;
        self.bus.publish(response);
    }

    pub(crate) fn respond_keys(&self, request: &GridMessage, kind: MessageKind, keys: &HashSet<K>) {
        if request.correlation_id.is_none() {
            warn!(
                endpoint = %self.local,
                storage = %self.config.storage_id,
                "request without correlation id dropped"
            );
            return;
        }
        let encoded = match self.encode_keys(keys) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(endpoint = %self.local, %error, "failed to encode response");
                return;
            }
        };
        let mut response = request.respond(kind, self.local);
        response.keys = encoded;
        self.bus.publish(response);
    }

    /// Drive inbound dispatch for this endpoint.
    ///
    /// Bus messages run inline to preserve per-storage ordering; peer-event
    /// callbacks are spawned so a handler issuing its own requests (such as
    /// the replicated standalone dump) cannot stall response processing.
    pub(crate) async fn run_dispatch<H>(
        self: Arc<Self>,
        handler: Arc<H>,
        mut rx: mpsc::UnboundedReceiver<GridMessage>,
        mut events: broadcast::Receiver<PeerEvent>,
    ) where
        H: StorageHandlers<K, V> + 'static,
    {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(message) => self.dispatch(&handler, message).await,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(PeerEvent::Detached(peer)) => {
                        self.release_waiters_for(peer);
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.on_remote_endpoint_detached(peer).await;
                        });
                    }
                    Ok(PeerEvent::Joined(peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.on_remote_endpoint_joined(peer).await;
                        });
                    }
                    Ok(PeerEvent::LeaderChanged(leader)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.on_leader_changed(leader).await;
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            endpoint = %self.local,
                            storage = %self.config.storage_id,
                            skipped,
                            "peer event stream lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        debug!(
            endpoint = %self.local,
            storage = %self.config.storage_id,
            "endpoint dispatch stopped"
        );
    }

    async fn dispatch<H>(&self, handler: &Arc<H>, message: GridMessage)
    where
        H: StorageHandlers<K, V>,
    {
        if message.kind.is_response() {
            self.on_response(message);
            return;
        }
        match &message.kind {
            MessageKind::GetEntriesRequest => {
                let Ok(keys) = self.warn_decode(self.decode_key_set(&message)) else {
                    return;
                };
                let entries = handler.on_get_entries_request(keys).await;
                self.respond_entries(&message, MessageKind::GetEntriesResponse, &entries);
            }
            MessageKind::GetKeysRequest => {
                let keys = handler.on_get_keys_request().await;
                self.respond_keys(&message, MessageKind::GetKeysResponse, &keys);
            }
            MessageKind::UpdateEntriesRequest => {
                let Ok(entries) = self.warn_decode(self.decode_entries(&message)) else {
                    return;
                };
                let old = handler
                    .on_update_entries_request(entries.into_iter().collect(), message.source)
                    .await;
                self.respond_entries(&message, MessageKind::UpdateEntriesResponse, &old);
            }
            MessageKind::InsertEntriesRequest => {
                let Ok(entries) = self.warn_decode(self.decode_entries(&message)) else {
                    return;
                };
                let existing = handler
                    .on_insert_entries_request(entries.into_iter().collect(), message.source)
                    .await;
                self.respond_entries(&message, MessageKind::InsertEntriesResponse, &existing);
            }
            MessageKind::DeleteEntriesRequest => {
                let Ok(keys) = self.warn_decode(self.decode_key_set(&message)) else {
                    return;
                };
                let deleted = handler.on_delete_entries_request(keys, message.source).await;
                self.respond_keys(&message, MessageKind::DeleteEntriesResponse, &deleted);
            }
            MessageKind::UpdateEntriesNotification => {
                let Ok(entries) = self.warn_decode(self.decode_entries(&message)) else {
                    return;
                };
                handler
                    .on_update_entries_notification(entries.into_iter().collect(), message.source)
                    .await;
            }
            MessageKind::InsertEntriesNotification => {
                let Ok(entries) = self.warn_decode(self.decode_entries(&message)) else {
                    return;
                };
                handler
                    .on_insert_entries_notification(entries.into_iter().collect(), message.source)
                    .await;
            }
            MessageKind::DeleteEntriesNotification => {
                let Ok(keys) = self.warn_decode(self.decode_key_set(&message)) else {
                    return;
                };
                handler
                    .on_delete_entries_notification(keys, message.source)
                    .await;
            }
            other => {
                warn!(
                    endpoint = %self.local,
                    storage = %self.config.storage_id,
                    kind = ?other,
                    "unexpected message kind dropped"
                );
            }
        }
    }

    fn warn_decode<T>(&self, result: Result<T>) -> std::result::Result<T, ()> {
        result.map_err(|error| {
            warn!(
                endpoint = %self.local,
                storage = %self.config.storage_id,
                %error,
                "dropping malformed message"
            );
        })
    }
}
