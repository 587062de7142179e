//! Raft grid coordinator: leader election, log replication and membership.
//!
//! All raft state is owned by a single actor task; every mutation arrives as
//! a message (inbound bus traffic, submitted commands, shutdown). The actor
//! publishes membership and leadership changes through the shared
//! [`GridTopology`], which is what the distribution strategies consume.
//!
//! Membership is bus-driven: every peer broadcasts a `Hello` heartbeat, any
//! first valid raft message adds its source to the known-peers set, and a
//! peer silent past `peer_timeout` is detached. Elections only start once at
//! least one remote peer is known, so a standalone peer has no leader and its
//! replicated storages act locally.

pub mod log;

use crate::bus::MessageBus;
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::grid::message::{GridMessage, MessageKind, ProtocolTag};
use crate::grid::topology::GridTopology;
use crate::types::EndpointId;
use bytes::Bytes;
use rand::Rng;
use self::log::{LogEntry, RaftLog};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Maximum log entries shipped in one append message.
const MAX_APPEND_ENTRIES: usize = 64;

/// Role of a peer in the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Commands accepted by the raft actor.
pub(crate) enum RaftCommand {
    /// A raft-protocol message received from the bus.
    Inbound(GridMessage),

    /// Append an opaque command to the log; resolves once committed.
    Submit {
        payload: Bytes,
        tx: oneshot::Sender<Result<u64>>,
    },

    /// Stop the actor.
    Shutdown,
}

/// Handle to the raft actor owned by a grid.
pub struct RaftHandle {
    tx: mpsc::UnboundedSender<RaftCommand>,
    topology: Arc<GridTopology>,
    committed_tx: broadcast::Sender<LogEntry>,
}

impl RaftHandle {
    /// This peer's endpoint identifier.
    pub fn local_endpoint_id(&self) -> EndpointId {
        self.topology.local_endpoint_id()
    }

    /// The current leader, if one is known.
    pub fn current_leader(&self) -> Option<EndpointId> {
        self.topology.current_leader()
    }

    /// Whether this peer is the current leader.
    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.local_endpoint_id())
    }

    /// Snapshot of the known remote endpoints.
    pub fn remote_endpoint_ids(&self) -> HashSet<EndpointId> {
        self.topology.remote_endpoint_ids()
    }

    /// Append an opaque command to the replicated log. Resolves with the
    /// entry's index once it is committed on a majority.
    pub async fn submit_command(&self, payload: Bytes) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RaftCommand::Submit { payload, tx })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Follow committed log entries (no-op entries excluded).
    pub fn subscribe_committed(&self) -> broadcast::Receiver<LogEntry> {
        self.committed_tx.subscribe()
    }

    /// Route an inbound raft-protocol message to the actor.
    pub(crate) fn deliver(&self, message: GridMessage) {
        let _ = self.tx.send(RaftCommand::Inbound(message));
    }

    /// Stop the actor.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(RaftCommand::Shutdown);
    }
}

/// Spawn the raft actor for one grid.
pub(crate) fn spawn(
    config: RaftConfig,
    bus: Arc<dyn MessageBus>,
    topology: Arc<GridTopology>,
) -> RaftHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (committed_tx, _) = broadcast::channel(1024);

    let actor = RaftActor {
        id: topology.local_endpoint_id(),
        config,
        bus,
        topology: topology.clone(),
        role: Role::Follower,
        term: 0,
        voted_for: None,
        log: RaftLog::new(),
        commit_index: 0,
        last_applied: 0,
        leader: None,
        peers: HashMap::new(),
        votes: HashSet::new(),
        pending: BTreeMap::new(),
        committed_tx: committed_tx.clone(),
        election_deadline: Instant::now(),
        next_heartbeat: Instant::now(),
        rx,
    };
    tokio::spawn(actor.run());

    RaftHandle {
        tx,
        topology,
        committed_tx,
    }
}

/// Replication progress and liveness of one known peer.
struct PeerState {
    last_seen: Instant,
    next_index: u64,
    match_index: u64,
}

struct RaftActor {
    id: EndpointId,
    config: RaftConfig,
    bus: Arc<dyn MessageBus>,
    topology: Arc<GridTopology>,

    role: Role,
    term: u64,
    voted_for: Option<EndpointId>,
    log: RaftLog,
    commit_index: u64,
    last_applied: u64,
    leader: Option<EndpointId>,
    peers: HashMap<EndpointId, PeerState>,
    votes: HashSet<EndpointId>,

    /// Proposals waiting for their commit, indexed by log index.
    pending: BTreeMap<u64, oneshot::Sender<Result<u64>>>,
    committed_tx: broadcast::Sender<LogEntry>,

    election_deadline: Instant,
    next_heartbeat: Instant,
    rx: mpsc::UnboundedReceiver<RaftCommand>,
}

impl RaftActor {
    async fn run(mut self) {
        self.reset_election_deadline();
        self.next_heartbeat = Instant::now();

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(RaftCommand::Inbound(message)) => self.handle_message(message),
                    Some(RaftCommand::Submit { payload, tx }) => self.handle_submit(payload, tx),
                    Some(RaftCommand::Shutdown) | None => break,
                },
                _ = sleep_until(deadline) => self.tick(),
            }
        }

        for (_, tx) in std::mem::take(&mut self.pending) {
            let _ = tx.send(Err(RaftError::Shutdown.into()));
        }
        debug!(endpoint = %self.id, "raft actor stopped");
    }

    fn next_deadline(&self) -> Instant {
        if self.role == Role::Leader {
            self.next_heartbeat
        } else {
            self.next_heartbeat.min(self.election_deadline)
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        if now >= self.next_heartbeat {
            self.broadcast_hello();
            if self.role == Role::Leader {
                self.send_append_to_all();
            }
            self.check_peer_timeouts(now);
            self.next_heartbeat = now + self.config.heartbeat_interval;
        }
        if self.role != Role::Leader && now >= self.election_deadline {
            self.start_election();
        }
    }

    fn reset_election_deadline(&mut self) {
        let min = self.config.min_election_timeout;
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=min);
        self.election_deadline = Instant::now() + min + jitter;
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn publish(&self, message: GridMessage) {
        self.bus.publish(message);
    }

    fn raft_message(&self, kind: MessageKind) -> GridMessage {
        GridMessage::new(ProtocolTag::Raft, kind, self.id).with_term(self.term)
    }

    fn broadcast_hello(&self) {
        self.publish(self.raft_message(MessageKind::Hello));
    }

    /// Track liveness of the message source, adding it on first contact.
    fn observe_peer(&mut self, peer: EndpointId) {
        if peer == self.id {
            return;
        }
        let now = Instant::now();
        let next_index = self.log.last_index() + 1;
        let state = self.peers.entry(peer).or_insert_with(|| PeerState {
            last_seen: now,
            next_index,
            match_index: 0,
        });
        state.last_seen = now;
        self.topology.add_peer(peer);
    }

    fn check_peer_timeouts(&mut self, now: Instant) {
        let timeout = self.config.peer_timeout;
        let stale: Vec<EndpointId> = self
            .peers
            .iter()
            .filter(|(_, state)| now.duration_since(state.last_seen) > timeout)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in stale {
            self.peers.remove(&peer);
            self.topology.remove_peer(peer);
            if self.leader == Some(peer) {
                self.leader = None;
                self.topology.set_leader(None);
            }
        }
    }

    /// Adopt a higher term observed on any message.
    fn maybe_step_down(&mut self, term: u64) {
        if term <= self.term {
            return;
        }
        self.term = term;
        self.voted_for = None;
        self.votes.clear();
        if self.role == Role::Leader {
            self.fail_pending(RaftError::ProposalDropped);
        }
        self.role = Role::Follower;
        if self.leader.is_some() {
            self.leader = None;
            self.topology.set_leader(None);
        }
    }

    fn fail_pending(&mut self, error: RaftError) {
        for (_, tx) in std::mem::take(&mut self.pending) {
            let _ = tx.send(Err(match &error {
                RaftError::ProposalDropped => RaftError::ProposalDropped.into(),
                _ => RaftError::Shutdown.into(),
            }));
        }
    }

    fn handle_message(&mut self, message: GridMessage) {
        if message.source == self.id {
            return;
        }
        self.observe_peer(message.source);
        let source = message.source;
        let term = message.term;
        match message.kind {
            MessageKind::Hello => self.maybe_step_down(term),
            MessageKind::VoteRequest {
                last_log_index,
                last_log_term,
            } => self.on_vote_request(source, term, last_log_index, last_log_term),
            MessageKind::VoteResponse { granted } => self.on_vote_response(source, term, granted),
            MessageKind::AppendEntriesRequest {
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            } => self.on_append_request(
                source,
                term,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            ),
            MessageKind::AppendEntriesResponse {
                success,
                match_index,
            } => self.on_append_response(source, term, success, match_index),
            other => {
                warn!(endpoint = %self.id, kind = ?other, "unexpected kind on raft protocol");
            }
        }
    }

    fn start_election(&mut self) {
        if self.peers.is_empty() {
            // Standalone peers do not elect themselves; they act locally
            // until another endpoint appears.
            self.reset_election_deadline();
            return;
        }
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id);
        self.votes.clear();
        self.votes.insert(self.id);
        if self.leader.is_some() {
            self.leader = None;
            self.topology.set_leader(None);
        }
        info!(endpoint = %self.id, term = self.term, "starting election");

        let request = self.raft_message(MessageKind::VoteRequest {
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        });
        self.publish(request);
        self.reset_election_deadline();
    }

    fn on_vote_request(
        &mut self,
        candidate: EndpointId,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) {
        self.maybe_step_down(term);

        let up_to_date = last_log_term > self.log.last_term()
            || (last_log_term == self.log.last_term() && last_log_index >= self.log.last_index());
        let granted = term == self.term
            && up_to_date
            && (self.voted_for.is_none() || self.voted_for == Some(candidate));
        if granted {
            self.voted_for = Some(candidate);
            self.reset_election_deadline();
        }
        debug!(
            endpoint = %self.id,
            candidate = %candidate,
            term,
            granted,
            "vote request"
        );

        let response = self
            .raft_message(MessageKind::VoteResponse { granted })
            .with_destination(candidate);
        self.publish(response);
    }

    fn on_vote_response(&mut self, voter: EndpointId, term: u64, granted: bool) {
        if term > self.term {
            self.maybe_step_down(term);
            return;
        }
        if self.role != Role::Candidate || term != self.term || !granted {
            return;
        }
        self.votes.insert(voter);
        if self.votes.len() >= self.majority() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        info!(endpoint = %self.id, term = self.term, "elected leader");
        self.role = Role::Leader;
        self.leader = Some(self.id);
        let next_index = self.log.last_index() + 1;
        for state in self.peers.values_mut() {
            state.next_index = next_index;
            state.match_index = 0;
        }
        // Commit anchor: entries from earlier terms only commit once an entry
        // of the current term is replicated.
        self.log.append(self.term, Bytes::new());
        self.topology.set_leader(Some(self.id));
        self.send_append_to_all();
        self.next_heartbeat = Instant::now() + self.config.heartbeat_interval;
    }

    fn send_append_to_all(&mut self) {
        let peers: Vec<EndpointId> = self.peers.keys().copied().collect();
        for peer in peers {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, peer: EndpointId) {
        let Some(state) = self.peers.get(&peer) else {
            return;
        };
        let next_index = state.next_index.max(1);
        let prev_log_index = next_index - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self.log.entries_from(next_index, MAX_APPEND_ENTRIES);

        let request = self
            .raft_message(MessageKind::AppendEntriesRequest {
                prev_log_index,
                prev_log_term,
                leader_commit: self.commit_index,
                entries,
            })
            .with_destination(peer);
        self.publish(request);
    }

    fn on_append_request(
        &mut self,
        leader: EndpointId,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        leader_commit: u64,
        entries: Vec<LogEntry>,
    ) {
        if term < self.term {
            let response = self
                .raft_message(MessageKind::AppendEntriesResponse {
                    success: false,
                    match_index: 0,
                })
                .with_destination(leader);
            self.publish(response);
            return;
        }
        self.maybe_step_down(term);
        if self.role != Role::Follower {
            // A candidate yields to the current-term leader.
            self.role = Role::Follower;
            self.votes.clear();
        }
        if self.leader != Some(leader) {
            self.leader = Some(leader);
            self.topology.set_leader(Some(leader));
        }
        self.reset_election_deadline();

        let appended_up_to = prev_log_index + entries.len() as u64;
        let success = self.log.try_append(prev_log_index, prev_log_term, entries);
        let match_index = if success {
            appended_up_to
        } else {
            // Conflict hint: the highest index worth probing next.
            self.log.last_index().min(prev_log_index.saturating_sub(1))
        };

        if success {
            let new_commit = leader_commit.min(self.log.last_index());
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
                self.apply_committed();
            }
        }

        let response = self
            .raft_message(MessageKind::AppendEntriesResponse {
                success,
                match_index,
            })
            .with_destination(leader);
        self.publish(response);
    }

    fn on_append_response(
        &mut self,
        follower: EndpointId,
        term: u64,
        success: bool,
        match_index: u64,
    ) {
        if term > self.term {
            self.maybe_step_down(term);
            return;
        }
        if self.role != Role::Leader || term != self.term {
            return;
        }
        let last_index = self.log.last_index();
        let Some(state) = self.peers.get_mut(&follower) else {
            return;
        };

        if success {
            if match_index > state.match_index {
                state.match_index = match_index;
            }
            state.next_index = state.next_index.max(state.match_index + 1);
            let more = state.next_index <= last_index;
            self.advance_commit();
            if more {
                self.send_append(follower);
            }
        } else {
            let probe = (match_index + 1).min(state.next_index.saturating_sub(1));
            state.next_index = probe.max(1);
            self.send_append(follower);
        }
    }

    fn advance_commit(&mut self) {
        let last_index = self.log.last_index();
        for n in ((self.commit_index + 1)..=last_index).rev() {
            if self.log.term_at(n) != Some(self.term) {
                continue;
            }
            let replicas =
                1 + self.peers.values().filter(|p| p.match_index >= n).count();
            if replicas >= self.majority() {
                self.commit_index = n;
                self.apply_committed();
                break;
            }
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let Some(entry) = self.log.entry_at(self.last_applied) else {
                break;
            };
            let entry = entry.clone();
            if let Some(tx) = self.pending.remove(&entry.index) {
                let _ = tx.send(Ok(entry.index));
            }
            if !entry.payload.is_empty() {
                let _ = self.committed_tx.send(entry);
            }
        }
    }

    fn handle_submit(&mut self, payload: Bytes, tx: oneshot::Sender<Result<u64>>) {
        if self.role != Role::Leader {
            let _ = tx.send(Err(RaftError::NotLeader {
                leader: self.leader,
            }
            .into()));
            return;
        }
        let index = self.log.append(self.term, payload);
        self.pending.insert(index, tx);
        // Commits immediately when no peers remain attached.
        self.advance_commit();
        self.send_append_to_all();
    }
}
