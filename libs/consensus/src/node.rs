//! Core consensus node implementation
//!
//! All state transitions of a node run one at a time on a single tokio task
//! that consumes three kinds of events: inbound peer messages, client
//! commands, and timer fires. Nothing in the loop blocks on a peer: every
//! send is fire-and-forget and replies arrive later as events.

use crate::config::{ClusterConfig, RaftConfig};
use crate::log::RaftLog;
use crate::replication::ReplicationProgress;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, Message, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::state::{NodeState, RaftRole};
use crate::storage::PersistentStore;
use crate::timer::{random_election_timeout, Timer, TimerFired, TimerKind};
use crate::transport::Transport;
use crate::types::{LogIndex, NodeId, Term};
use crate::{RaftError, Result};

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Consumer of committed commands
///
/// `apply` is called once per committed command, in strictly increasing index
/// order. Indexes may skip: the empty entries a new leader appends are never
/// handed over. After a restart the node replays its committed log from
/// index 1, so an implementation must treat a repeated index as a no-op.
pub trait CommandApplier: Send + 'static {
    fn apply(&mut self, index: LogIndex, command: &[u8]);
}

/// Outcome of submitting a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Appended to the leader's log. Not yet committed.
    Accepted { index: LogIndex, term: Term },

    /// This node is not the leader; retry against `leader_hint` if known
    Rejected { leader_hint: Option<NodeId> },
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }

    pub fn index(&self) -> Option<LogIndex> {
        match self {
            SubmitOutcome::Accepted { index, .. } => Some(*index),
            SubmitOutcome::Rejected { .. } => None,
        }
    }

    /// The accepted index, or `NotLeader` carrying the hint
    pub fn into_index(self) -> Result<LogIndex> {
        match self {
            SubmitOutcome::Accepted { index, .. } => Ok(index),
            SubmitOutcome::Rejected { leader_hint } => Err(RaftError::NotLeader(leader_hint)),
        }
    }
}

/// Point-in-time view of a node for dashboards and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub leader_id: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    /// Set once the node has stopped after a persistence failure
    pub fault: Option<String>,
}

/// Commands sent to the node's event loop
enum RaftCommand {
    /// Append a new command (only works on leader)
    Submit {
        command: Vec<u8>,
        response: oneshot::Sender<Result<SubmitOutcome>>,
    },

    /// A message from a peer
    Deliver(Envelope),
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct RaftNode {
    id: NodeId,
    command_tx: mpsc::UnboundedSender<RaftCommand>,
    status_rx: watch::Receiver<NodeStatus>,
    commit_rx: watch::Receiver<LogIndex>,
    shutdown: CancellationToken,
    max_command_bytes: usize,
}

impl RaftNode {
    /// Recover state from `store` and start the node's event loop
    ///
    /// Must be called from within a tokio runtime. The node starts as a
    /// follower regardless of the role it had before a restart.
    pub fn start<A: CommandApplier>(
        cluster: &ClusterConfig,
        store: Box<dyn PersistentStore>,
        transport: Arc<dyn Transport>,
        applier: A,
    ) -> Result<Self> {
        cluster.validate()?;

        let id = cluster.node_id;
        let log = RaftLog::open(store)?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let state = NodeState::new(id, cluster.peer_ids());
        let initial = NodeStatus {
            id,
            role: state.role,
            term: log.term(),
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            last_log_index: log.last_index(),
            leader_id: None,
            voted_for: log.voted_for(),
            fault: None,
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let (commit_tx, commit_rx) = watch::channel(LogIndex::ZERO);

        info!(
            "Node {} starting at {} with {} log entries",
            id,
            log.term(),
            log.last_index().0
        );

        let core = RaftCore {
            state,
            log,
            config: cluster.raft.clone(),
            progress: None,
            transport,
            applier,
            election_timer: Timer::new(TimerKind::Election, timer_tx.clone()),
            heartbeat_timer: Timer::new(TimerKind::Heartbeat, timer_tx),
            status_tx,
            commit_tx,
            fault: None,
        };

        let shutdown = CancellationToken::new();
        tokio::spawn(run_node(core, command_rx, timer_rx, shutdown.clone()));

        Ok(RaftNode {
            id,
            command_tx,
            status_rx,
            commit_rx,
            shutdown,
            max_command_bytes: cluster.raft.max_command_bytes(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Submit a command for replication
    ///
    /// Returns as soon as the leader has durably appended the command to its
    /// own log; it does not wait for commit. Use `subscribe_commits` or
    /// `wait_for_commit` to observe commitment.
    ///
    /// Empty commands are reserved for the leader's own use, and commands
    /// that cannot fit in one AppendEntries frame are refused up front.
    pub async fn submit_command(&self, command: Vec<u8>) -> Result<SubmitOutcome> {
        if command.is_empty() {
            return Err(RaftError::InvalidCommand("command is empty".into()));
        }
        if command.len() > self.max_command_bytes {
            return Err(RaftError::InvalidCommand(format!(
                "{} bytes exceeds the {} byte limit",
                command.len(),
                self.max_command_bytes
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Submit {
                command,
                response: tx,
            })
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Hand an inbound peer message to the node. Never blocks.
    pub fn deliver(&self, envelope: Envelope) {
        // A stopped node simply loses the message.
        let _ = self.command_tx.send(RaftCommand::Deliver(envelope));
    }

    /// Current role, term, commit index and leader, without blocking
    pub fn status(&self) -> NodeStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<NodeStatus> {
        self.status_rx.clone()
    }

    /// Notified every time the commit index advances
    pub fn subscribe_commits(&self) -> watch::Receiver<LogIndex> {
        self.commit_rx.clone()
    }

    /// Wait until this node has committed `index`
    pub async fn wait_for_commit(&self, index: LogIndex) -> Result<()> {
        let mut commits = self.commit_rx.clone();
        commits
            .wait_for(|&commit| commit >= index)
            .await
            .map(|_| ())
            .map_err(|_| RaftError::ShuttingDown)
    }

    /// Stop the event loop. Durable state is left as it is.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the event loop has exited
    pub async fn stopped(&self) {
        self.command_tx.closed().await;
    }
}

/// The state machine proper, owned by the event loop task
struct RaftCore<A> {
    state: NodeState,
    log: RaftLog,
    config: RaftConfig,
    /// Present only while leader
    progress: Option<ReplicationProgress>,
    transport: Arc<dyn Transport>,
    applier: A,
    election_timer: Timer,
    heartbeat_timer: Timer,
    status_tx: watch::Sender<NodeStatus>,
    commit_tx: watch::Sender<LogIndex>,
    fault: Option<String>,
}

impl<A: CommandApplier> RaftCore<A> {
    fn id(&self) -> NodeId {
        self.state.id
    }

    fn term(&self) -> Term {
        self.log.term()
    }

    fn send(&self, to: NodeId, message: Message) {
        self.transport.send(Envelope::new(self.id(), to, message));
    }

    fn reset_election_timer(&mut self) {
        let timeout = random_election_timeout(
            self.config.election_timeout_min,
            self.config.election_timeout_max,
        );
        self.election_timer.reset(timeout);
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id(),
            role: self.state.role,
            term: self.term(),
            commit_index: self.state.volatile.commit_index,
            last_applied: self.state.volatile.last_applied,
            last_log_index: self.log.last_index(),
            leader_id: self.state.leader_id,
            voted_for: self.log.voted_for(),
            fault: self.fault.clone(),
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    /// Stop participating after a persistence failure. Continuing would mean
    /// acting on state that may not be durable.
    fn halt(&mut self, err: &RaftError) {
        if self.fault.is_some() {
            return;
        }
        error!(
            "Node {} halting after persistence failure: {}",
            self.id(),
            err
        );
        self.fault = Some(err.to_string());
        self.state.become_follower(None);
        self.progress = None;
        self.election_timer.cancel();
        self.heartbeat_timer.cancel();
    }

    fn on_timer(&mut self, fired: TimerFired) -> Result<()> {
        match fired.kind {
            TimerKind::Election => {
                if !self.election_timer.accept(fired) {
                    trace!(node = %self.id(), "Ignoring stale election timer");
                    return Ok(());
                }
                if self.state.role != RaftRole::Leader {
                    self.start_election()?;
                }
            }
            TimerKind::Heartbeat => {
                if !self.heartbeat_timer.accept(fired) {
                    trace!(node = %self.id(), "Ignoring stale heartbeat timer");
                    return Ok(());
                }
                match self.state.role {
                    RaftRole::Leader => self.broadcast_append_entries()?,
                    RaftRole::Candidate => self.resend_vote_requests(),
                    RaftRole::Follower => return Ok(()),
                }
                self.heartbeat_timer.reset(self.config.heartbeat_interval);
            }
        }
        Ok(())
    }

    /// Adopt a higher term and revert to follower
    fn step_down(&mut self, term: Term, leader: Option<NodeId>) -> Result<()> {
        let was = self.state.role;
        if term > self.term() {
            self.log.set_term_and_vote(term, None)?;
        }
        self.state.become_follower(leader);
        self.progress = None;
        self.heartbeat_timer.cancel();
        if was == RaftRole::Leader || !self.election_timer.is_armed() {
            self.reset_election_timer();
        }
        if was != RaftRole::Follower {
            info!(
                "Node {} stepping down from {} at {}",
                self.id(),
                was,
                self.term()
            );
        }
        Ok(())
    }

    fn start_election(&mut self) -> Result<()> {
        let term = self.term().next();
        // The vote for ourselves must be durable before anyone hears of it
        self.log.set_term_and_vote(term, Some(self.id()))?;
        self.state.become_candidate();
        self.progress = None;

        info!(
            "Node {} starting election for {} (last log {} at {})",
            self.id(),
            term,
            self.log.last_index(),
            self.log.last_term()
        );

        self.reset_election_timer();

        if self.has_vote_majority() {
            return self.become_leader();
        }

        self.heartbeat_timer.reset(self.config.heartbeat_interval);
        self.resend_vote_requests();
        Ok(())
    }

    fn has_vote_majority(&self) -> bool {
        self.state
            .candidate_state
            .as_ref()
            .map(|c| c.has_majority(self.state.cluster_size()))
            .unwrap_or(false)
    }

    /// Ask every peer that has not answered yet for its vote
    fn resend_vote_requests(&self) {
        let Some(candidate) = self.state.candidate_state.as_ref() else {
            return;
        };
        let request = RequestVoteRequest {
            term: self.term(),
            candidate_id: self.id(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for &peer in &self.state.peers {
            if !candidate.responded.contains(&peer) {
                self.send(peer, Message::RequestVote(request.clone()));
            }
        }
    }

    fn become_leader(&mut self) -> Result<()> {
        self.state.become_leader();
        self.progress = Some(ReplicationProgress::new(
            &self.state.peers,
            self.log.last_index(),
        ));
        self.election_timer.cancel();

        info!("Node {} became leader for {}", self.id(), self.term());

        // Entries from earlier terms only commit beneath one of our own, so
        // an uncommitted tail needs an empty entry to carry it.
        if self.log.last_index() > self.state.volatile.commit_index {
            let index = self.log.append_command(self.term(), Vec::new())?;
            debug!("Node {} appended empty entry at {}", self.id(), index);
        }

        // A lone node commits on its own
        self.advance_commit_index()?;
        self.broadcast_append_entries()?;
        self.heartbeat_timer.reset(self.config.heartbeat_interval);
        Ok(())
    }

    fn handle_message(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { from, to, message } = envelope;
        if to != self.id() || !self.state.peers.contains(&from) {
            warn!(node = %self.id(), %from, %to, "Dropping message from outside the cluster");
            return Ok(());
        }

        trace!(node = %self.id(), %from, kind = message.kind(), term = %message.term(), "Received");

        let claimed = match &message {
            Message::RequestVote(req) => Some(req.candidate_id),
            Message::AppendEntries(req) => Some(req.leader_id),
            _ => None,
        };
        if claimed.is_some_and(|claimed| claimed != from) {
            warn!(node = %self.id(), %from, ?claimed, "Dropping message sent on behalf of another node");
            return Ok(());
        }

        if message.term() > self.term() {
            let leader = match &message {
                Message::AppendEntries(_) => Some(from),
                _ => None,
            };
            debug!(
                "Node {} saw {} from {}, adopting it",
                self.id(),
                message.term(),
                from
            );
            self.step_down(message.term(), leader)?;
        }

        match message {
            Message::RequestVote(req) => self.handle_request_vote(from, req),
            Message::RequestVoteResponse(resp) => self.handle_vote_response(from, resp),
            Message::AppendEntries(req) => self.handle_append_entries(from, req),
            Message::AppendEntriesResponse(resp) => self.handle_append_response(from, resp),
        }
    }

    fn handle_request_vote(&mut self, from: NodeId, req: RequestVoteRequest) -> Result<()> {
        let term = self.term();
        let mut vote_granted = false;

        if req.term == term {
            let can_vote = match self.log.voted_for() {
                None => true,
                Some(v) => v == req.candidate_id,
            };
            let log_ok = self.log.is_up_to_date(req.last_log_index, req.last_log_term);

            if can_vote && log_ok {
                if self.log.voted_for().is_none() {
                    self.log.set_term_and_vote(term, Some(req.candidate_id))?;
                }
                vote_granted = true;
                self.reset_election_timer();

                debug!(
                    "Node {} granted vote to {} for {}",
                    self.id(),
                    req.candidate_id,
                    term
                );
            } else {
                debug!(
                    node = %self.id(),
                    candidate = %req.candidate_id,
                    %term,
                    can_vote,
                    log_ok,
                    "Vote denied"
                );
            }
        }

        self.send(
            from,
            Message::RequestVoteResponse(RequestVoteResponse { term, vote_granted }),
        );
        Ok(())
    }

    fn handle_vote_response(&mut self, from: NodeId, resp: RequestVoteResponse) -> Result<()> {
        if self.state.role != RaftRole::Candidate || resp.term != self.term() {
            return Ok(());
        }
        if let Some(candidate) = self.state.candidate_state.as_mut() {
            candidate.record_response(from, resp.vote_granted);
        }
        if self.has_vote_majority() {
            self.become_leader()?;
        }
        Ok(())
    }

    fn handle_append_entries(&mut self, from: NodeId, req: AppendEntriesRequest) -> Result<()> {
        let term = self.term();
        if req.term < term {
            self.send(
                from,
                Message::AppendEntriesResponse(AppendEntriesResponse::rejected(term)),
            );
            return Ok(());
        }

        if self.state.role == RaftRole::Leader {
            // Two leaders in one term cannot happen; refuse rather than follow
            error!(
                "Node {} received AppendEntries from {} while leading {}",
                self.id(),
                from,
                term
            );
            return Ok(());
        }

        if self.state.role == RaftRole::Candidate {
            self.step_down(term, Some(req.leader_id))?;
        }
        self.state.leader_id = Some(req.leader_id);
        self.reset_election_timer();

        // Consistency check on the entry preceding the new ones
        if req.prev_log_index > self.log.last_index() {
            let response = AppendEntriesResponse::conflict(term, None, self.log.last_index().next());
            self.send(from, Message::AppendEntriesResponse(response));
            return Ok(());
        }
        if !self.log.matches(req.prev_log_index, req.prev_log_term) {
            let conflict_term = self.log.term_at(req.prev_log_index);
            let conflict_index = match conflict_term {
                Some(t) => self.log.first_index_of_term(t, req.prev_log_index),
                None => req.prev_log_index,
            };
            debug!(
                node = %self.id(),
                prev_log_index = %req.prev_log_index,
                ?conflict_term,
                %conflict_index,
                "Log mismatch"
            );
            let response = AppendEntriesResponse::conflict(term, conflict_term, conflict_index);
            self.send(from, Message::AppendEntriesResponse(response));
            return Ok(());
        }

        let last_new_index = req.last_index();
        self.log
            .splice(req.entries, self.state.volatile.commit_index)?;

        if req.leader_commit > self.state.volatile.commit_index {
            let commit = req.leader_commit.min(last_new_index);
            if commit > self.state.volatile.commit_index {
                self.set_commit_index(commit);
            }
        }

        self.send(
            from,
            Message::AppendEntriesResponse(AppendEntriesResponse::accepted(term, last_new_index)),
        );
        Ok(())
    }

    fn handle_append_response(&mut self, from: NodeId, resp: AppendEntriesResponse) -> Result<()> {
        if self.state.role != RaftRole::Leader || resp.term != self.term() {
            return Ok(());
        }
        let Some(progress) = self.progress.as_mut() else {
            return Ok(());
        };

        if resp.success {
            if progress.on_acknowledge(from, resp.match_index) {
                self.advance_commit_index()?;
            }
        } else if !progress.on_reject(from, resp.conflict_term, resp.conflict_index, &self.log) {
            return Ok(());
        }

        // Keep a lagging follower moving without waiting for the next heartbeat
        let behind = self
            .progress
            .as_ref()
            .and_then(|p| p.get(from))
            .map(|p| p.next_index <= self.log.last_index())
            .unwrap_or(false);
        if behind || !resp.success {
            self.send_append_entries(from)?;
        }
        Ok(())
    }

    fn send_append_entries(&self, peer: NodeId) -> Result<()> {
        let Some(progress) = self.progress.as_ref().and_then(|p| p.get(peer)) else {
            return Ok(());
        };
        let prev_log_index = progress.next_index.prev();
        let prev_log_term = self.log.term_at(prev_log_index).ok_or_else(|| {
            RaftError::Internal(format!(
                "next index {} for {} is beyond the log",
                progress.next_index, peer
            ))
        })?;
        let entries = self.log.entries_from(
            progress.next_index,
            self.config.max_append_entries,
            self.config.max_batch_bytes(),
        );

        let request = AppendEntriesRequest {
            term: self.term(),
            leader_id: self.id(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.state.volatile.commit_index,
        };
        if !request.is_heartbeat() {
            trace!(
                node = %self.id(),
                %peer,
                from = %progress.next_index,
                count = request.entries.len(),
                "Replicating"
            );
        }

        self.send(peer, Message::AppendEntries(request));
        Ok(())
    }

    fn broadcast_append_entries(&self) -> Result<()> {
        for &peer in &self.state.peers {
            self.send_append_entries(peer)?;
        }
        Ok(())
    }

    fn advance_commit_index(&mut self) -> Result<()> {
        let Some(progress) = self.progress.as_ref() else {
            return Ok(());
        };
        let log = &self.log;
        let commit = progress.commit_index(
            log.last_index(),
            log.term(),
            self.state.volatile.commit_index,
            |i| log.term_at(i),
        );
        if let Some(commit) = commit {
            self.set_commit_index(commit);
        }
        Ok(())
    }

    /// Record a new commit index and hand newly committed entries to the applier
    fn set_commit_index(&mut self, commit: LogIndex) {
        debug!(
            "Node {} advancing commit index {} -> {}",
            self.id(),
            self.state.volatile.commit_index,
            commit
        );
        self.state.volatile.commit_index = commit;

        let from = self.state.volatile.last_applied;
        for entry in self.log.committed_range(from, commit) {
            if !entry.command.is_empty() {
                self.applier.apply(entry.index, &entry.command);
            }
            self.state.volatile.last_applied = entry.index;
        }
        self.commit_tx.send_replace(commit);
    }

    fn handle_submit(&mut self, command: Vec<u8>) -> Result<SubmitOutcome> {
        if self.state.role != RaftRole::Leader {
            return Ok(SubmitOutcome::Rejected {
                leader_hint: self.state.leader_id,
            });
        }

        let term = self.term();
        let index = self.log.append_command(term, command)?;
        debug!("Node {} appended {} at {}", self.id(), index, term);

        self.advance_commit_index()?;
        self.broadcast_append_entries()?;
        Ok(SubmitOutcome::Accepted { index, term })
    }
}

/// Main node event loop
async fn run_node<A: CommandApplier>(
    mut core: RaftCore<A>,
    mut command_rx: mpsc::UnboundedReceiver<RaftCommand>,
    mut timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    shutdown: CancellationToken,
) {
    core.reset_election_timer();
    core.publish_status();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Node {} shutting down", core.id());
                break;
            }

            Some(fired) = timer_rx.recv() => {
                if core.fault.is_none() {
                    if let Err(e) = core.on_timer(fired) {
                        core.halt(&e);
                    }
                }
            }

            cmd = command_rx.recv() => match cmd {
                Some(RaftCommand::Submit { command, response }) => {
                    let result = if let Some(fault) = core.fault.clone() {
                        Err(RaftError::Halted(fault))
                    } else {
                        core.handle_submit(command).map_err(|e| {
                            core.halt(&e);
                            RaftError::Halted(e.to_string())
                        })
                    };
                    let _ = response.send(result);
                }
                Some(RaftCommand::Deliver(envelope)) => {
                    if core.fault.is_none() {
                        if let Err(e) = core.handle_message(envelope) {
                            core.halt(&e);
                        }
                    }
                }
                None => break,
            },
        }

        core.publish_status();
    }

    core.election_timer.cancel();
    core.heartbeat_timer.cancel();
}
