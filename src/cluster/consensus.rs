//! Leader-Based Consensus
//!
//! Raft-family consensus over a replicated in-memory log. Exactly one leader
//! per term; a record id commits once the leader has replicated its log entry
//! to a majority including itself. Record payloads travel via the replicator,
//! so log entries carry `(term, record_id)` pairs only.
//!
//! All protocol state lives under a single lock. Nothing is sent while the
//! lock is held: every RPC snapshots its arguments under the lock, performs
//! the I/O, then re-acquires the lock to publish the outcome.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::ClusterContext;
use crate::config::{secs, ConsensusSettings};
use crate::rpc::wire::{AppendArgs, AppendReply, VoteArgs, VoteReply};

/// Scheduling tick of the consensus loop.
const TICK: Duration = Duration::from_millis(100);

/// Slack added to the configured consensus timeout when waiting for quorum.
const QUORUM_WAIT_SLACK: f64 = 0.5;

/// Role of a node within the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    /// Default role; follows a leader, times out into candidacy
    Follower,
    /// Soliciting votes for a new term
    Candidate,
    /// Sole proposer for the current term
    Leader,
}

/// One replicated log position: the term it was proposed in and the id of
/// the record it commits. Serialised on the wire as a `[term, id]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, String)", into = "(u64, String)")]
pub struct LogEntry {
    /// Term the entry was created in
    pub term: u64,
    /// Id of the record this entry commits
    pub record_id: String,
}

impl From<(u64, String)> for LogEntry {
    fn from((term, record_id): (u64, String)) -> Self {
        Self { term, record_id }
    }
}

impl From<LogEntry> for (u64, String) {
    fn from(entry: LogEntry) -> Self {
        (entry.term, entry.record_id)
    }
}

/// Consensus state snapshot for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct ConsensusStatus {
    /// Current role
    pub role: RaftRole,
    /// Current term
    pub term: u64,
    /// Known leader, if any
    pub leader: Option<String>,
    /// Log length
    pub log_length: u64,
    /// Highest committed index
    pub commit_index: u64,
    /// Highest applied index
    pub last_applied: u64,
}

struct RaftState {
    role: RaftRole,
    current_term: u64,
    voted_for: Option<String>,
    current_leader: Option<String>,
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    votes_received: HashSet<String>,
    election_deadline: Instant,
    last_heartbeat: Instant,
}

impl RaftState {
    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    /// Advance `last_applied` to `commit_index`, returning the record ids of
    /// the newly applied entries. Payload application happens outside the
    /// consensus lock.
    fn advance_applied(&mut self) -> Vec<String> {
        let mut applied = Vec::new();
        while self.last_applied < self.commit_index && self.last_applied < self.last_log_index() {
            self.last_applied += 1;
            let entry = &self.log[self.last_applied as usize - 1];
            applied.push(entry.record_id.clone());
        }
        applied
    }

    fn step_down(&mut self, term: u64) {
        self.current_term = term;
        self.role = RaftRole::Follower;
        self.voted_for = None;
        self.current_leader = None;
        self.votes_received.clear();
    }
}

/// The consensus service: election timers, vote and append handlers, and
/// majority replication of proposed records.
pub struct Consensus {
    ctx: Arc<ClusterContext>,
    settings: ConsensusSettings,
    state: Mutex<RaftState>,
    running: AtomicBool,
    shutdown: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Consensus {
    /// Create a follower with an empty log.
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        let settings = ctx.config.consensus.clone();
        let election_deadline = Instant::now() + random_election_timeout(&settings);
        Self {
            ctx,
            settings,
            state: Mutex::new(RaftState {
                role: RaftRole::Follower,
                current_term: 0,
                voted_for: None,
                current_leader: None,
                log: Vec::new(),
                commit_index: 0,
                last_applied: 0,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                votes_received: HashSet::new(),
                election_deadline,
                last_heartbeat: Instant::now(),
            }),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the consensus loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting consensus service");

        {
            let mut state = self.state.lock();
            let next = state.last_log_index() + 1;
            for peer in self.ctx.peers() {
                state.next_index.insert(peer.clone(), next);
                state.match_index.insert(peer, 0);
            }
            state.election_deadline = Instant::now() + random_election_timeout(&self.settings);
        }

        let consensus = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while consensus.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(TICK) => {}
                    _ = consensus.shutdown.notified() => break,
                }
                consensus.tick();
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop the consensus loop, joining within the shutdown grace period.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = tokio::time::timeout(crate::SHUTDOWN_GRACE, handle).await;
        }
        info!("consensus service stopped");
    }

    /// Whether this node currently leads.
    pub fn is_leader(&self) -> bool {
        self.state.lock().role == RaftRole::Leader
    }

    /// Known leader's node id, if any.
    pub fn leader(&self) -> Option<String> {
        self.state.lock().current_leader.clone()
    }

    /// State snapshot for diagnostics and tests.
    pub fn status(&self) -> ConsensusStatus {
        let state = self.state.lock();
        ConsensusStatus {
            role: state.role,
            term: state.current_term,
            leader: state.current_leader.clone(),
            log_length: state.last_log_index(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
        }
    }

    /// Propose a record id for commit.
    ///
    /// Fails fast when not leader. Otherwise appends to the local log and
    /// replicates to peers in parallel, returning `true` iff a majority
    /// (counting the local append) acknowledges before the quorum deadline.
    /// On success the commit index advances and newly committed records are
    /// confirmed in the store; full fan-out continues via heartbeats.
    pub async fn propose(self: &Arc<Self>, record_id: &str) -> bool {
        let (term, proposed_index) = {
            let mut state = self.state.lock();
            if state.role != RaftRole::Leader {
                debug!("proposal rejected: not leader");
                return false;
            }
            let term = state.current_term;
            state.log.push(LogEntry {
                term,
                record_id: record_id.to_string(),
            });
            info!(record_id, term, "proposed record");
            (term, state.last_log_index())
        };

        if !self.replicate_to_majority().await {
            warn!(record_id, "quorum not reached before deadline");
            return false;
        }

        let newly_applied = {
            let mut state = self.state.lock();
            if state.role != RaftRole::Leader || state.current_term != term {
                // Deposed mid-proposal; the new leader decides this entry's fate
                return false;
            }
            if proposed_index > state.commit_index {
                state.commit_index = proposed_index;
            }
            state.advance_applied()
        };
        for id in newly_applied {
            self.ctx.store.mark_confirmed(&id);
        }
        true
    }

    /// Replicate the log suffix to every peer in parallel and wait for a
    /// majority of acks. The local append counts as the first ack; the wait
    /// is a counting rendezvous bounded by the consensus deadline.
    async fn replicate_to_majority(self: &Arc<Self>) -> bool {
        let peers = self.ctx.peers();
        if peers.is_empty() {
            return true;
        }
        let required = self.ctx.quorum();
        let acks = Arc::new(AtomicUsize::new(1));
        let quorum = Arc::new(Notify::new());

        for peer in peers {
            let consensus = Arc::clone(self);
            let acks = Arc::clone(&acks);
            let quorum = Arc::clone(&quorum);
            tokio::spawn(async move {
                if consensus.send_append_entries(&peer).await {
                    acks.fetch_add(1, Ordering::SeqCst);
                    quorum.notify_one();
                }
            });
        }

        let deadline = Instant::now() + secs(self.settings.timeout_secs + QUORUM_WAIT_SLACK);
        while acks.load(Ordering::SeqCst) < required {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if tokio::time::timeout(remaining, quorum.notified()).await.is_err() {
                break;
            }
        }
        acks.load(Ordering::SeqCst) >= required
    }

    /// Send one AppendEntries RPC to a peer, carrying the log suffix from
    /// its `next_index`. Publishes index updates or backs off on rejection.
    async fn send_append_entries(self: &Arc<Self>, peer: &str) -> bool {
        let args = {
            let state = self.state.lock();
            if state.role != RaftRole::Leader {
                return false;
            }
            let next = state
                .next_index
                .get(peer)
                .copied()
                .unwrap_or(state.last_log_index() + 1);
            let prev_log_index = next.saturating_sub(1);
            let prev_log_term = if prev_log_index > 0 {
                state
                    .log
                    .get(prev_log_index as usize - 1)
                    .map(|e| e.term)
                    .unwrap_or(0)
            } else {
                0
            };
            let entries = if next <= state.last_log_index() {
                state.log[next as usize - 1..].to_vec()
            } else {
                Vec::new()
            };
            AppendArgs {
                term: state.current_term,
                leader_id: self.ctx.node_id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: state.commit_index,
            }
        };

        let reply = match self.ctx.transport.append_entries(peer, &args).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(peer, error = %err, "append entries failed");
                return false;
            }
        };

        let mut state = self.state.lock();
        if reply.term > state.current_term {
            info!(peer, term = reply.term, "newer term observed, stepping down");
            state.step_down(reply.term);
            return false;
        }
        if state.role != RaftRole::Leader || state.current_term != args.term {
            return false;
        }
        if reply.success {
            let acked = args.prev_log_index + args.entries.len() as u64;
            let matched = state.match_index.entry(peer.to_string()).or_insert(0);
            if acked > *matched {
                *matched = acked;
            }
            state.next_index.insert(peer.to_string(), acked + 1);
            true
        } else {
            // Log inconsistency: back next_index off towards the common prefix
            let next = state.next_index.entry(peer.to_string()).or_insert(1);
            *next = next.saturating_sub(1).max(1);
            debug!(peer, next_index = *next, "follower log mismatch, backing off");
            false
        }
    }

    /// Handle a RequestVote RPC.
    ///
    /// Grants iff the candidate's term is current, this node has not voted
    /// for someone else this term, and the candidate's log is at least as
    /// up-to-date. Granting resets the election timer.
    pub fn handle_request_vote(&self, args: &VoteArgs) -> VoteReply {
        let mut state = self.state.lock();

        if args.term < state.current_term {
            return VoteReply {
                term: state.current_term,
                vote_granted: false,
            };
        }
        if args.term > state.current_term {
            state.step_down(args.term);
        }

        let up_to_date = args.last_log_term > state.last_log_term()
            || (args.last_log_term == state.last_log_term()
                && args.last_log_index >= state.last_log_index());
        let unvoted = state.voted_for.is_none()
            || state.voted_for.as_deref() == Some(args.candidate_id.as_str());
        let granted = unvoted && up_to_date;

        if granted {
            state.voted_for = Some(args.candidate_id.clone());
            state.election_deadline = Instant::now() + random_election_timeout(&self.settings);
            debug!(candidate = %args.candidate_id, term = args.term, "vote granted");
        }

        VoteReply {
            term: state.current_term,
            vote_granted: granted,
        }
    }

    /// Handle an AppendEntries RPC (heartbeat or log replication).
    ///
    /// A valid call from a current leader resets the election timer and may
    /// truncate a divergent suffix before appending. Newly committed records
    /// are confirmed in the store after the lock is released.
    pub fn handle_append_entries(&self, args: &AppendArgs) -> AppendReply {
        let (reply, newly_applied) = {
            let mut state = self.state.lock();

            if args.term < state.current_term {
                return AppendReply {
                    term: state.current_term,
                    success: false,
                };
            }
            if args.term > state.current_term {
                state.current_term = args.term;
                state.voted_for = None;
            }
            state.role = RaftRole::Follower;
            state.votes_received.clear();
            state.current_leader = Some(args.leader_id.clone());
            state.election_deadline = Instant::now() + random_election_timeout(&self.settings);

            let consistent = if args.prev_log_index == 0 {
                true
            } else if args.prev_log_index > state.last_log_index() {
                false
            } else {
                state.log[args.prev_log_index as usize - 1].term == args.prev_log_term
            };
            if !consistent {
                return AppendReply {
                    term: state.current_term,
                    success: false,
                };
            }

            if !args.entries.is_empty() {
                state.log.truncate(args.prev_log_index as usize);
                state.log.extend(args.entries.iter().cloned());
            }
            if args.leader_commit > state.commit_index {
                state.commit_index = args.leader_commit.min(state.last_log_index());
            }
            let applied = state.advance_applied();
            (
                AppendReply {
                    term: state.current_term,
                    success: true,
                },
                applied,
            )
        };

        for id in newly_applied {
            self.ctx.store.mark_confirmed(&id);
        }
        reply
    }

    /// Start an election now unless already leading. Used by the failover
    /// path when the known leader dies.
    pub fn trigger_election(self: &Arc<Self>) {
        let broadcast = {
            let mut state = self.state.lock();
            if state.role == RaftRole::Leader {
                None
            } else {
                Some(self.begin_election(&mut state))
            }
        };
        if let Some(args) = broadcast {
            self.broadcast_vote_requests(args);
        }
    }

    /// Failure hook: losing the known leader clears it and, unless this node
    /// leads, forces an election.
    pub fn handle_peer_failure(self: &Arc<Self>, peer: &str) {
        let broadcast = {
            let mut state = self.state.lock();
            if state.current_leader.as_deref() != Some(peer) {
                return;
            }
            warn!(peer, "leader lost, forcing election");
            state.current_leader = None;
            if state.role == RaftRole::Leader {
                None
            } else {
                Some(self.begin_election(&mut state))
            }
        };
        if let Some(args) = broadcast {
            self.broadcast_vote_requests(args);
        }
    }

    /// Recovery hook: re-seed replication indexes for the returning peer.
    pub fn handle_peer_recovery(&self, peer: &str) {
        let mut state = self.state.lock();
        let next = state.last_log_index() + 1;
        state.next_index.insert(peer.to_string(), next);
        state.match_index.insert(peer.to_string(), 0);
        debug!(peer, next_index = next, "peer recovery, replication indexes reset");
    }

    fn tick(self: &Arc<Self>) {
        enum Action {
            None,
            Heartbeat(Vec<String>),
            Election(VoteArgs),
        }

        let action = {
            let mut state = self.state.lock();
            match state.role {
                RaftRole::Leader => {
                    if state.last_heartbeat.elapsed() >= secs(self.settings.heartbeat_interval_secs)
                    {
                        state.last_heartbeat = Instant::now();
                        Action::Heartbeat(self.ctx.peers())
                    } else {
                        Action::None
                    }
                }
                RaftRole::Follower | RaftRole::Candidate => {
                    if Instant::now() >= state.election_deadline {
                        Action::Election(self.begin_election(&mut state))
                    } else {
                        Action::None
                    }
                }
            }
        };

        match action {
            Action::None => {}
            Action::Heartbeat(peers) => {
                for peer in peers {
                    let consensus = Arc::clone(self);
                    tokio::spawn(async move {
                        consensus.send_append_entries(&peer).await;
                    });
                }
            }
            Action::Election(args) => self.broadcast_vote_requests(args),
        }
    }

    /// Transition to candidate under the lock and snapshot the vote request.
    fn begin_election(&self, state: &mut RaftState) -> VoteArgs {
        state.role = RaftRole::Candidate;
        state.current_term += 1;
        state.voted_for = Some(self.ctx.node_id.clone());
        state.current_leader = None;
        state.votes_received = HashSet::from([self.ctx.node_id.clone()]);
        state.election_deadline = Instant::now() + random_election_timeout(&self.settings);

        info!(term = state.current_term, "starting election");

        VoteArgs {
            term: state.current_term,
            candidate_id: self.ctx.node_id.clone(),
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
        }
    }

    fn broadcast_vote_requests(self: &Arc<Self>, args: VoteArgs) {
        for peer in self.ctx.peers() {
            let consensus = Arc::clone(self);
            let args = args.clone();
            tokio::spawn(async move {
                consensus.request_vote_from(&peer, args).await;
            });
        }
    }

    async fn request_vote_from(self: &Arc<Self>, peer: &str, args: VoteArgs) {
        let reply = match self.ctx.transport.request_vote(peer, &args).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(peer, error = %err, "vote request failed");
                return;
            }
        };

        let mut state = self.state.lock();
        if reply.term > state.current_term {
            state.step_down(reply.term);
            return;
        }
        if state.role != RaftRole::Candidate
            || state.current_term != args.term
            || !reply.vote_granted
        {
            return;
        }
        state.votes_received.insert(peer.to_string());
        if state.votes_received.len() >= self.ctx.quorum() {
            self.become_leader(&mut state);
        }
    }

    fn become_leader(&self, state: &mut RaftState) {
        state.role = RaftRole::Leader;
        state.current_leader = Some(self.ctx.node_id.clone());
        // Backdate so the next tick asserts leadership immediately
        state.last_heartbeat = Instant::now() - secs(self.settings.heartbeat_interval_secs);

        let next = state.last_log_index() + 1;
        for peer in self.ctx.peers() {
            state.next_index.insert(peer.clone(), next);
            state.match_index.insert(peer, 0);
        }
        info!(term = state.current_term, "became leader");
    }
}

fn random_election_timeout(settings: &ConsensusSettings) -> Duration {
    let min = settings.election_timeout_min_secs;
    let max = settings.election_timeout_max_secs;
    if max <= min {
        return secs(min);
    }
    secs(rand::thread_rng().gen_range(min..max))
}
