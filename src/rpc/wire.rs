//! Wire Protocol
//!
//! JSON request/response bodies for every HTTP endpoint. Field names follow
//! the cluster wire format; peers of any implementation speaking the same
//! JSON interoperate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cluster::consensus::LogEntry;
use crate::model::PaymentRecord;

/// `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Responding node id
    pub node_id: String,
    /// Always `"healthy"` when the node can answer at all
    pub status: String,
    /// Whether this node is currently the consensus leader
    pub is_leader: bool,
    /// Cluster-synchronised time at the node
    pub timestamp: f64,
    /// Number of records in the local store
    pub transaction_count: usize,
}

/// `GET /ping` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    /// Always `"ok"`
    pub status: String,
    /// Responding node id
    pub node_id: String,
}

/// Per-peer health as reported in `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHealthStatus {
    /// Current liveness verdict
    pub healthy: bool,
    /// Probe failures since the last success
    pub consecutive_failures: u32,
    /// Seconds since the last probe of this peer
    pub last_check_ago_secs: f64,
    /// Last observed probe round-trip in milliseconds
    pub response_time_ms: f64,
}

/// Per-peer replication state as reported in `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReplicationStatus {
    /// Whether the peer is considered reachable for fan-out
    pub connected: bool,
    /// Records queued for this peer
    pub pending_count: usize,
    /// Unix seconds of the last successful send
    pub last_successful_replication: f64,
    /// Send failures since the last success
    pub consecutive_failures: u32,
    /// Fraction of attempted sends that succeeded
    pub success_rate: f64,
}

/// `GET /status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Responding node id
    pub node_id: String,
    /// Whether this node is currently the consensus leader
    pub is_leader: bool,
    /// Health monitor view of every peer
    pub peer_health: BTreeMap<String, PeerHealthStatus>,
    /// Replicator view of every peer
    pub replication_status: BTreeMap<String, PeerReplicationStatus>,
    /// Current time offset in milliseconds
    pub time_offset: f64,
}

/// `POST /payment` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Amount to transfer
    pub amount: f64,
    /// Paying party
    pub sender: String,
    /// Receiving party
    pub receiver: String,
}

/// `POST /payment` success body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResponse {
    /// Always `"success"`
    pub status: String,
    /// Id of the committed record
    pub transaction_id: String,
    /// Cluster-synchronised timestamp assigned to the record
    pub timestamp: f64,
    /// Accepted amount
    pub amount: f64,
    /// Trimmed sender
    pub sender: String,
    /// Trimmed receiver
    pub receiver: String,
    /// Node that accepted and committed the payment
    pub processed_by: String,
}

/// Error body for any non-2xx response. The leader hint is present only on
/// not-leader rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable error description
    pub error: String,
    /// Current leader's node id, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}

impl ErrorBody {
    /// Error body without a leader hint.
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into(), leader: None }
    }
}

/// `POST /consensus` request: a tagged union of the two consensus RPCs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConsensusRequest {
    /// Candidate soliciting a vote
    RequestVote(VoteArgs),
    /// Leader heartbeat / log replication
    AppendEntries(AppendArgs),
}

/// Arguments of the RequestVote RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteArgs {
    /// Candidate's term
    pub term: u64,
    /// Candidate's node id
    pub candidate_id: String,
    /// Index of the candidate's last log entry
    pub last_log_index: u64,
    /// Term of the candidate's last log entry
    pub last_log_term: u64,
}

/// Reply to RequestVote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReply {
    /// Receiver's current term, for the candidate to adopt if newer
    pub term: u64,
    /// Whether the vote was granted
    pub vote_granted: bool,
}

/// Arguments of the AppendEntries RPC. An empty `entries` is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's node id
    pub leader_id: String,
    /// Index of the entry immediately preceding `entries`
    pub prev_log_index: u64,
    /// Term of the entry at `prev_log_index`
    pub prev_log_term: u64,
    /// Entries to append, serialised as `[term, id]` pairs
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub leader_commit: u64,
}

/// Reply to AppendEntries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendReply {
    /// Receiver's current term
    pub term: u64,
    /// False on term rejection or log inconsistency
    pub success: bool,
}

/// `POST /replicate` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    /// The record being pushed
    pub transaction: PaymentRecord,
    /// Node id of the sender
    pub source_node: String,
    /// Sender's cluster time at send
    #[serde(default)]
    pub timestamp: f64,
}

/// Outcome of applying a pushed record. All three variants count as success
/// at the sender; only `Success` means the record was newly stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicateStatus {
    /// Newly stored
    Success,
    /// Content or id already known to the dedup filter
    Duplicate,
    /// Record id already present in the store
    AlreadyExists,
}

/// `POST /replicate` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateResponse {
    /// Outcome of the apply
    pub status: ReplicateStatus,
    /// Id of the pushed record
    pub transaction_id: String,
    /// On `duplicate`, the id of the record it duplicates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_transaction_id: Option<String>,
}

/// `POST /replicate/batch` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Records being pushed
    pub transactions: Vec<PaymentRecord>,
    /// Node id of the sender
    pub source_node: String,
    /// True during recovery resync; duplicates are stored through
    #[serde(default)]
    pub is_sync: bool,
    /// Sender's cluster time at send
    #[serde(default)]
    pub timestamp: f64,
}

/// `POST /replicate/batch` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Always `"completed"`
    pub status: String,
    /// Records stored or already present
    pub successful_count: usize,
    /// Records that failed to apply
    pub failed_count: usize,
    /// Records in the request
    pub total_count: usize,
    /// Per-record failure descriptions
    pub errors: Vec<String>,
}

/// `POST /time_sync` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSyncRequest {
    /// Initiator's local clock at send
    pub t1: f64,
    /// Initiator's node id
    pub node_id: String,
}

/// `POST /time_sync` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSyncReply {
    /// Responder's local clock at receipt
    pub t2: f64,
    /// Responder's local clock at reply
    pub t3: f64,
    /// Responder's cluster-synchronised time
    pub server_time: f64,
    /// Responder's current offset in milliseconds
    pub offset_ms: f64,
}

/// `GET /transactions` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionsResponse {
    /// Records sorted ascending by timestamp
    pub transactions: Vec<PaymentRecord>,
    /// Number of records
    pub total_count: usize,
    /// Responding node id
    pub node_id: String,
}
