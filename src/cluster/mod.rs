//! Distributed Coordination Layer
//!
//! The four cooperating subsystems of the cluster:
//! - Consensus: leader election and majority commit over a replicated log
//! - Replicator: asynchronous fan-out of committed records, batch resync
//! - HealthMonitor: peer liveness probing and failure/recovery events
//! - TimeSync: NTP-style pairwise offset estimation ("cluster time")
//!
//! plus the deduplication filter they share. Subsystems never own each
//! other: each holds a [`ClusterContext`] built by the host first, and
//! liveness changes flow through the host as [`PeerEvent`]s.

pub mod bloom;
pub mod consensus;
pub mod dedup;
pub mod health;
pub mod replicator;
pub mod time_sync;

pub use bloom::CountingBloomFilter;
pub use consensus::{Consensus, ConsensusStatus, LogEntry, RaftRole};
pub use dedup::{content_hash, DedupFilter, DedupStats};
pub use health::HealthMonitor;
pub use replicator::{ReplicationStats, Replicator};
pub use time_sync::{unix_now, TimeSyncStatus, TimeSynchronizer};

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::ClusterConfig;
use crate::rpc::client::PeerTransport;
use crate::store::RecordStore;

/// Liveness change reported by the health monitor. The host dispatches
/// these to the consensus and replication hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Peer crossed the failure threshold
    Failed(String),
    /// Previously failed peer answered a probe again
    Recovered(String),
}

/// Host capabilities handed to every subsystem at construction.
///
/// Holds the node identity, cluster configuration, the shared record store,
/// the outbound transport, and the peer-event channel. Built once by the
/// host before any subsystem, so there are no ownership cycles.
pub struct ClusterContext {
    /// This node's id
    pub node_id: String,
    /// Cluster topology and tunables
    pub config: Arc<ClusterConfig>,
    /// Shared record store
    pub store: Arc<RecordStore>,
    /// Outbound RPC transport
    pub transport: Arc<dyn PeerTransport>,
    /// Sink for health state changes
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

impl ClusterContext {
    /// Peer node ids (every cluster member except this node).
    pub fn peers(&self) -> Vec<String> {
        self.config.peers_of(&self.node_id)
    }

    /// Acks required for a majority, counting this node.
    pub fn quorum(&self) -> usize {
        self.config.quorum()
    }
}
