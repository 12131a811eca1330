//! # ledgerd - Replicated Payment-Transaction Service
//!
//! ledgerd is a small cluster of nodes that accepts payment records and
//! guarantees every accepted record is durably ordered, agreed upon by a
//! majority, and eventually present on every live replica.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      HTTP Surface (warp)                         │
//! │   /payment /health /status /transactions + peer RPC endpoints   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Node (host)                              │
//! │   ├── Record Store (in-memory, id-keyed)                        │
//! │   ├── Peer-event dispatch (failure / recovery fan-out)          │
//! │   └── Client write path (validate → stamp → commit → fan out)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Coordination Layer                            │
//! │   ├── Consensus (leader election, replicated log, quorum)       │
//! │   ├── Replicator (worker pool, retries, batch resync)           │
//! │   ├── HealthMonitor (probe loop, failure threshold)             │
//! │   ├── TimeSync (NTP-style pairwise offset estimation)           │
//! │   └── Dedup (counting-bloom screen + content hashing, TTL)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  Peer Transport (reqwest, JSON)                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ledgerd::{ClusterConfig, Node};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClusterConfig::load("cluster.toml")?;
//!     let node = Node::new("node1", config)?;
//!
//!     let addr = node.start().await?;
//!     println!("listening on {addr}");
//!
//!     tokio::signal::ctrl_c().await?;
//!     node.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! Writes go to the leader (`POST /payment`); followers answer with a
//! leader hint. A commit means a majority of the cluster acknowledged the
//! record's log entry; replication then delivers the payload to every peer
//! at-least-once, with content-addressed dedup making receipt idempotent.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod model;
pub mod node;
pub mod rpc;
pub mod store;

// Re-exports for convenience
pub use cluster::{
    Consensus, ConsensusStatus, CountingBloomFilter, DedupFilter, HealthMonitor, LogEntry,
    PeerEvent, RaftRole, ReplicationStats, Replicator, TimeSyncStatus, TimeSynchronizer,
};
pub use config::ClusterConfig;
pub use error::NodeError;
pub use model::{PaymentRecord, RecordStatus};
pub use node::Node;
pub use rpc::{HttpTransport, PeerTransport};
pub use store::RecordStore;

use std::time::Duration;

/// Grace period granted to background tasks when stopping.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Prelude module for convenient imports
pub mod prelude {
    //! Common types for embedding a ledgerd node

    pub use crate::cluster::{Consensus, DedupFilter, HealthMonitor, Replicator, TimeSynchronizer};
    pub use crate::config::ClusterConfig;
    pub use crate::error::NodeError;
    pub use crate::model::{PaymentRecord, RecordStatus};
    pub use crate::node::Node;
    pub use crate::store::RecordStore;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_grace_is_bounded() {
        assert!(SHUTDOWN_GRACE <= Duration::from_secs(10));
        assert!(SHUTDOWN_GRACE >= Duration::from_secs(1));
    }
}
