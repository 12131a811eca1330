//! Configuration Management
//!
//! Cluster topology and per-component tunables, loaded from a TOML file with
//! environment-variable overrides for the common timeouts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Address of one cluster member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeAddr {
    /// Hostname or IP
    pub host: String,
    /// HTTP port
    pub port: u16,
}

impl NodeAddr {
    /// `host:port` form used for dialing
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Consensus protocol tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSettings {
    /// Per-RPC timeout in seconds; also bounds the quorum wait (+0.5 s)
    pub timeout_secs: f64,
    /// Leader heartbeat interval in seconds
    pub heartbeat_interval_secs: f64,
    /// Lower bound of the random election timeout in seconds
    pub election_timeout_min_secs: f64,
    /// Upper bound of the random election timeout in seconds
    pub election_timeout_max_secs: f64,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 2.0,
            heartbeat_interval_secs: 1.0,
            election_timeout_min_secs: 5.0,
            election_timeout_max_secs: 10.0,
        }
    }
}

/// Health monitoring tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Seconds between probe rounds
    pub check_interval_secs: f64,
    /// Consecutive failures before a peer is marked unhealthy
    pub failure_threshold: u32,
    /// Per-probe timeout in seconds
    pub probe_timeout_secs: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 10.0,
            failure_threshold: 3,
            probe_timeout_secs: 5.0,
        }
    }
}

/// Replication fan-out tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
    /// Per-record request timeout in seconds
    pub timeout_secs: f64,
    /// Batch request timeout in seconds
    pub batch_timeout_secs: f64,
    /// Attempts per record before giving up
    pub max_retries: u32,
    /// Base backoff in seconds; attempt n waits `retry_delay * n`
    pub retry_delay_secs: f64,
    /// Records per resync batch
    pub batch_size: usize,
    /// Number of fan-out workers
    pub worker_count: usize,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 5.0,
            batch_timeout_secs: 10.0,
            max_retries: 3,
            retry_delay_secs: 1.0,
            batch_size: 10,
            worker_count: 3,
        }
    }
}

/// Time synchronisation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSyncSettings {
    /// Seconds between sync rounds
    pub interval_secs: f64,
    /// Per-exchange timeout in seconds
    pub timeout_secs: f64,
    /// Minimum samples before the offset is recomputed
    pub min_samples: usize,
    /// Bounded ring size for retained samples
    pub max_samples: usize,
    /// Outlier rejection threshold in standard deviations
    pub outlier_sigma: f64,
}

impl Default for TimeSyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30.0,
            timeout_secs: 5.0,
            min_samples: 3,
            max_samples: 10,
            outlier_sigma: 2.0,
        }
    }
}

/// Deduplication retention tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    /// How long dedup records are kept, in seconds
    pub retention_secs: f64,
    /// Seconds between eviction passes
    pub cleanup_interval_secs: f64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            retention_secs: 86_400.0,
            cleanup_interval_secs: 3_600.0,
        }
    }
}

/// Payment validation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentSettings {
    /// Maximum accepted amount
    pub max_amount: f64,
    /// Maximum sender/receiver name length
    pub max_name_length: usize,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            max_amount: 1_000_000.0,
            max_name_length: 100,
        }
    }
}

/// Full node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster topology: node id to address
    pub nodes: BTreeMap<String, NodeAddr>,
    /// Consensus tunables
    pub consensus: ConsensusSettings,
    /// Health monitoring tunables
    pub health: HealthSettings,
    /// Replication tunables
    pub replication: ReplicationSettings,
    /// Time sync tunables
    pub time_sync: TimeSyncSettings,
    /// Dedup retention tunables
    pub dedup: DedupSettings,
    /// Payment validation limits
    pub payment: PaymentSettings,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("node1".to_string(), NodeAddr { host: "localhost".into(), port: 5000 });
        nodes.insert("node2".to_string(), NodeAddr { host: "localhost".into(), port: 5001 });
        nodes.insert("node3".to_string(), NodeAddr { host: "localhost".into(), port: 5002 });

        Self {
            nodes,
            consensus: ConsensusSettings::default(),
            health: HealthSettings::default(),
            replication: ReplicationSettings::default(),
            time_sync: TimeSyncSettings::default(),
            dedup: DedupSettings::default(),
            payment: PaymentSettings::default(),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: ClusterConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `LEDGERD_*` environment overrides for the common tunables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("LEDGERD_NODES") {
            if let Ok(nodes) = serde_json::from_str(&raw) {
                self.nodes = nodes;
            }
        }
        if let Some(v) = env_f64("LEDGERD_CONSENSUS_TIMEOUT") {
            self.consensus.timeout_secs = v;
        }
        if let Some(v) = env_f64("LEDGERD_HEALTH_CHECK_INTERVAL") {
            self.health.check_interval_secs = v;
        }
        if let Some(v) = env_f64("LEDGERD_REPLICATION_TIMEOUT") {
            self.replication.timeout_secs = v;
        }
        if let Some(v) = env_f64("LEDGERD_TIME_SYNC_INTERVAL") {
            self.time_sync.interval_secs = v;
        }
    }

    /// Peer node ids, excluding `node_id`.
    pub fn peers_of(&self, node_id: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| id.as_str() != node_id)
            .cloned()
            .collect()
    }

    /// `host:port` for a node id, if configured.
    pub fn address_of(&self, node_id: &str) -> Option<String> {
        self.nodes.get(node_id).map(NodeAddr::address)
    }

    /// Number of cluster members.
    pub fn cluster_size(&self) -> usize {
        self.nodes.len()
    }

    /// Votes/acks required for a majority, counting self.
    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }
}

/// Convert fractional seconds to a `Duration`, clamping negatives to zero.
pub fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok()?.parse().ok()
}
