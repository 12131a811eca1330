//! Common test utilities for ledgerd tests.

#![allow(dead_code)]

use ledgerd::config::{ClusterConfig, NodeAddr};
use ledgerd::Node;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A running multi-node cluster on loopback ephemeral ports, with every
/// interval shortened so elections and probes settle in test time.
pub struct TestCluster {
    pub config: ClusterConfig,
    pub nodes: BTreeMap<String, Arc<Node>>,
    pub addrs: BTreeMap<String, SocketAddr>,
    pub client: reqwest::Client,
}

impl TestCluster {
    /// Build and start an n-node cluster.
    pub async fn start(n: usize) -> Self {
        let config = fast_config(n);
        let mut cluster = Self {
            config: config.clone(),
            nodes: BTreeMap::new(),
            addrs: BTreeMap::new(),
            client: reqwest::Client::new(),
        };
        let ids: Vec<String> = config.nodes.keys().cloned().collect();
        for node_id in ids {
            cluster.start_node(&node_id).await;
        }
        cluster
    }

    /// Start (or restart) one node of the cluster config.
    pub async fn start_node(&mut self, node_id: &str) {
        let node = Node::new(node_id, self.config.clone()).expect("node config");
        let addr = node.start().await.expect("node start");
        self.addrs.insert(node_id.to_string(), addr);
        self.nodes.insert(node_id.to_string(), node);
    }

    /// Stop one node and remove it from the running set.
    pub async fn stop_node(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.remove(node_id) {
            node.stop().await;
        }
    }

    /// Stop every node.
    pub async fn stop(&mut self) {
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        for id in ids {
            self.stop_node(&id).await;
        }
    }

    /// URL of an endpoint on one node.
    pub fn url(&self, node_id: &str, path: &str) -> String {
        format!("http://{}{}", self.addrs[node_id], path)
    }

    /// Wait until exactly one running node reports leadership, returning its
    /// id. Panics when `within` elapses first.
    pub async fn wait_for_leader(&self, within: Duration) -> String {
        let deadline = Instant::now() + within;
        loop {
            let leaders: Vec<String> = self
                .nodes
                .iter()
                .filter(|(_, node)| node.consensus.is_leader())
                .map(|(id, _)| id.clone())
                .collect();
            if leaders.len() == 1 {
                return leaders[0].clone();
            }
            if Instant::now() >= deadline {
                panic!("no single leader within {within:?}; saw {leaders:?}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait until `predicate` holds, polling every 50 ms.
    pub async fn wait_until<F>(&self, within: Duration, mut predicate: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + within;
        while !predicate() {
            if Instant::now() >= deadline {
                panic!("condition not reached within {within:?}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Ids of nodes that are running but not leading.
    pub fn followers(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| !node.consensus.is_leader())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Cluster config with loopback addresses on free ports and sub-second
/// timers.
pub fn fast_config(n: usize) -> ClusterConfig {
    let mut nodes = BTreeMap::new();
    for i in 1..=n {
        nodes.insert(
            format!("node{i}"),
            NodeAddr {
                host: "127.0.0.1".to_string(),
                port: free_port(),
            },
        );
    }

    let mut config = ClusterConfig {
        nodes,
        ..ClusterConfig::default()
    };
    config.consensus.heartbeat_interval_secs = 0.1;
    config.consensus.election_timeout_min_secs = 0.3;
    config.consensus.election_timeout_max_secs = 0.6;
    config.consensus.timeout_secs = 1.0;
    config.health.check_interval_secs = 0.25;
    config.health.probe_timeout_secs = 0.5;
    config.replication.retry_delay_secs = 0.1;
    config.replication.timeout_secs = 1.0;
    config.replication.batch_timeout_secs = 2.0;
    config.time_sync.interval_secs = 0.5;
    config.time_sync.timeout_secs = 0.5;
    config
}

/// Grab a free loopback port from the OS.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    listener.local_addr().expect("local addr").port()
}

/// The standard test payment body.
pub fn payment_body(amount: f64, sender: &str, receiver: &str) -> serde_json::Value {
    serde_json::json!({
        "amount": amount,
        "sender": sender,
        "receiver": receiver,
    })
}
