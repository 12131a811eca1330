//! Node Host
//!
//! Wires the record store, configuration, transport, and the four cluster
//! subsystems together, owns the client write path, and dispatches peer
//! liveness events to the consensus and replication hooks. The shared
//! [`ClusterContext`] is built first and handed into every subsystem, so no
//! subsystem owns another.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cluster::{
    ClusterContext, Consensus, DedupFilter, HealthMonitor, PeerEvent, Replicator, TimeSynchronizer,
};
use crate::config::{ClusterConfig, PaymentSettings};
use crate::error::NodeError;
use crate::model::{PaymentRecord, RecordStatus};
use crate::rpc::client::{HttpTransport, PeerTransport};
use crate::rpc::wire::{
    HealthResponse, PaymentRequest, PaymentResponse, StatusResponse, TransactionsResponse,
};
use crate::store::RecordStore;

/// One cluster member: host state plus the coordination subsystems.
pub struct Node {
    /// This node's id
    pub node_id: String,
    /// Cluster topology and tunables
    pub config: Arc<ClusterConfig>,
    /// Committed payment records
    pub store: Arc<RecordStore>,
    /// Leader election and the replicated log
    pub consensus: Arc<Consensus>,
    /// Record fan-out and resync
    pub replicator: Arc<Replicator>,
    /// Peer liveness detection
    pub health: Arc<HealthMonitor>,
    /// Cluster clock
    pub time_sync: Arc<TimeSynchronizer>,
    /// Duplicate suppression
    pub dedup: Arc<DedupFilter>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    server_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    running: AtomicBool,
    shutdown: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Build a node with the HTTP transport.
    pub fn new(node_id: impl Into<String>, config: ClusterConfig) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let transport: Arc<dyn PeerTransport> = Arc::new(HttpTransport::new(Arc::clone(&config)));
        Self::with_transport(node_id, config, transport)
    }

    /// Build a node over an explicit transport (tests inject mocks here).
    pub fn with_transport(
        node_id: impl Into<String>,
        config: Arc<ClusterConfig>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>> {
        let node_id = node_id.into();
        if !config.nodes.contains_key(&node_id) {
            bail!("node id {node_id} is not in the cluster config");
        }

        let store = Arc::new(RecordStore::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // The context carries every host capability a subsystem needs; it is
        // complete before the first subsystem is constructed
        let ctx = Arc::new(ClusterContext {
            node_id: node_id.clone(),
            config: Arc::clone(&config),
            store: Arc::clone(&store),
            transport,
            events: events_tx,
        });

        let dedup = Arc::new(DedupFilter::new(config.dedup.clone()));
        let consensus = Arc::new(Consensus::new(Arc::clone(&ctx)));
        let replicator = Arc::new(Replicator::new(Arc::clone(&ctx), Arc::clone(&dedup)));
        let health = Arc::new(HealthMonitor::new(Arc::clone(&ctx)));
        let time_sync = Arc::new(TimeSynchronizer::new(Arc::clone(&ctx)));

        Ok(Arc::new(Self {
            node_id,
            config,
            store,
            consensus,
            replicator,
            health,
            time_sync,
            dedup,
            events_rx: Mutex::new(Some(events_rx)),
            server_shutdown: Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start every subsystem, the event dispatcher, and the HTTP server.
    /// Returns the bound listen address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("node already started");
        }
        info!(node_id = %self.node_id, "starting node");

        self.health.start();
        self.replicator.start();
        self.time_sync.start();
        self.consensus.start();
        self.dedup.start();
        self.spawn_event_dispatcher();

        let addr = self.bind_server().await?;
        info!(node_id = %self.node_id, %addr, "node listening");
        Ok(addr)
    }

    /// Stop the HTTP server, the dispatcher, and every subsystem.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node_id = %self.node_id, "stopping node");

        if let Some(tx) = self.server_shutdown.lock().take() {
            let _ = tx.send(());
        }
        self.shutdown.notify_waiters();

        self.health.stop().await;
        self.replicator.stop().await;
        self.time_sync.stop().await;
        self.consensus.stop().await;
        self.dedup.stop().await;

        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        let _ = tokio::time::timeout(crate::SHUTDOWN_GRACE, futures::future::join_all(handles)).await;
        info!(node_id = %self.node_id, "node stopped");
    }

    /// Accept a payment: validate, stamp with cluster time, commit through
    /// consensus, store, and fan out to peers.
    pub async fn submit_payment(
        self: &Arc<Self>,
        request: PaymentRequest,
    ) -> Result<PaymentResponse, NodeError> {
        let (amount, sender, receiver) = validate_payment(&request, &self.config.payment)?;

        if !self.consensus.is_leader() {
            return Err(NodeError::NotLeader {
                leader: self.consensus.leader(),
            });
        }

        let mut record =
            PaymentRecord::create(amount, sender.clone(), receiver.clone(), self.node_id.clone());
        record.timestamp = self.time_sync.now();

        if !self.consensus.propose(&record.id).await {
            // Distinguish losing leadership mid-flight from a quorum timeout
            if !self.consensus.is_leader() {
                return Err(NodeError::NotLeader {
                    leader: self.consensus.leader(),
                });
            }
            return Err(NodeError::ConsensusTimeout);
        }

        record.status = RecordStatus::Confirmed;
        self.store.insert_if_absent(record.clone());
        self.dedup.register(&record);
        self.replicator.replicate(&record);

        Ok(PaymentResponse {
            status: "success".to_string(),
            transaction_id: record.id,
            timestamp: record.timestamp,
            amount,
            sender,
            receiver,
            processed_by: self.node_id.clone(),
        })
    }

    /// `GET /health` snapshot.
    pub fn health_snapshot(&self) -> HealthResponse {
        HealthResponse {
            node_id: self.node_id.clone(),
            status: "healthy".to_string(),
            is_leader: self.consensus.is_leader(),
            timestamp: self.time_sync.now(),
            transaction_count: self.store.len(),
        }
    }

    /// `GET /status` snapshot.
    pub fn status_snapshot(&self) -> StatusResponse {
        StatusResponse {
            node_id: self.node_id.clone(),
            is_leader: self.consensus.is_leader(),
            peer_health: self.health.peer_status(),
            replication_status: self.replicator.status(),
            time_offset: self.time_sync.offset_ms(),
        }
    }

    /// `GET /transactions` snapshot, ascending by timestamp.
    pub fn transactions_snapshot(&self) -> TransactionsResponse {
        let transactions = self.store.list_sorted_by_timestamp();
        TransactionsResponse {
            total_count: transactions.len(),
            transactions,
            node_id: self.node_id.clone(),
        }
    }

    fn spawn_event_dispatcher(self: &Arc<Self>) {
        let Some(mut rx) = self.events_rx.lock().take() else {
            return;
        };
        let node = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = rx.recv() => event,
                    _ = node.shutdown.notified() => None,
                };
                let Some(event) = event else { break };

                match event {
                    PeerEvent::Failed(peer) => {
                        warn!(peer = %peer, "dispatching peer failure");
                        node.consensus.handle_peer_failure(&peer);
                        node.replicator.on_peer_failure(&peer);
                    }
                    PeerEvent::Recovered(peer) => {
                        info!(peer = %peer, "dispatching peer recovery");
                        node.consensus.handle_peer_recovery(&peer);
                        node.replicator.on_peer_recovery(&peer);

                        let replicator = Arc::clone(&node.replicator);
                        tokio::spawn(async move {
                            if let Err(err) = replicator.sync_with_recovered_peer(&peer).await {
                                error!(peer = %peer, error = %err, "recovery sync failed");
                            }
                        });
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn bind_server(self: &Arc<Self>) -> Result<SocketAddr> {
        use std::net::ToSocketAddrs;

        let node_addr = self
            .config
            .nodes
            .get(&self.node_id)
            .context("own address missing from config")?;
        let addr = (node_addr.host.as_str(), node_addr.port)
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve {}", node_addr.address()))?
            .next()
            .context("address resolved to nothing")?;

        let (tx, rx) = oneshot::channel::<()>();
        *self.server_shutdown.lock() = Some(tx);

        let routes = crate::rpc::server::routes(Arc::clone(self));
        let (bound, serving) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
            let _ = rx.await;
        });
        self.tasks.lock().push(tokio::spawn(serving));
        Ok(bound)
    }
}

/// Validate a payment request against the configured limits. Returns the
/// accepted amount and the trimmed party names.
fn validate_payment(
    request: &PaymentRequest,
    limits: &PaymentSettings,
) -> Result<(f64, String, String), NodeError> {
    let amount = request.amount;
    if !amount.is_finite() {
        return Err(NodeError::Validation("invalid amount".into()));
    }
    if amount <= 0.0 {
        return Err(NodeError::Validation("amount must be positive".into()));
    }
    if amount > limits.max_amount {
        return Err(NodeError::Validation("amount exceeds maximum limit".into()));
    }

    let sender = request.sender.trim().to_string();
    let receiver = request.receiver.trim().to_string();
    if sender.is_empty() || receiver.is_empty() {
        return Err(NodeError::Validation(
            "sender and receiver cannot be empty".into(),
        ));
    }
    if sender.len() > limits.max_name_length || receiver.len() > limits.max_name_length {
        return Err(NodeError::Validation("sender/receiver names too long".into()));
    }
    if sender == receiver {
        return Err(NodeError::Validation(
            "sender and receiver cannot be the same".into(),
        ));
    }
    Ok((amount, sender, receiver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::MockPeerTransport;
    use crate::rpc::wire::{AppendReply, VoteReply};

    fn limits() -> PaymentSettings {
        PaymentSettings::default()
    }

    fn payment(amount: f64, sender: &str, receiver: &str) -> PaymentRequest {
        PaymentRequest {
            amount,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
        }
    }

    fn assert_validation(result: Result<(f64, String, String), NodeError>) {
        match result {
            Err(NodeError::Validation(_)) => {}
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_accepts_and_trims() {
        let (amount, sender, receiver) =
            validate_payment(&payment(150.75, "  alice ", "bob"), &limits()).unwrap();
        assert_eq!(amount, 150.75);
        assert_eq!(sender, "alice");
        assert_eq!(receiver, "bob");
    }

    #[test]
    fn test_validate_rejects_bad_amounts() {
        assert_validation(validate_payment(&payment(0.0, "a", "b"), &limits()));
        assert_validation(validate_payment(&payment(-5.0, "a", "b"), &limits()));
        assert_validation(validate_payment(&payment(1_000_001.0, "a", "b"), &limits()));
        assert_validation(validate_payment(&payment(f64::NAN, "a", "b"), &limits()));
        assert_validation(validate_payment(&payment(f64::INFINITY, "a", "b"), &limits()));
    }

    #[test]
    fn test_validate_rejects_bad_parties() {
        assert_validation(validate_payment(&payment(1.0, "", "b"), &limits()));
        assert_validation(validate_payment(&payment(1.0, "a", "   "), &limits()));
        assert_validation(validate_payment(&payment(1.0, "same", "same"), &limits()));
        assert_validation(validate_payment(&payment(1.0, &"x".repeat(101), "b"), &limits()));
    }

    #[test]
    fn test_boundary_amounts_accepted() {
        assert!(validate_payment(&payment(1_000_000.0, "a", "b"), &limits()).is_ok());
        assert!(validate_payment(&payment(0.01, "a", "b"), &limits()).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_node_id_rejected() {
        let config = Arc::new(ClusterConfig::default());
        let transport: Arc<dyn PeerTransport> = Arc::new(MockPeerTransport::new());
        assert!(Node::with_transport("node9", config, transport).is_err());
    }

    #[tokio::test]
    async fn test_submit_payment_on_follower_returns_leader_hint() {
        let config = Arc::new(ClusterConfig::default());
        let transport: Arc<dyn PeerTransport> = Arc::new(MockPeerTransport::new());
        let node = Node::with_transport("node1", config, transport).unwrap();

        // Teach this follower who leads via a heartbeat
        node.consensus.handle_append_entries(&crate::rpc::wire::AppendArgs {
            term: 1,
            leader_id: "node2".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        });

        let err = node
            .submit_payment(payment(10.0, "alice", "bob"))
            .await
            .unwrap_err();
        match err {
            NodeError::NotLeader { leader } => assert_eq!(leader.as_deref(), Some("node2")),
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_payment_commits_on_leader() {
        let mut transport = MockPeerTransport::new();
        transport.expect_request_vote().returning(|_, args| {
            Ok(VoteReply {
                term: args.term,
                vote_granted: true,
            })
        });
        transport.expect_append_entries().returning(|_, args| {
            Ok(AppendReply {
                term: args.term,
                success: true,
            })
        });

        let config = Arc::new(ClusterConfig::default());
        let transport: Arc<dyn PeerTransport> = Arc::new(transport);
        let node = Node::with_transport("node1", config, transport).unwrap();

        node.consensus.trigger_election();
        for _ in 0..100 {
            if node.consensus.is_leader() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(node.consensus.is_leader());

        let response = node
            .submit_payment(payment(150.75, "alice", "bob"))
            .await
            .unwrap();
        assert_eq!(response.status, "success");
        assert_eq!(response.processed_by, "node1");

        let stored = node.store.get(&response.transaction_id).unwrap();
        assert_eq!(stored.status, RecordStatus::Confirmed);
        // Fan-out was queued for both peers
        assert_eq!(node.replicator.total_pending(), 2);
        // The same content resubmitted later is known to dedup
        assert_eq!(node.dedup.stats().processed, 1);
    }

    #[tokio::test]
    async fn test_validation_precedes_leadership_check() {
        let config = Arc::new(ClusterConfig::default());
        let transport: Arc<dyn PeerTransport> = Arc::new(MockPeerTransport::new());
        let node = Node::with_transport("node1", config, transport).unwrap();

        // Not leader, but the malformed request must still yield 400-class
        let err = node
            .submit_payment(payment(-1.0, "alice", "bob"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
