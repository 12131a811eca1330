//! Record Replication
//!
//! Fans committed records out to every peer at-least-once. Records are
//! queued per peer and drained by a fixed worker pool with per-request
//! retries; receivers apply them idempotently through the dedup filter, so
//! resends converge instead of double-applying. Recovered peers are brought
//! back in step with a sorted batch resync.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::dedup::DedupFilter;
use crate::cluster::time_sync::unix_now;
use crate::cluster::ClusterContext;
use crate::config::{secs, ReplicationSettings};
use crate::model::PaymentRecord;
use crate::rpc::wire::{
    BatchRequest, BatchResponse, PeerReplicationStatus, ReplicateRequest, ReplicateResponse,
    ReplicateStatus,
};

/// Idle wait between queue scans when no work is pending.
const IDLE_WAIT_MS: u64 = 100;

/// Smoothing factor of the response-time moving average.
const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Aggregate replication counters.
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    /// Enqueued record-peer pairs
    pub total_sent: u64,
    /// Deliveries that succeeded (including duplicate acknowledgements)
    pub total_successful: u64,
    /// Deliveries that exhausted their retries
    pub total_failed: u64,
    /// Exponential moving average of delivery time in seconds
    pub avg_response_time: f64,
    /// Unix seconds of the last enqueue
    pub last_replication: f64,
}

struct PeerState {
    connected: bool,
    queue: VecDeque<PaymentRecord>,
    consecutive_failures: u32,
    total_attempts: u64,
    successful: u64,
    last_success: f64,
}

impl PeerState {
    fn new() -> Self {
        Self {
            connected: true,
            queue: VecDeque::new(),
            consecutive_failures: 0,
            total_attempts: 0,
            successful: 0,
            last_success: unix_now(),
        }
    }
}

struct ReplicatorState {
    peers: HashMap<String, PeerState>,
    stats: ReplicationStats,
    rotation: usize,
}

/// Asynchronous record fan-out with idempotent receipt.
pub struct Replicator {
    ctx: Arc<ClusterContext>,
    settings: ReplicationSettings,
    dedup: Arc<DedupFilter>,
    state: Mutex<ReplicatorState>,
    /// Stable peer order for round-robin queue scanning
    peer_order: Vec<String>,
    running: AtomicBool,
    work: Notify,
    shutdown: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Replicator {
    /// Create a replicator with empty queues for every peer.
    pub fn new(ctx: Arc<ClusterContext>, dedup: Arc<DedupFilter>) -> Self {
        let settings = ctx.config.replication.clone();
        let peer_order = ctx.peers();
        let peers = peer_order
            .iter()
            .map(|p| (p.clone(), PeerState::new()))
            .collect();
        Self {
            ctx,
            settings,
            dedup,
            state: Mutex::new(ReplicatorState {
                peers,
                stats: ReplicationStats::default(),
                rotation: 0,
            }),
            peer_order,
            running: AtomicBool::new(false),
            work: Notify::new(),
            shutdown: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the fan-out worker pool.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(workers = self.settings.worker_count, "starting replication service");

        let mut tasks = self.tasks.lock();
        for worker_id in 0..self.settings.worker_count {
            let replicator = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                replicator.worker_loop(worker_id).await;
            }));
        }
    }

    /// Stop the worker pool, joining within the shutdown grace period.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        self.work.notify_waiters();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = tokio::time::timeout(crate::SHUTDOWN_GRACE, handle).await;
        }
        info!("replication service stopped");
    }

    /// Queue a record for delivery to every peer. Returns immediately.
    pub fn replicate(&self, record: &PaymentRecord) {
        let mut state = self.state.lock();
        let peer_count = self.peer_order.len();
        if peer_count == 0 {
            warn!("no peers configured for replication");
            return;
        }
        for peer in &self.peer_order {
            if let Some(peer_state) = state.peers.get_mut(peer) {
                peer_state.queue.push_back(record.clone());
            }
        }
        state.stats.total_sent += peer_count as u64;
        state.stats.last_replication = unix_now();
        drop(state);

        debug!(record_id = %record.id, peers = peer_count, "record queued for fan-out");
        self.work.notify_waiters();
    }

    /// Apply a record pushed by a peer.
    ///
    /// Duplicate content answers `duplicate` with the original id; a known
    /// id answers `already_exists`. Both are success to the sender. A fresh
    /// record is stored under the store lock and registered for dedup.
    pub fn handle_replication(&self, source: &str, record: PaymentRecord) -> ReplicateResponse {
        if let Some(original) = self.dedup.check_duplicate(&record) {
            info!(record_id = %record.id, source, original = %original, "rejected duplicate record");
            return ReplicateResponse {
                status: ReplicateStatus::Duplicate,
                transaction_id: record.id,
                original_transaction_id: Some(original),
            };
        }

        let id = record.id.clone();
        if self.ctx.store.insert_if_absent(record.clone()) {
            self.dedup.register(&record);
            info!(record_id = %id, source, "replicated record stored");
            ReplicateResponse {
                status: ReplicateStatus::Success,
                transaction_id: id,
                original_transaction_id: None,
            }
        } else {
            debug!(record_id = %id, "record already present");
            ReplicateResponse {
                status: ReplicateStatus::AlreadyExists,
                transaction_id: id,
                original_transaction_id: None,
            }
        }
    }

    /// Apply a batch of records pushed by a peer.
    ///
    /// In normal flow content duplicates are skipped; during a recovery sync
    /// (`is_sync`) they are stored through anyway so the peer converges on
    /// the full record set.
    pub fn handle_batch(
        &self,
        source: &str,
        records: Vec<PaymentRecord>,
        is_sync: bool,
    ) -> BatchResponse {
        let total_count = records.len();
        let mut successful_count = 0;
        let mut skipped = 0;
        let errors: Vec<String> = Vec::new();

        for record in records {
            let duplicate = self.dedup.check_duplicate(&record).is_some();
            if duplicate && !is_sync {
                skipped += 1;
                continue;
            }
            if self.ctx.store.insert_if_absent(record.clone()) {
                self.dedup.register(&record);
            }
            // An id already in the store still counts as converged
            successful_count += 1;
        }

        info!(
            source,
            successful_count, total_count, skipped, is_sync, "batch replication applied"
        );
        BatchResponse {
            status: "completed".to_string(),
            successful_count,
            failed_count: total_count - successful_count - skipped,
            total_count,
            errors,
        }
    }

    /// Push the entire local store to a recovered peer, sorted by timestamp,
    /// in bounded batches. Stops and surfaces the failure on the first batch
    /// that does not fully succeed.
    pub async fn sync_with_recovered_peer(&self, peer: &str) -> Result<()> {
        let records = self.ctx.store.list_sorted_by_timestamp();
        if records.is_empty() {
            info!(peer, "no records to sync");
            return Ok(());
        }
        info!(peer, records = records.len(), "syncing recovered peer");

        for chunk in records.chunks(self.settings.batch_size.max(1)) {
            let request = BatchRequest {
                transactions: chunk.to_vec(),
                source_node: self.ctx.node_id.clone(),
                is_sync: true,
                timestamp: unix_now(),
            };
            let response = self.ctx.transport.replicate_batch(peer, &request).await?;
            if response.successful_count != chunk.len() {
                bail!(
                    "batch sync to {} incomplete: {}/{} applied",
                    peer,
                    response.successful_count,
                    chunk.len()
                );
            }
        }
        info!(peer, "recovered peer sync complete");
        Ok(())
    }

    /// Failure hook: mark the peer disconnected and drop its queue. The
    /// records survive on the other replicas and return via resync.
    pub fn on_peer_failure(&self, peer: &str) {
        let mut state = self.state.lock();
        if let Some(peer_state) = state.peers.get_mut(peer) {
            peer_state.connected = false;
            let dropped = peer_state.queue.len();
            peer_state.queue.clear();
            if dropped > 0 {
                info!(peer, dropped, "cleared pending replications for failed peer");
            }
        }
    }

    /// Recovery hook: mark the peer reachable again.
    pub fn on_peer_recovery(&self, peer: &str) {
        let mut state = self.state.lock();
        if let Some(peer_state) = state.peers.get_mut(peer) {
            peer_state.connected = true;
            peer_state.consecutive_failures = 0;
        }
    }

    /// Per-peer status snapshot for `/status`.
    pub fn status(&self) -> BTreeMap<String, PeerReplicationStatus> {
        let state = self.state.lock();
        state
            .peers
            .iter()
            .map(|(peer, ps)| {
                (
                    peer.clone(),
                    PeerReplicationStatus {
                        connected: ps.connected,
                        pending_count: ps.queue.len(),
                        last_successful_replication: ps.last_success,
                        consecutive_failures: ps.consecutive_failures,
                        success_rate: ps.successful as f64 / ps.total_attempts.max(1) as f64,
                    },
                )
            })
            .collect()
    }

    /// Aggregate counters snapshot.
    pub fn stats(&self) -> ReplicationStats {
        self.state.lock().stats.clone()
    }

    /// Records currently queued across all peers.
    pub fn total_pending(&self) -> usize {
        self.state.lock().peers.values().map(|p| p.queue.len()).sum()
    }

    async fn worker_loop(self: &Arc<Self>, worker_id: usize) {
        debug!(worker_id, "replication worker started");
        while self.running.load(Ordering::SeqCst) {
            match self.take_next() {
                Some((peer, record)) => self.deliver(&peer, record).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(IDLE_WAIT_MS)) => {}
                        _ = self.work.notified() => {}
                        _ = self.shutdown.notified() => break,
                    }
                }
            }
        }
        debug!(worker_id, "replication worker stopped");
    }

    /// Pop the next queued record, scanning peers round-robin from a
    /// rotating start so one busy peer cannot starve the rest.
    fn take_next(&self) -> Option<(String, PaymentRecord)> {
        let mut state = self.state.lock();
        let n = self.peer_order.len();
        if n == 0 {
            return None;
        }
        let start = state.rotation % n;
        state.rotation = state.rotation.wrapping_add(1);

        for i in 0..n {
            let peer = &self.peer_order[(start + i) % n];
            if let Some(peer_state) = state.peers.get_mut(peer) {
                if let Some(record) = peer_state.queue.pop_front() {
                    return Some((peer.clone(), record));
                }
            }
        }
        None
    }

    /// Ship one record to one peer with the retry policy, then record the
    /// outcome.
    async fn deliver(self: &Arc<Self>, peer: &str, record: PaymentRecord) {
        let started = Instant::now();
        let ok = self.send_with_retries(peer, &record).await;
        let elapsed = started.elapsed().as_secs_f64();

        let mut state = self.state.lock();
        if let Some(peer_state) = state.peers.get_mut(peer) {
            peer_state.total_attempts += 1;
            if ok {
                peer_state.successful += 1;
                peer_state.consecutive_failures = 0;
                peer_state.last_success = unix_now();
            } else {
                peer_state.consecutive_failures += 1;
            }
        }
        if ok {
            state.stats.total_successful += 1;
        } else {
            state.stats.total_failed += 1;
        }
        state.stats.avg_response_time = RESPONSE_TIME_ALPHA * elapsed
            + (1.0 - RESPONSE_TIME_ALPHA) * state.stats.avg_response_time;
    }

    async fn send_with_retries(&self, peer: &str, record: &PaymentRecord) -> bool {
        let request = ReplicateRequest {
            transaction: record.clone(),
            source_node: self.ctx.node_id.clone(),
            timestamp: unix_now(),
        };

        for attempt in 1..=self.settings.max_retries.max(1) {
            match self.ctx.transport.replicate(peer, &request).await {
                Ok(response) => {
                    match response.status {
                        ReplicateStatus::Success => {
                            debug!(record_id = %record.id, peer, "record replicated")
                        }
                        ReplicateStatus::Duplicate | ReplicateStatus::AlreadyExists => {
                            debug!(record_id = %record.id, peer, "record already on peer")
                        }
                    }
                    return true;
                }
                Err(err) => {
                    warn!(
                        record_id = %record.id,
                        peer,
                        attempt,
                        max = self.settings.max_retries,
                        error = %err,
                        "replication attempt failed"
                    );
                }
            }

            if attempt < self.settings.max_retries {
                let backoff = secs(self.settings.retry_delay_secs * attempt as f64);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.shutdown.notified() => return false,
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PeerEvent;
    use crate::config::ClusterConfig;
    use crate::config::DedupSettings;
    use crate::rpc::client::MockPeerTransport;
    use crate::store::RecordStore;
    use tokio::sync::mpsc;

    fn build(
        transport: MockPeerTransport,
        tweak: impl FnOnce(&mut ClusterConfig),
    ) -> (Arc<Replicator>, Arc<RecordStore>) {
        let (events, _rx) = mpsc::unbounded_channel::<PeerEvent>();
        let mut config = ClusterConfig::default();
        tweak(&mut config);
        let store = Arc::new(RecordStore::new());
        let ctx = Arc::new(ClusterContext {
            node_id: "node1".to_string(),
            config: Arc::new(config),
            store: Arc::clone(&store),
            transport: Arc::new(transport),
            events,
        });
        let dedup = Arc::new(DedupFilter::new(DedupSettings::default()));
        (Arc::new(Replicator::new(ctx, dedup)), store)
    }

    fn record(id: &str) -> PaymentRecord {
        let mut r = PaymentRecord::create(25.0, "alice".into(), "bob".into(), "node2".into());
        r.id = id.to_string();
        r
    }

    #[tokio::test]
    async fn test_replicate_queues_for_every_peer() {
        let (replicator, _store) = build(MockPeerTransport::new(), |_| {});
        replicator.replicate(&record("t1"));

        assert_eq!(replicator.total_pending(), 2);
        assert_eq!(replicator.stats().total_sent, 2);
    }

    #[tokio::test]
    async fn test_take_next_rotates_between_peers() {
        let (replicator, _store) = build(MockPeerTransport::new(), |_| {});
        replicator.replicate(&record("t1"));

        let first = replicator.take_next().unwrap();
        let second = replicator.take_next().unwrap();
        assert_ne!(first.0, second.0);
        assert!(replicator.take_next().is_none());
    }

    #[tokio::test]
    async fn test_handle_replication_stores_and_registers() {
        let (replicator, store) = build(MockPeerTransport::new(), |_| {});

        let response = replicator.handle_replication("node2", record("t1"));
        assert_eq!(response.status, ReplicateStatus::Success);
        assert!(store.contains("t1"));

        // Identical content under a fresh id is a duplicate
        let response = replicator.handle_replication("node2", record("t2"));
        assert_eq!(response.status, ReplicateStatus::Duplicate);
        assert_eq!(response.original_transaction_id.as_deref(), Some("t1"));
        assert!(!store.contains("t2"));
    }

    #[tokio::test]
    async fn test_handle_replication_reports_existing_id() {
        let (replicator, store) = build(MockPeerTransport::new(), |_| {});
        // Record present in the store but unknown to dedup (e.g. restored
        // before the filter caught up)
        store.insert_if_absent(record("t1"));

        let response = replicator.handle_replication("node2", record("t1"));
        assert_eq!(response.status, ReplicateStatus::AlreadyExists);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_batch_skips_duplicates_in_normal_flow() {
        let (replicator, store) = build(MockPeerTransport::new(), |_| {});
        replicator.handle_replication("node2", record("t1"));

        // Same content, different id: skipped outside sync
        let response =
            replicator.handle_batch("node2", vec![record("t2")], false);
        assert_eq!(response.successful_count, 0);
        assert_eq!(response.failed_count, 0);
        assert!(!store.contains("t2"));
    }

    #[tokio::test]
    async fn test_handle_batch_stores_through_on_sync() {
        let (replicator, store) = build(MockPeerTransport::new(), |_| {});
        replicator.handle_replication("node2", record("t1"));

        let response = replicator.handle_batch("node2", vec![record("t2")], true);
        assert_eq!(response.successful_count, 1);
        assert!(store.contains("t2"));
    }

    #[tokio::test]
    async fn test_sync_sends_sorted_batches() {
        let mut transport = MockPeerTransport::new();
        transport.expect_replicate_batch().returning(|_, req| {
            assert!(req.is_sync);
            // Batches arrive sorted by timestamp
            let stamps: Vec<f64> = req.transactions.iter().map(|t| t.timestamp).collect();
            let mut sorted = stamps.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            assert_eq!(stamps, sorted);
            Ok(BatchResponse {
                status: "completed".into(),
                successful_count: req.transactions.len(),
                failed_count: 0,
                total_count: req.transactions.len(),
                errors: vec![],
            })
        });

        let (replicator, store) = build(transport, |config| {
            config.replication.batch_size = 2;
        });
        for i in 0..5 {
            let mut r = record(&format!("t{i}"));
            r.timestamp = (10 - i) as f64;
            store.insert_if_absent(r);
        }

        replicator.sync_with_recovered_peer("node2").await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_stops_on_partial_batch() {
        let mut transport = MockPeerTransport::new();
        let calls = std::sync::atomic::AtomicUsize::new(0);
        transport.expect_replicate_batch().returning(move |_, req| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            let applied = if call == 0 { req.transactions.len() } else { 0 };
            Ok(BatchResponse {
                status: "completed".into(),
                successful_count: applied,
                failed_count: req.transactions.len() - applied,
                total_count: req.transactions.len(),
                errors: vec![],
            })
        });

        let (replicator, store) = build(transport, |config| {
            config.replication.batch_size = 2;
        });
        for i in 0..6 {
            store.insert_if_absent(record(&format!("t{i}")));
        }

        assert!(replicator.sync_with_recovered_peer("node2").await.is_err());
    }

    #[tokio::test]
    async fn test_peer_failure_drains_queue() {
        let (replicator, _store) = build(MockPeerTransport::new(), |_| {});
        replicator.replicate(&record("t1"));
        replicator.replicate(&record("t2"));
        assert_eq!(replicator.total_pending(), 4);

        replicator.on_peer_failure("node2");
        assert_eq!(replicator.total_pending(), 2);
        assert!(!replicator.status()["node2"].connected);

        replicator.on_peer_recovery("node2");
        assert!(replicator.status()["node2"].connected);
        assert_eq!(replicator.status()["node2"].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_workers_drain_queues() {
        let mut transport = MockPeerTransport::new();
        transport.expect_replicate().returning(|_, req| {
            Ok(ReplicateResponse {
                status: ReplicateStatus::Success,
                transaction_id: req.transaction.id.clone(),
                original_transaction_id: None,
            })
        });

        let (replicator, _store) = build(transport, |config| {
            config.replication.retry_delay_secs = 0.01;
        });
        replicator.start();
        replicator.replicate(&record("t1"));

        for _ in 0..100 {
            if replicator.total_pending() == 0 && replicator.stats().total_successful >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(replicator.total_pending(), 0);
        assert_eq!(replicator.stats().total_successful, 2);

        replicator.stop().await;
    }

    #[tokio::test]
    async fn test_failed_delivery_counts_against_peer() {
        let mut transport = MockPeerTransport::new();
        transport
            .expect_replicate()
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));

        let (replicator, _store) = build(transport, |config| {
            config.replication.max_retries = 2;
            config.replication.retry_delay_secs = 0.01;
        });
        replicator.replicate(&record("t1"));

        let (peer, rec) = replicator.take_next().unwrap();
        replicator.deliver(&peer, rec).await;

        assert_eq!(replicator.stats().total_failed, 1);
        assert_eq!(replicator.status()[&peer].consecutive_failures, 1);
    }
}
