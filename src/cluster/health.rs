//! Peer Health Monitoring
//!
//! Probes every peer's `/health` endpoint on a fixed interval. A peer flips
//! to unhealthy after a threshold of consecutive probe failures and back to
//! healthy on the next success; both transitions are fanned out as
//! [`PeerEvent`]s for the consensus and replication hooks.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterContext, PeerEvent};
use crate::config::{secs, HealthSettings};
use crate::rpc::wire::PeerHealthStatus;

/// Tracked probe state of one peer.
#[derive(Debug, Clone)]
struct PeerHealth {
    healthy: bool,
    consecutive_failures: u32,
    last_check: Instant,
    last_success: Instant,
    response_time: Duration,
}

impl PeerHealth {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_check: now,
            last_success: now,
            response_time: Duration::ZERO,
        }
    }
}

/// Liveness detector for cluster peers.
pub struct HealthMonitor {
    ctx: Arc<ClusterContext>,
    settings: HealthSettings,
    peers: DashMap<String, PeerHealth>,
    running: AtomicBool,
    shutdown: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor that assumes every peer healthy until probed.
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        let settings = ctx.config.health.clone();
        let peers = DashMap::new();
        for peer in ctx.peers() {
            peers.insert(peer, PeerHealth::new());
        }
        Self {
            ctx,
            settings,
            peers,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the probe loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting health monitoring service");

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let interval = secs(monitor.settings.check_interval_secs);
            while monitor.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = monitor.shutdown.notified() => break,
                }
                monitor.check_all_peers().await;
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop the probe loop, joining within the shutdown grace period.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = tokio::time::timeout(crate::SHUTDOWN_GRACE, handle).await;
        }
        info!("health monitoring service stopped");
    }

    /// Probe every peer once.
    pub async fn check_all_peers(&self) {
        let peers: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            self.check_peer(&peer).await;
        }
    }

    async fn check_peer(&self, peer: &str) {
        let started = Instant::now();
        match self.ctx.transport.check_health(peer).await {
            Ok(_) => self.mark_success(peer, started.elapsed()),
            Err(err) => {
                debug!(peer, error = %err, "health probe failed");
                self.mark_failure(peer);
            }
        }
    }

    fn mark_success(&self, peer: &str, response_time: Duration) {
        let mut recovered = false;
        if let Some(mut entry) = self.peers.get_mut(peer) {
            recovered = !entry.healthy;
            entry.healthy = true;
            entry.consecutive_failures = 0;
            entry.last_check = Instant::now();
            entry.last_success = Instant::now();
            entry.response_time = response_time;
        }
        if recovered {
            info!(peer, "peer recovered");
            self.emit(PeerEvent::Recovered(peer.to_string()));
        }
    }

    fn mark_failure(&self, peer: &str) {
        let mut failed = false;
        if let Some(mut entry) = self.peers.get_mut(peer) {
            entry.consecutive_failures += 1;
            entry.last_check = Instant::now();
            if entry.consecutive_failures >= self.settings.failure_threshold && entry.healthy {
                entry.healthy = false;
                failed = true;
            }
        }
        if failed {
            warn!(peer, threshold = self.settings.failure_threshold, "peer marked unhealthy");
            self.emit(PeerEvent::Failed(peer.to_string()));

            if self.healthy_peers().is_empty() {
                error!("all peers down, operating in degraded mode");
            }
        }
    }

    fn emit(&self, event: PeerEvent) {
        if self.ctx.events.send(event).is_err() {
            debug!("peer event dropped: dispatcher gone");
        }
    }

    /// Peers currently considered healthy.
    pub fn healthy_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|e| e.value().healthy)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Whether a specific peer is currently considered healthy.
    pub fn is_peer_healthy(&self, peer: &str) -> bool {
        self.peers.get(peer).map(|e| e.healthy).unwrap_or(false)
    }

    /// Per-peer status snapshot for `/status`.
    pub fn peer_status(&self) -> BTreeMap<String, PeerHealthStatus> {
        self.peers
            .iter()
            .map(|e| {
                let health = e.value();
                (
                    e.key().clone(),
                    PeerHealthStatus {
                        healthy: health.healthy,
                        consecutive_failures: health.consecutive_failures,
                        last_check_ago_secs: health.last_check.elapsed().as_secs_f64(),
                        response_time_ms: health.response_time.as_secs_f64() * 1000.0,
                    },
                )
            })
            .collect()
    }

    /// True iff healthy peers plus this node form a majority.
    pub fn is_cluster_healthy(&self) -> bool {
        let healthy = self.healthy_peers().len() + 1;
        let total = self.peers.len() + 1;
        healthy >= total / 2 + 1
    }

    /// Healthy peer with the lowest observed response time.
    pub fn best_peer_for_request(&self) -> Option<String> {
        self.peers
            .iter()
            .filter(|e| e.value().healthy)
            .min_by_key(|e| e.value().response_time)
            .map(|e| e.key().clone())
    }
}
