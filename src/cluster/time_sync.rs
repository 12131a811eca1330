//! Time Synchronisation
//!
//! NTP-style pairwise offset estimation against every peer. Each round runs
//! up to three exchanges per peer; the median of the per-exchange offsets
//! becomes one sample. Samples feed an outlier-filtered, linearly-weighted
//! mean that is smoothed into the published offset, so the cluster clock
//! moves without jumps.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::ClusterContext;
use crate::config::{secs, TimeSyncSettings};
use crate::rpc::wire::{TimeSyncReply, TimeSyncRequest};

/// Exchanges per peer per round; the median wins.
const EXCHANGES_PER_PEER: usize = 3;

/// Smoothing factor applied when folding a new estimate into the offset.
const SMOOTHING: f64 = 0.3;

/// Local wall clock as fractional unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// One retained offset sample.
#[derive(Debug, Clone, Copy)]
struct TimeSample {
    /// Estimated offset to the peer's clock in seconds
    offset: f64,
    /// Round-trip time of the exchange in seconds
    rtt: f64,
}

/// Published synchronisation state.
#[derive(Debug, Clone)]
pub struct TimeSyncStatus {
    /// Current offset in milliseconds
    pub offset_ms: f64,
    /// Estimated drift rate in parts per million
    pub skew_ppm: f64,
    /// Estimated accuracy (half a stdev) in milliseconds
    pub accuracy_ms: f64,
    /// Retained sample count
    pub sample_count: usize,
    /// Unix seconds of the last completed recomputation
    pub last_sync: f64,
}

struct TimeSyncState {
    offset: f64,
    skew: f64,
    accuracy: f64,
    samples: VecDeque<TimeSample>,
    last_sync: f64,
    last_recompute: Option<f64>,
}

/// Pairwise clock synchronisation service.
pub struct TimeSynchronizer {
    ctx: Arc<ClusterContext>,
    settings: TimeSyncSettings,
    state: Mutex<TimeSyncState>,
    running: AtomicBool,
    shutdown: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TimeSynchronizer {
    /// Create an unsynchronised service (offset zero).
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        let settings = ctx.config.time_sync.clone();
        Self {
            ctx,
            settings,
            state: Mutex::new(TimeSyncState {
                offset: 0.0,
                skew: 0.0,
                accuracy: 0.0,
                samples: VecDeque::new(),
                last_sync: 0.0,
                last_recompute: None,
            }),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current cluster time: local clock plus the estimated offset.
    pub fn now(&self) -> f64 {
        unix_now() + self.state.lock().offset
    }

    /// Current offset in milliseconds.
    pub fn offset_ms(&self) -> f64 {
        self.state.lock().offset * 1000.0
    }

    /// Answer a peer's sync exchange. Receive and send stamps collapse to a
    /// single clock read.
    pub fn handle_sync_request(&self, request: &TimeSyncRequest) -> TimeSyncReply {
        let t = unix_now();
        debug!(from = %request.node_id, "time sync exchange");
        TimeSyncReply {
            t2: t,
            t3: t,
            server_time: self.now(),
            offset_ms: self.offset_ms(),
        }
    }

    /// Start the sync loop: an initial burst of rounds until enough samples
    /// exist, then one round per configured interval.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting time synchronisation service");

        let sync = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sync.initial_sync().await;

            let interval = secs(sync.settings.interval_secs);
            while sync.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = sync.shutdown.notified() => break,
                }
                sync.sync_round().await;
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop the sync loop, joining within the shutdown grace period.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = tokio::time::timeout(crate::SHUTDOWN_GRACE, handle).await;
        }
        info!("time synchronisation service stopped");
    }

    /// Status snapshot for `/status` and tests.
    pub fn status(&self) -> TimeSyncStatus {
        let state = self.state.lock();
        TimeSyncStatus {
            offset_ms: state.offset * 1000.0,
            skew_ppm: state.skew * 1e6,
            accuracy_ms: state.accuracy * 1000.0,
            sample_count: state.samples.len(),
            last_sync: state.last_sync,
        }
    }

    /// Run one sync round immediately, outside the periodic schedule.
    pub async fn force_sync(&self) {
        self.sync_round().await;
    }

    async fn initial_sync(&self) {
        for round in 0..3 {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            debug!(round = round + 1, "initial time sync round");
            self.sync_round().await;

            if self.state.lock().samples.len() >= self.settings.min_samples {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(secs(2.0)) => {}
                _ = self.shutdown.notified() => return,
            }
        }
        info!(offset_ms = self.offset_ms(), "initial time sync complete");
    }

    async fn sync_round(&self) {
        let peers = self.ctx.peers();
        if peers.is_empty() {
            return;
        }

        for peer in &peers {
            match self.sync_with_peer(peer).await {
                Some(sample) => {
                    debug!(
                        peer = %peer,
                        offset_ms = sample.offset * 1000.0,
                        rtt_ms = sample.rtt * 1000.0,
                        "retained clock sample"
                    );
                    let mut state = self.state.lock();
                    state.samples.push_back(sample);
                    while state.samples.len() > self.settings.max_samples {
                        state.samples.pop_front();
                    }
                }
                None => debug!(peer = %peer, "time sync round with peer produced no sample"),
            }
        }

        let enough = self.state.lock().samples.len() >= self.settings.min_samples;
        if enough {
            self.recompute_offset();
            self.state.lock().last_sync = unix_now();
        }
    }

    /// Perform the pairwise exchanges with one peer and reduce them to a
    /// median sample.
    async fn sync_with_peer(&self, peer: &str) -> Option<TimeSample> {
        let mut offsets = Vec::with_capacity(EXCHANGES_PER_PEER);
        let mut rtts = Vec::with_capacity(EXCHANGES_PER_PEER);

        for _ in 0..EXCHANGES_PER_PEER {
            let t1 = unix_now();
            let request = TimeSyncRequest {
                t1,
                node_id: self.ctx.node_id.clone(),
            };

            match self.ctx.transport.time_sync(peer, &request).await {
                Ok(reply) => {
                    let t4 = unix_now();
                    let offset = ((reply.t2 - t1) + (reply.t3 - t4)) / 2.0;
                    let rtt = (t4 - t1) - (reply.t3 - reply.t2);
                    offsets.push(offset);
                    rtts.push(rtt);
                }
                Err(err) => {
                    warn!(peer = %peer, error = %err, "time sync exchange failed");
                }
            }
        }

        if offsets.is_empty() {
            return None;
        }
        Some(TimeSample {
            offset: statistical::median(&offsets),
            rtt: statistical::median(&rtts),
        })
    }

    /// Re-estimate the offset from retained samples: drop outliers beyond
    /// the configured sigma, weight newer samples more, then smooth.
    fn recompute_offset(&self) {
        let mut state = self.state.lock();
        let offsets: Vec<f64> = state.samples.iter().map(|s| s.offset).collect();
        if offsets.len() < self.settings.min_samples {
            return;
        }

        let mut survivors = filter_outliers(&offsets, self.settings.outlier_sigma);
        if survivors.is_empty() {
            survivors = offsets;
        }

        let total_weight: f64 = (1..=survivors.len()).map(|w| w as f64).sum();
        let weighted: f64 = survivors
            .iter()
            .enumerate()
            .map(|(i, offset)| offset * (i + 1) as f64)
            .sum::<f64>()
            / total_weight;

        let old_offset = state.offset;
        state.offset = (1.0 - SMOOTHING) * old_offset + SMOOTHING * weighted;

        let now = unix_now();
        if let Some(previous) = state.last_recompute {
            let elapsed = now - previous;
            if elapsed > 0.0 {
                state.skew = (state.offset - old_offset) / elapsed;
            }
        }
        state.last_recompute = Some(now);

        if survivors.len() > 1 {
            let mean = statistical::mean(&survivors);
            state.accuracy = statistical::standard_deviation(&survivors, Some(mean)) / 2.0;
        }

        debug!(
            offset_ms = state.offset * 1000.0,
            accuracy_ms = state.accuracy * 1000.0,
            "recomputed clock offset"
        );
    }
}

/// Keep only values within `sigma` standard deviations of the mean.
fn filter_outliers(values: &[f64], sigma: f64) -> Vec<f64> {
    if values.len() < 3 {
        return values.to_vec();
    }
    let mean = statistical::mean(values);
    let stdev = statistical::standard_deviation(values, Some(mean));
    values
        .iter()
        .copied()
        .filter(|v| (v - mean).abs() <= sigma * stdev)
        .collect()
}
