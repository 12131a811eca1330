//! Deduplication Filter
//!
//! Suppresses replayed and resent records by id and by normalised content.
//! A counting-bloom pre-filter screens content hashes before the definitive
//! maps are consulted. Entries age out after a configured retention period.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::bloom::CountingBloomFilter;
use crate::cluster::time_sync::unix_now;
use crate::config::{secs, DedupSettings};
use crate::model::PaymentRecord;

/// Expected tracked records used to size the pre-filter.
const FILTER_CAPACITY: usize = 100_000;

/// Pre-filter false positive rate.
const FILTER_FP_RATE: f64 = 0.01;

/// Snapshot of dedup counters.
#[derive(Debug, Clone)]
pub struct DedupStats {
    /// Distinct record ids registered
    pub processed: usize,
    /// Total duplicate submissions observed
    pub duplicate_attempts: u64,
    /// Distinct content hashes tracked
    pub tracked_hashes: usize,
}

/// All dedup bookkeeping, mutated only under the filter's single lock.
struct DedupState {
    /// record id -> its content hash
    id_hashes: HashMap<String, String>,
    /// content hash -> ids sharing it
    hash_ids: HashMap<String, Vec<String>>,
    /// every registered record id
    seen_ids: HashSet<String>,
    /// duplicate submissions per original id
    duplicate_attempts: HashMap<String, u64>,
    /// insertion-ordered (registered_at, id) pairs for TTL eviction
    eviction_index: VecDeque<(f64, String)>,
    /// probabilistic content-hash screen
    filter: CountingBloomFilter,
}

/// Duplicate suppression with TTL eviction.
pub struct DedupFilter {
    settings: DedupSettings,
    state: Mutex<DedupState>,
    running: AtomicBool,
    shutdown: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DedupFilter {
    /// Create an empty filter.
    pub fn new(settings: DedupSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(DedupState {
                id_hashes: HashMap::new(),
                hash_ids: HashMap::new(),
                seen_ids: HashSet::new(),
                duplicate_attempts: HashMap::new(),
                eviction_index: VecDeque::new(),
                filter: CountingBloomFilter::new(FILTER_CAPACITY, FILTER_FP_RATE),
            }),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the background eviction loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting dedup eviction loop");

        let filter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let interval = secs(filter.settings.cleanup_interval_secs);
            while filter.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = filter.shutdown.notified() => break,
                }
                let cutoff = unix_now() - filter.settings.retention_secs;
                let evicted = filter.evict_older_than(cutoff);
                if evicted > 0 {
                    info!(evicted, "evicted aged dedup records");
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop the eviction loop, joining within the shutdown grace period.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = tokio::time::timeout(crate::SHUTDOWN_GRACE, handle).await;
        }
        info!("dedup filter stopped");
    }

    /// Check whether a record duplicates one already registered.
    ///
    /// Returns the original record id on a hit (the record's own id for an
    /// id replay, the prior id for a content match).
    pub fn check_duplicate(&self, record: &PaymentRecord) -> Option<String> {
        let mut state = self.state.lock();

        if state.seen_ids.contains(&record.id) {
            *state.duplicate_attempts.entry(record.id.clone()).or_insert(0) += 1;
            debug!(id = %record.id, "duplicate record id");
            return Some(record.id.clone());
        }

        let content_hash = content_hash(record);
        if !state.filter.may_contain(&content_hash) {
            return None;
        }

        // The screen can false-positive; confirm against the definitive map
        let original = state
            .hash_ids
            .get(&content_hash)
            .and_then(|ids| ids.iter().find(|id| **id != record.id).cloned());

        if let Some(original_id) = original {
            *state.duplicate_attempts.entry(original_id.clone()).or_insert(0) += 1;
            let attempts = state.duplicate_attempts[&original_id];
            if attempts > 10 {
                warn!(
                    original = %original_id,
                    attempts,
                    "excessive duplicate submissions for one record"
                );
            }
            debug!(id = %record.id, original = %original_id, "duplicate record content");
            return Some(original_id);
        }
        None
    }

    /// Register a stored record so future replays are suppressed.
    pub fn register(&self, record: &PaymentRecord) {
        let content_hash = content_hash(record);
        let mut state = self.state.lock();

        if !state.seen_ids.insert(record.id.clone()) {
            return;
        }
        state.id_hashes.insert(record.id.clone(), content_hash.clone());
        state
            .hash_ids
            .entry(content_hash.clone())
            .or_default()
            .push(record.id.clone());
        state.filter.insert(&content_hash);
        state.eviction_index.push_back((unix_now(), record.id.clone()));
    }

    /// Evict every record registered before `cutoff` (unix seconds).
    ///
    /// Removes the id, its hash bucket (and the hash itself when the bucket
    /// empties), the duplicate counter, and the eviction entry in one
    /// critical section. Returns the number of records evicted.
    pub fn evict_older_than(&self, cutoff: f64) -> usize {
        let mut state = self.state.lock();
        let mut evicted = 0;

        while state
            .eviction_index
            .front()
            .map_or(false, |(registered_at, _)| *registered_at < cutoff)
        {
            let Some((_, id)) = state.eviction_index.pop_front() else {
                break;
            };

            state.seen_ids.remove(&id);
            state.duplicate_attempts.remove(&id);
            if let Some(hash) = state.id_hashes.remove(&id) {
                let bucket_empty = match state.hash_ids.get_mut(&hash) {
                    Some(ids) => {
                        ids.retain(|other| *other != id);
                        ids.is_empty()
                    }
                    None => false,
                };
                if bucket_empty {
                    state.hash_ids.remove(&hash);
                    state.filter.remove(&hash);
                }
            }
            evicted += 1;
        }
        evicted
    }

    /// Counter snapshot for status and tests.
    pub fn stats(&self) -> DedupStats {
        let state = self.state.lock();
        DedupStats {
            processed: state.seen_ids.len(),
            duplicate_attempts: state.duplicate_attempts.values().sum(),
            tracked_hashes: state.hash_ids.len(),
        }
    }
}

/// Normalised content hash of a record: SHA-256 over amount at two decimals,
/// trimmed lowercased parties, and the origin node. The record id and
/// timestamp are deliberately excluded so a resend with a fresh id still
/// collides.
pub fn content_hash(record: &PaymentRecord) -> String {
    let content = format!(
        "{:.2}:{}:{}:{}",
        record.amount,
        record.sender.trim().to_lowercase(),
        record.receiver.trim().to_lowercase(),
        record.origin_node,
    );
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
