//! Counting Bloom Filter
//!
//! Probabilistic pre-filter in front of the dedup maps. A plain bloom filter
//! cannot forget, but dedup records are evicted on a TTL, so each position is
//! a 4-bit counter instead of a single bit. No false negatives: if
//! `may_contain` returns false the hash was never registered (or has been
//! fully evicted).

use siphasher::sip128::{Hasher128, SipHasher24};
use std::hash::Hasher;

/// Counting bloom filter over content-hash strings.
#[derive(Clone)]
pub struct CountingBloomFilter {
    /// Counter array, 16 four-bit counters packed per u64
    counters: Vec<u64>,
    /// Number of counters
    num_counters: usize,
    /// Number of hash probes per item
    num_hashes: u32,
    /// Net items inserted
    count: usize,
}

impl CountingBloomFilter {
    /// Size the filter for an expected item count and false-positive rate.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let num_counters = optimal_num_counters(expected_items, false_positive_rate);
        let num_hashes = optimal_num_hashes(num_counters, expected_items);
        let num_words = (num_counters + 15) / 16;

        Self {
            counters: vec![0u64; num_words],
            num_counters,
            num_hashes,
            count: 0,
        }
    }

    /// Register an item.
    pub fn insert(&mut self, item: &str) {
        let (h1, h2) = self.hash_pair(item);
        for i in 0..self.num_hashes {
            let idx = self.probe_index(h1, h2, i);
            self.increment(idx);
        }
        self.count += 1;
    }

    /// Forget one registration of an item. Returns false if the item cannot
    /// be present.
    pub fn remove(&mut self, item: &str) -> bool {
        if !self.may_contain(item) {
            return false;
        }
        let (h1, h2) = self.hash_pair(item);
        for i in 0..self.num_hashes {
            let idx = self.probe_index(h1, h2, i);
            self.decrement(idx);
        }
        self.count = self.count.saturating_sub(1);
        true
    }

    /// Whether the item may have been registered. False positives are
    /// possible; false negatives are not.
    pub fn may_contain(&self, item: &str) -> bool {
        let (h1, h2) = self.hash_pair(item);
        for i in 0..self.num_hashes {
            let idx = self.probe_index(h1, h2, i);
            if self.counter_at(idx) == 0 {
                return false;
            }
        }
        true
    }

    /// Net registered item count.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Drop all registrations.
    pub fn clear(&mut self) {
        self.counters.fill(0);
        self.count = 0;
    }

    fn hash_pair(&self, item: &str) -> (u64, u64) {
        let mut hasher = SipHasher24::new();
        hasher.write(item.as_bytes());
        let hash = hasher.finish128();
        (hash.h1, hash.h2)
    }

    fn probe_index(&self, h1: u64, h2: u64, i: u32) -> usize {
        let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (hash as usize) % self.num_counters
    }

    fn counter_at(&self, idx: usize) -> u8 {
        let word = idx / 16;
        let shift = (idx % 16) * 4;
        ((self.counters[word] >> shift) & 0xF) as u8
    }

    fn increment(&mut self, idx: usize) {
        let word = idx / 16;
        let shift = (idx % 16) * 4;
        // Counters saturate at 15; a saturated counter is never decremented
        // below its floor, trading accuracy for never underflowing
        if (self.counters[word] >> shift) & 0xF < 15 {
            self.counters[word] += 1u64 << shift;
        }
    }

    fn decrement(&mut self, idx: usize) {
        let word = idx / 16;
        let shift = (idx % 16) * 4;
        let current = (self.counters[word] >> shift) & 0xF;
        if current > 0 && current < 15 {
            self.counters[word] -= 1u64 << shift;
        }
    }
}

impl std::fmt::Debug for CountingBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingBloomFilter")
            .field("num_counters", &self.num_counters)
            .field("num_hashes", &self.num_hashes)
            .field("count", &self.count)
            .finish()
    }
}

/// Optimal counter count: m = -n * ln(p) / (ln 2)^2
fn optimal_num_counters(expected_items: usize, false_positive_rate: f64) -> usize {
    let n = expected_items.max(1) as f64;
    let ln2 = std::f64::consts::LN_2;
    let m = -(n * false_positive_rate.ln()) / (ln2 * ln2);
    (m.ceil() as usize).max(64)
}

/// Optimal probe count: k = (m / n) * ln 2
fn optimal_num_hashes(num_counters: usize, expected_items: usize) -> u32 {
    let m = num_counters as f64;
    let n = expected_items.max(1) as f64;
    let k = (m / n) * std::f64::consts::LN_2;
    (k.round() as u32).clamp(1, 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_query() {
        let mut filter = CountingBloomFilter::new(1000, 0.01);
        filter.insert("hash-a");
        filter.insert("hash-b");

        assert!(filter.may_contain("hash-a"));
        assert!(filter.may_contain("hash-b"));
        assert_eq!(filter.count(), 2);
    }

    #[test]
    fn test_remove_restores_absence() {
        let mut filter = CountingBloomFilter::new(1000, 0.01);
        filter.insert("hash-a");

        assert!(filter.remove("hash-a"));
        assert!(!filter.may_contain("hash-a"));
        assert_eq!(filter.count(), 0);
    }

    #[test]
    fn test_remove_absent_is_refused() {
        let mut filter = CountingBloomFilter::new(1000, 0.01);
        assert!(!filter.remove("never-inserted"));
    }

    #[test]
    fn test_double_insert_survives_one_remove() {
        let mut filter = CountingBloomFilter::new(1000, 0.01);
        filter.insert("hash-a");
        filter.insert("hash-a");

        assert!(filter.remove("hash-a"));
        assert!(filter.may_contain("hash-a"));
    }

    #[test]
    fn test_clear() {
        let mut filter = CountingBloomFilter::new(100, 0.05);
        for i in 0..50 {
            filter.insert(&format!("hash-{i}"));
        }
        filter.clear();
        for i in 0..50 {
            assert!(!filter.may_contain(&format!("hash-{i}")));
        }
    }
}
