//! In-Memory Record Store
//!
//! Thread-safe store for committed payment records. The store is rebuilt on
//! restart; durability comes from replication, not disk.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::model::{PaymentRecord, RecordStatus};

/// Shared record store, keyed by record id.
///
/// All mutation happens under the store's own lock; callers never hold it
/// across I/O. Insertion is check-then-insert in one critical section, so a
/// record id can land at most once.
#[derive(Default)]
pub struct RecordStore {
    records: RwLock<HashMap<String, PaymentRecord>>,
}

impl RecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a record by id.
    pub fn get(&self, id: &str) -> Option<PaymentRecord> {
        self.records.read().get(id).cloned()
    }

    /// Whether a record id is present.
    pub fn contains(&self, id: &str) -> bool {
        self.records.read().contains_key(id)
    }

    /// Insert a record unless its id is already present.
    ///
    /// Returns `true` if the record was inserted, `false` if the id existed.
    pub fn insert_if_absent(&self, record: PaymentRecord) -> bool {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return false;
        }
        records.insert(record.id.clone(), record);
        true
    }

    /// Mark a stored record confirmed. No-op when the id is unknown.
    pub fn mark_confirmed(&self, id: &str) {
        if let Some(record) = self.records.write().get_mut(id) {
            record.status = RecordStatus::Confirmed;
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Snapshot of all records sorted by timestamp, with ties broken by
    /// origin node and id so every node lists the same order.
    pub fn list_sorted_by_timestamp(&self) -> Vec<PaymentRecord> {
        let mut records: Vec<PaymentRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| {
            a.order_key()
                .partial_cmp(&b.order_key())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        records
    }
}
