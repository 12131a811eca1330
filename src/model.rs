//! Payment Data Model
//!
//! Core record types shared by the consensus, replication, and dedup layers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a payment record.
///
/// A record is `Pending` from acceptance until majority commit, then
/// `Confirmed`. Status is the only field that changes after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Accepted but not yet committed by a majority
    Pending,
    /// Committed; durable on a quorum of nodes
    Confirmed,
}

/// A single payment transaction.
///
/// Immutable after commit except for [`RecordStatus`]. The `origin_node`
/// field is serialised as `node_id` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Globally unique id, issued by the accepting node
    pub id: String,
    /// Positive amount, bounded by the configured maximum
    pub amount: f64,
    /// Paying party
    pub sender: String,
    /// Receiving party
    pub receiver: String,
    /// Cluster-synchronised unix seconds
    pub timestamp: f64,
    /// Current lifecycle status
    pub status: RecordStatus,
    /// Node that accepted the payment
    #[serde(rename = "node_id")]
    pub origin_node: String,
}

impl PaymentRecord {
    /// Create a new pending record with a fresh UUID.
    ///
    /// The timestamp starts at zero; the accepting node stamps it with
    /// cluster time before proposing.
    pub fn create(amount: f64, sender: String, receiver: String, origin_node: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            amount,
            sender,
            receiver,
            timestamp: 0.0,
            status: RecordStatus::Pending,
            origin_node,
        }
    }

    /// Sort key giving records a total order: timestamps first, ties broken
    /// by origin node then id.
    pub fn order_key(&self) -> (f64, &str, &str) {
        (self.timestamp, &self.origin_node, &self.id)
    }
}
