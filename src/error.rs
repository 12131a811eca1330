//! Error Types
//!
//! Typed errors for the client-facing write path. Each variant maps to one
//! HTTP status class; transient peer failures and log inconsistencies are
//! recovered internally and never surface here.

use thiserror::Error;

/// Errors surfaced to clients of a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Malformed or out-of-bounds payment request. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Write attempted on a non-leader node. Carries the current leader hint
    /// when one is known so the client can redirect.
    #[error("not the leader")]
    NotLeader {
        /// Node id of the known leader, if any
        leader: Option<String>,
    },

    /// Quorum was not reached within the consensus deadline. The record was
    /// not stored locally.
    #[error("consensus timeout: quorum not reached")]
    ConsensusTimeout,

    /// Unexpected internal failure; reported opaquely to the client.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl NodeError {
    /// HTTP status code for this error kind.
    pub fn status_code(&self) -> u16 {
        match self {
            NodeError::Validation(_) => 400,
            NodeError::NotLeader { .. } => 503,
            NodeError::ConsensusTimeout => 504,
            NodeError::Internal(_) => 500,
        }
    }
}
