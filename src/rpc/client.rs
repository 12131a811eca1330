//! Peer RPC Client
//!
//! Outbound transport abstraction and its HTTP implementation. The
//! subsystems talk to peers only through [`PeerTransport`], which keeps the
//! protocol logic testable against a mock and pins every call to the
//! timeout configured for its request class.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{secs, ClusterConfig};
use crate::rpc::wire::{
    AppendArgs, AppendReply, BatchRequest, BatchResponse, ConsensusRequest, HealthResponse,
    ReplicateRequest, ReplicateResponse, TimeSyncReply, TimeSyncRequest, VoteArgs, VoteReply,
};

/// Outbound RPCs to a peer, addressed by node id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Solicit a vote from a peer.
    async fn request_vote(&self, peer: &str, args: &VoteArgs) -> Result<VoteReply>;

    /// Send a heartbeat or log suffix to a peer.
    async fn append_entries(&self, peer: &str, args: &AppendArgs) -> Result<AppendReply>;

    /// Push one record to a peer.
    async fn replicate(&self, peer: &str, request: &ReplicateRequest) -> Result<ReplicateResponse>;

    /// Push a batch of records to a peer.
    async fn replicate_batch(&self, peer: &str, request: &BatchRequest) -> Result<BatchResponse>;

    /// Run one clock exchange with a peer.
    async fn time_sync(&self, peer: &str, request: &TimeSyncRequest) -> Result<TimeSyncReply>;

    /// Probe a peer's liveness.
    async fn check_health(&self, peer: &str) -> Result<HealthResponse>;
}

/// JSON-over-HTTP transport backed by a pooled reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
    config: Arc<ClusterConfig>,
}

impl HttpTransport {
    /// Create a transport resolving peers through the cluster config.
    pub fn new(config: Arc<ClusterConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, peer: &str, path: &str) -> Result<String> {
        let addr = self
            .config
            .address_of(peer)
            .with_context(|| format!("unknown peer {peer}"))?;
        Ok(format!("http://{addr}{path}"))
    }

    async fn post_json<B, R>(&self, peer: &str, path: &str, body: &B, timeout: Duration) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(peer, path)?;
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("{url} answered {status}");
        }
        response
            .json()
            .await
            .with_context(|| format!("malformed response from {url}"))
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn request_vote(&self, peer: &str, args: &VoteArgs) -> Result<VoteReply> {
        let body = ConsensusRequest::RequestVote(args.clone());
        self.post_json(peer, "/consensus", &body, secs(self.config.consensus.timeout_secs))
            .await
    }

    async fn append_entries(&self, peer: &str, args: &AppendArgs) -> Result<AppendReply> {
        let body = ConsensusRequest::AppendEntries(args.clone());
        self.post_json(peer, "/consensus", &body, secs(self.config.consensus.timeout_secs))
            .await
    }

    async fn replicate(&self, peer: &str, request: &ReplicateRequest) -> Result<ReplicateResponse> {
        self.post_json(peer, "/replicate", request, secs(self.config.replication.timeout_secs))
            .await
    }

    async fn replicate_batch(&self, peer: &str, request: &BatchRequest) -> Result<BatchResponse> {
        self.post_json(
            peer,
            "/replicate/batch",
            request,
            secs(self.config.replication.batch_timeout_secs),
        )
        .await
    }

    async fn time_sync(&self, peer: &str, request: &TimeSyncRequest) -> Result<TimeSyncReply> {
        self.post_json(peer, "/time_sync", request, secs(self.config.time_sync.timeout_secs))
            .await
    }

    async fn check_health(&self, peer: &str) -> Result<HealthResponse> {
        let url = self.url(peer, "/health")?;
        let response = self
            .client
            .get(&url)
            .timeout(secs(self.config.health.probe_timeout_secs))
            .send()
            .await
            .with_context(|| format!("health probe to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("{url} answered {status}");
        }
        response
            .json()
            .await
            .with_context(|| format!("malformed health response from {url}"))
    }
}
