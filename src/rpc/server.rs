//! HTTP Server
//!
//! warp routes exposing the node to clients and peers. Handlers delegate to
//! the host and subsystems and translate [`NodeError`] kinds into status
//! codes; every body in and out is JSON.

use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::error::NodeError;
use crate::node::Node;
use crate::rpc::wire::{
    BatchRequest, ConsensusRequest, ErrorBody, PaymentRequest, PingResponse, ReplicateRequest,
    TimeSyncRequest,
};

/// Build the full route tree for one node.
pub fn routes(
    node: Arc<Node>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let health = warp::path!("health")
        .and(warp::get())
        .and(with_node(Arc::clone(&node)))
        .and_then(handle_health);

    let ping = warp::path!("ping")
        .and(warp::get())
        .and(with_node(Arc::clone(&node)))
        .and_then(handle_ping);

    let status = warp::path!("status")
        .and(warp::get())
        .and(with_node(Arc::clone(&node)))
        .and_then(handle_status);

    let transactions = warp::path!("transactions")
        .and(warp::get())
        .and(with_node(Arc::clone(&node)))
        .and_then(handle_transactions);

    let payment = warp::path!("payment")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_node(Arc::clone(&node)))
        .and_then(handle_payment);

    let consensus = warp::path!("consensus")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_node(Arc::clone(&node)))
        .and_then(handle_consensus);

    let replicate_batch = warp::path!("replicate" / "batch")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_node(Arc::clone(&node)))
        .and_then(handle_replicate_batch);

    let replicate = warp::path!("replicate")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_node(Arc::clone(&node)))
        .and_then(handle_replicate);

    let time_sync = warp::path!("time_sync")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_node(node))
        .and_then(handle_time_sync);

    health
        .or(ping)
        .or(status)
        .or(transactions)
        .or(payment)
        .or(consensus)
        .or(replicate_batch)
        .or(replicate)
        .or(time_sync)
        .recover(handle_rejection)
}

fn with_node(node: Arc<Node>) -> impl Filter<Extract = (Arc<Node>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&node))
}

async fn handle_health(node: Arc<Node>) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&node.health_snapshot()))
}

async fn handle_ping(node: Arc<Node>) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&PingResponse {
        status: "ok".to_string(),
        node_id: node.node_id.clone(),
    }))
}

async fn handle_status(node: Arc<Node>) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&node.status_snapshot()))
}

async fn handle_transactions(node: Arc<Node>) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&node.transactions_snapshot()))
}

async fn handle_payment(
    request: PaymentRequest,
    node: Arc<Node>,
) -> Result<impl Reply, Infallible> {
    match node.submit_payment(request).await {
        Ok(response) => Ok(reply_with(StatusCode::OK, &response)),
        Err(err) => {
            let status =
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = match &err {
                NodeError::NotLeader { leader } => ErrorBody {
                    error: "not leader - cannot process payments".to_string(),
                    leader: leader.clone(),
                },
                NodeError::Internal(_) => ErrorBody::new("internal server error"),
                other => ErrorBody::new(other.to_string()),
            };
            Ok(reply_with(status, &body))
        }
    }
}

async fn handle_consensus(
    request: ConsensusRequest,
    node: Arc<Node>,
) -> Result<impl Reply, Infallible> {
    match request {
        ConsensusRequest::RequestVote(args) => {
            Ok(warp::reply::json(&node.consensus.handle_request_vote(&args)))
        }
        ConsensusRequest::AppendEntries(args) => {
            Ok(warp::reply::json(&node.consensus.handle_append_entries(&args)))
        }
    }
}

async fn handle_replicate(
    request: ReplicateRequest,
    node: Arc<Node>,
) -> Result<impl Reply, Infallible> {
    let response = node
        .replicator
        .handle_replication(&request.source_node, request.transaction);
    Ok(warp::reply::json(&response))
}

async fn handle_replicate_batch(
    request: BatchRequest,
    node: Arc<Node>,
) -> Result<impl Reply, Infallible> {
    let response =
        node.replicator
            .handle_batch(&request.source_node, request.transactions, request.is_sync);
    Ok(warp::reply::json(&response))
}

async fn handle_time_sync(
    request: TimeSyncRequest,
    node: Arc<Node>,
) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&node.time_sync.handle_sync_request(&request)))
}

fn reply_with<T: serde::Serialize>(status: StatusCode, body: &T) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(body), status)
}

/// Map filter rejections onto the JSON error shape.
async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found")
    } else if rejection
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        (StatusCode::BAD_REQUEST, "invalid request body")
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    };
    Ok(reply_with(status, &ErrorBody::new(message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::model::PaymentRecord;
    use crate::rpc::client::{MockPeerTransport, PeerTransport};
    use crate::rpc::wire::{
        AppendReply, BatchResponse, HealthResponse, ReplicateResponse, ReplicateStatus,
        TimeSyncReply, VoteReply,
    };

    fn test_node() -> Arc<Node> {
        let config = Arc::new(ClusterConfig::default());
        let transport: Arc<dyn PeerTransport> = Arc::new(MockPeerTransport::new());
        Node::with_transport("node1", config, transport).unwrap()
    }

    fn record(id: &str) -> PaymentRecord {
        let mut r = PaymentRecord::create(42.0, "alice".into(), "bob".into(), "node2".into());
        r.id = id.to_string();
        r
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let routes = routes(test_node());
        let response = warp::test::request().path("/health").reply(&routes).await;

        assert_eq!(response.status(), 200);
        let body: HealthResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.node_id, "node1");
        assert_eq!(body.status, "healthy");
        assert!(!body.is_leader);
        assert_eq!(body.transaction_count, 0);
    }

    #[tokio::test]
    async fn test_ping_endpoint() {
        let routes = routes(test_node());
        let response = warp::test::request().path("/ping").reply(&routes).await;

        assert_eq!(response.status(), 200);
        let body: PingResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn test_payment_validation_errors() {
        let routes = routes(test_node());

        let response = warp::test::request()
            .method("POST")
            .path("/payment")
            .json(&serde_json::json!({"amount": -5.0, "sender": "a", "receiver": "b"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 400);

        let response = warp::test::request()
            .method("POST")
            .path("/payment")
            .json(&serde_json::json!({"amount": 10.0, "sender": "a", "receiver": "a"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 400);

        // Non-numeric amount never reaches the handler
        let response = warp::test::request()
            .method("POST")
            .path("/payment")
            .json(&serde_json::json!({"amount": "ten", "sender": "a", "receiver": "b"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_payment_on_follower_rejected() {
        let routes = routes(test_node());
        let response = warp::test::request()
            .method("POST")
            .path("/payment")
            .json(&serde_json::json!({"amount": 10.0, "sender": "a", "receiver": "b"}))
            .reply(&routes)
            .await;

        assert_eq!(response.status(), 503);
        let body: ErrorBody = serde_json::from_slice(response.body()).unwrap();
        assert!(body.error.contains("not leader"));
    }

    #[tokio::test]
    async fn test_consensus_vote_endpoint() {
        let routes = routes(test_node());
        let response = warp::test::request()
            .method("POST")
            .path("/consensus")
            .json(&serde_json::json!({
                "type": "request_vote",
                "data": {
                    "term": 1,
                    "candidate_id": "node2",
                    "last_log_index": 0,
                    "last_log_term": 0
                }
            }))
            .reply(&routes)
            .await;

        assert_eq!(response.status(), 200);
        let body: VoteReply = serde_json::from_slice(response.body()).unwrap();
        assert!(body.vote_granted);
        assert_eq!(body.term, 1);
    }

    #[tokio::test]
    async fn test_consensus_append_endpoint() {
        let node = test_node();
        let routes = routes(Arc::clone(&node));
        let response = warp::test::request()
            .method("POST")
            .path("/consensus")
            .json(&serde_json::json!({
                "type": "append_entries",
                "data": {
                    "term": 1,
                    "leader_id": "node2",
                    "prev_log_index": 0,
                    "prev_log_term": 0,
                    "entries": [[1, "txn-1"]],
                    "leader_commit": 0
                }
            }))
            .reply(&routes)
            .await;

        assert_eq!(response.status(), 200);
        let body: AppendReply = serde_json::from_slice(response.body()).unwrap();
        assert!(body.success);
        assert_eq!(node.consensus.status().log_length, 1);
    }

    #[tokio::test]
    async fn test_replicate_endpoint_idempotent() {
        let node = test_node();
        let routes = routes(Arc::clone(&node));
        let body = serde_json::json!({
            "transaction": record("txn-1"),
            "source_node": "node2",
            "timestamp": 0.0
        });

        let response = warp::test::request()
            .method("POST")
            .path("/replicate")
            .json(&body)
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
        let first: ReplicateResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(first.status, ReplicateStatus::Success);

        // Identical replay answers duplicate/already_exists, store unchanged
        let response = warp::test::request()
            .method("POST")
            .path("/replicate")
            .json(&body)
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
        let second: ReplicateResponse = serde_json::from_slice(response.body()).unwrap();
        assert_ne!(second.status, ReplicateStatus::Success);
        assert_eq!(node.store.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_endpoint() {
        let node = test_node();
        let routes = routes(Arc::clone(&node));

        let response = warp::test::request()
            .method("POST")
            .path("/replicate/batch")
            .json(&serde_json::json!({
                "transactions": [record("txn-1"), record("txn-2")],
                "source_node": "node2",
                "is_sync": true
            }))
            .reply(&routes)
            .await;

        assert_eq!(response.status(), 200);
        let body: BatchResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.status, "completed");
        assert_eq!(body.successful_count, 2);
        assert_eq!(node.store.len(), 2);
    }

    #[tokio::test]
    async fn test_time_sync_endpoint() {
        let routes = routes(test_node());
        let response = warp::test::request()
            .method("POST")
            .path("/time_sync")
            .json(&serde_json::json!({"t1": 1000.0, "node_id": "node2"}))
            .reply(&routes)
            .await;

        assert_eq!(response.status(), 200);
        let body: TimeSyncReply = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.t2, body.t3);
        assert!(body.t2 > 0.0);
    }

    #[tokio::test]
    async fn test_transactions_sorted() {
        let node = test_node();
        let mut early = record("txn-early");
        early.timestamp = 1.0;
        let mut late = record("txn-late");
        late.timestamp = 2.0;
        node.store.insert_if_absent(late);
        node.store.insert_if_absent(early);

        let routes = routes(Arc::clone(&node));
        let response = warp::test::request().path("/transactions").reply(&routes).await;

        assert_eq!(response.status(), 200);
        let body: crate::rpc::wire::TransactionsResponse =
            serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.total_count, 2);
        assert_eq!(body.transactions[0].id, "txn-early");
    }

    #[tokio::test]
    async fn test_unknown_path_is_json_404() {
        let routes = routes(test_node());
        let response = warp::test::request().path("/nope").reply(&routes).await;

        assert_eq!(response.status(), 404);
        let body: ErrorBody = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.error, "not found");
    }
}
