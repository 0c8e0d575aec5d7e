//! HTTP surface: peer RPC endpoints and the client REST API.

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::ReplicaError;
use crate::message::{ReplicateAck, ReplicateKind, ReplicateRequest, VoteRequest, VoteResponse};
use crate::replica::{Replica, ReplicaStatus};
use crate::wal::Op;

type Shared = Arc<Replica>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub operand: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct WriteParams {
    pub value: Option<String>,
    pub expected: Option<String>,
}

pub fn router(replica: Shared) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/status", get(status))
        .route("/vote", post(vote))
        .route("/replicate/:kind", post(replicate))
        .route(
            "/kvs/:key",
            get(read_key)
                .post(create_key)
                .patch(update_key)
                .put(swap_key)
                .delete(delete_key),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(replica)
}

/// Serves the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, replica: Shared, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(replica))
        .with_graceful_shutdown(shutdown)
        .await
}

impl IntoResponse for ReplicaError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReplicaError::KeyExists(_) | ReplicaError::CasMismatch { .. } => StatusCode::CONFLICT,
            ReplicaError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            ReplicaError::StaleTerm { .. }
            | ReplicaError::Rejected { .. }
            | ReplicaError::Unsupported(_) => StatusCode::BAD_REQUEST,
            ReplicaError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ReplicaError::NotLeader { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ReplicaError::Log(_)
            | ReplicaError::Storage(_)
            | ReplicaError::Consistency(_)
            | ReplicaError::Driver(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

async fn hello(State(replica): State<Shared>) -> String {
    let status = replica.status().await;
    format!(
        "replica {} is {} in term {} (leader: {})\n",
        status.addr,
        status.role,
        status.term,
        status.leader.as_deref().unwrap_or("unknown")
    )
}

async fn status(State(replica): State<Shared>) -> Json<ReplicaStatus> {
    Json(replica.status().await)
}

async fn vote(State(replica): State<Shared>, Json(request): Json<VoteRequest>) -> Json<VoteResponse> {
    Json(replica.handle_vote_request(request).await)
}

async fn replicate(
    State(replica): State<Shared>,
    Path(kind): Path<String>,
    Json(request): Json<ReplicateRequest>,
) -> Result<Json<ReplicateAck>, Response> {
    let kind: ReplicateKind = kind
        .parse()
        .map_err(|err: crate::message::UnknownKind| (StatusCode::BAD_REQUEST, err.to_string()).into_response())?;
    replica
        .handle_replicate(kind, request)
        .await
        .map(Json)
        .map_err(IntoResponse::into_response)
}

async fn read_key(State(replica): State<Shared>, Path(key): Path<String>) -> Result<Json<KeyValue>, ReplicaError> {
    let value = replica.read_local(&key)?;
    Ok(Json(KeyValue { operand: key, value }))
}

async fn create_key(
    State(replica): State<Shared>,
    Path(key): Path<String>,
    Query(params): Query<WriteParams>,
    uri: Uri,
) -> Response {
    let Some(value) = params.value else {
        return missing("value");
    };
    let result = replica.submit(Op::Create, &key, &value).await;
    respond(&uri, key, result, StatusCode::CREATED)
}

async fn update_key(
    State(replica): State<Shared>,
    Path(key): Path<String>,
    Query(params): Query<WriteParams>,
    uri: Uri,
) -> Response {
    let Some(value) = params.value else {
        return missing("value");
    };
    let result = replica.submit(Op::Update, &key, &value).await;
    respond(&uri, key, result, StatusCode::OK)
}

async fn swap_key(
    State(replica): State<Shared>,
    Path(key): Path<String>,
    Query(params): Query<WriteParams>,
    uri: Uri,
) -> Response {
    let (Some(expected), Some(value)) = (params.expected, params.value) else {
        return missing("expected and value");
    };
    let result = replica.compare_and_swap(&key, &expected, &value).await;
    respond(&uri, key, result, StatusCode::OK)
}

async fn delete_key(State(replica): State<Shared>, Path(key): Path<String>, uri: Uri) -> Response {
    let result = replica.submit(Op::Delete, &key, "").await;
    respond(&uri, key, result, StatusCode::OK)
}

fn missing(what: &str) -> Response {
    (StatusCode::BAD_REQUEST, format!("missing query parameter: {what}")).into_response()
}

/// Turns a write outcome into a response, redirecting to the leader when
/// this replica is not it.
fn respond(uri: &Uri, key: String, result: Result<String, ReplicaError>, ok: StatusCode) -> Response {
    match result {
        Ok(value) => (ok, Json(KeyValue { operand: key, value })).into_response(),
        Err(ReplicaError::NotLeader { leader: Some(leader) }) => {
            let target = format!(
                "http://{leader}{}",
                uri.path_and_query().map_or(uri.path(), |pq| pq.as_str())
            );
            debug!(%target, "redirecting write to leader");
            (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, target)]).into_response()
        }
        Err(err) => err.into_response(),
    }
}
