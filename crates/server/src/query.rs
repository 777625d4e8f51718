use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use opsdesk_agent::conversation::HistoryEntry;
use opsdesk_agent::format::PlainMarkup;
use opsdesk_agent::metrics::{MetricsRecorder, StatsSnapshot};
use opsdesk_agent::{InboundRequest, RequestPipeline};
use opsdesk_core::errors::InterfaceError;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct QueryState {
    pub pipeline: Arc<RequestPipeline>,
    pub metrics: Arc<MetricsRecorder>,
    pub shutdown: CancellationToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryRole {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct QueryTurn {
    pub role: QueryRole,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub history: Vec<QueryTurn>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueryResponse {
    pub reply: String,
    pub tools_used: Vec<String>,
    pub hit_limit: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueryError {
    pub error: String,
    pub correlation_id: String,
}

pub fn router(state: QueryState) -> Router {
    Router::new()
        .route("/query", post(query))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Runs one IDE request through the pipeline and returns the plain-text reply.
pub async fn query(
    State(state): State<QueryState>,
    Json(body): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, Json<QueryError>)> {
    let mut request = InboundRequest::new(body.text);
    if request.text.trim().is_empty() {
        let error = InterfaceError::BadRequest {
            message: "text must not be empty".to_string(),
            correlation_id: request.correlation_id.to_string(),
        };
        return Err((
            StatusCode::BAD_REQUEST,
            Json(QueryError {
                error: error.to_string(),
                correlation_id: error.correlation_id().to_string(),
            }),
        ));
    }

    request.history = body
        .history
        .into_iter()
        .map(|turn| match turn.role {
            QueryRole::User => HistoryEntry::user(turn.content),
            QueryRole::Assistant => HistoryEntry::bot(turn.content),
        })
        .collect();

    info!(
        event_name = "ingress.ide.query_received",
        correlation_id = %request.correlation_id,
        thread_id = "unknown",
        history = request.history.len(),
        "received ide query"
    );

    let reply = state
        .pipeline
        .process(&request, &PlainMarkup, &state.shutdown.child_token())
        .await;

    Ok(Json(QueryResponse {
        reply: reply.text,
        tools_used: reply.tools_used,
        hit_limit: reply.hit_limit,
    }))
}

pub async fn metrics(State(state): State<QueryState>) -> Json<StatsSnapshot> {
    Json(state.metrics.snapshot())
}
