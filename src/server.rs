use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::BufferConfig;
use crate::error::{codes, ErrorBody};
use crate::export::{EventBroadcaster, JobStatus, ParallelExecutor, StatusPayload};
use crate::models::ExecutionPlan;
use crate::source::RowSource;

/// HTTP server state
#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn RowSource>,
    pub broadcaster: EventBroadcaster,
    pub executor: Arc<ParallelExecutor>,
    /// Parent token for spawned jobs; cancelling it aborts every in-flight
    /// export
    pub jobs_ctx: CancellationToken,
}

/// Request body for starting an export job
#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub transport_id: String,
    pub job_version: String,
    pub owner: String,
    pub tables: Vec<String>,
    #[serde(default)]
    pub concurrency: i32,
    /// Optional buffer profile name: "default" / "high-performance" / "low-memory"
    pub profile: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExportAccepted {
    pub job_id: String,
    pub transport_id: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub source_connected: bool,
    pub source_message: String,
    pub subscribers: usize,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/exports", post(start_export))
        .route("/api/transports/:transport_id/events", get(transport_events))
        .route("/api/source/tables", get(list_tables))
        .route("/api/source/tables/:table/columns", get(table_columns))
        .route("/api/source/tables/:table/sample", get(table_sample))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody::new(code, message))).into_response()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.source.get_status().await;
    Json(HealthResponse {
        source_connected: status.connected,
        source_message: status.message,
        subscribers: state.broadcaster.client_count(),
    })
}

/// Validate the request, spawn the export job, and return its id immediately.
/// Progress is observed through the transport's SSE stream.
async fn start_export(
    State(state): State<AppState>,
    Json(request): Json<ExportRequest>,
) -> Response {
    if request.transport_id.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            codes::VALIDATION_ERROR,
            "transport_id must not be empty",
        );
    }
    if request.tables.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            codes::VALIDATION_ERROR,
            "tables must not be empty",
        );
    }

    let buffer_config = match &request.profile {
        None => None,
        Some(name) => match BufferConfig::profile(name) {
            Some(config) => Some(config),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    codes::VALIDATION_ERROR,
                    format!("unknown buffer profile: {}", name),
                );
            }
        },
    };

    let job_id = Uuid::new_v4().to_string();
    let plan = ExecutionPlan {
        transport_id: request.transport_id.clone(),
        job_id: job_id.clone(),
        job_version: request.job_version,
        tables: request.tables,
        owner: request.owner,
        concurrency: request.concurrency,
        buffer_config,
    };

    state.broadcaster.broadcast_status(StatusPayload {
        transport_id: plan.transport_id.clone(),
        job_id: job_id.clone(),
        table: None,
        status: JobStatus::Running,
        message: format!("export job {} accepted", job_id),
    });

    let executor = state.executor.clone();
    let ctx = state.jobs_ctx.child_token();
    let spawned_job_id = job_id.clone();
    tokio::spawn(async move {
        if let Err(e) = executor.execute(ctx, plan).await {
            error!(job_id = %spawned_job_id, code = e.code(), error = %e, "export job failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(ExportAccepted {
            job_id,
            transport_id: request.transport_id,
        }),
    )
        .into_response()
}

/// Detaches the broadcaster subscription when the SSE stream is dropped.
struct SubscriptionGuard {
    id: u64,
    broadcaster: EventBroadcaster,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broadcaster.unregister(self.id);
    }
}

/// SSE stream of export events for one transport.
///
/// Emits an initial `connected` event, then relays broadcaster events as
/// `event: {kind}` / `data: {json}` frames until the client disconnects or
/// the broadcaster shuts down.
async fn transport_events(
    Path(transport_id): Path<String>,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscriber = state.broadcaster.register(&transport_id);
    info!(transport_id = %transport_id, subscriber_id = subscriber.id, "SSE client connected");

    let guard = SubscriptionGuard {
        id: subscriber.id,
        broadcaster: state.broadcaster.clone(),
    };

    let connected = SseEvent::default().event("connected").data(
        serde_json::json!({ "transport_id": transport_id }).to_string(),
    );

    let events = ReceiverStream::new(subscriber.rx).map(move |event| {
        // Guard rides along with the stream; dropping the stream unregisters.
        let _ = &guard;
        Ok(SseEvent::default()
            .event(event.kind())
            .data(event.data_json()))
    });

    Sse::new(stream::once(async move { Ok(connected) }).chain(events))
        .keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct OwnerQuery {
    owner: String,
}

async fn list_tables(
    Query(query): Query<OwnerQuery>,
    State(state): State<AppState>,
) -> Response {
    match state.source.get_tables(&query.owner).await {
        Ok(tables) => Json(serde_json::json!({ "owner": query.owner, "tables": tables }))
            .into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.code(), e.to_string()),
    }
}

async fn table_columns(
    Path(table): Path<String>,
    Query(query): Query<OwnerQuery>,
    State(state): State<AppState>,
) -> Response {
    match state.source.get_table_columns(&query.owner, &table).await {
        Ok(columns) => Json(serde_json::json!({ "table": table, "columns": columns }))
            .into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.code(), e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct SampleQuery {
    owner: String,
    limit: Option<i64>,
}

async fn table_sample(
    Path(table): Path<String>,
    Query(query): Query<SampleQuery>,
    State(state): State<AppState>,
) -> Response {
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    match state.source.get_sample_data(&query.owner, &table, limit).await {
        Ok(rows) => Json(serde_json::json!({ "table": table, "rows": rows })).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.code(), e.to_string()),
    }
}
