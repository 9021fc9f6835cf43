// SPDX-License-Identifier: MIT

//! HTTP front end for the coordinator

use crate::adk::error::{BoxError, EnsembleError};
use crate::ensemble::engine::{ExecutionCoordinator, TraceEvent};
use crate::ensemble::workflow::WorkflowDefinition;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{Request, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const DEFAULT_PAGE: usize = 100;
const STREAM_POLL: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct AppState {
    pub coordinator: ExecutionCoordinator,
}

pub fn router(coordinator: ExecutionCoordinator) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/executions", post(create_execution).get(list_executions))
        .route("/api/executions/{id}", get(get_status).delete(delete_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/trace", get(get_trace))
        .route("/api/executions/{id}/trace/stream", get(stream_trace))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                tracing::info_span!("http", method = %req.method(), uri = %req.uri())
            }),
        )
        .layer(CorsLayer::permissive())
        .with_state(AppState { coordinator })
}

pub async fn serve(coordinator: ExecutionCoordinator, port: u16) -> Result<(), BoxError> {
    let app = router(coordinator);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    log::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Maps engine errors onto HTTP status codes
pub struct ApiError(EnsembleError);

impl From<EnsembleError> for ApiError {
    fn from(err: EnsembleError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EnsembleError::Validation(_) | EnsembleError::Json(_) | EnsembleError::Yaml(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EnsembleError::NotFound(_) => StatusCode::NOT_FOUND,
            EnsembleError::ExecutionActive(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("Request failed: {}", self.0);
        }
        let body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct CreateRequest {
    config: WorkflowDefinition,
    #[serde(default)]
    job_id: Option<String>,
}

async fn create_execution(
    State(state): State<AppState>,
    Json(payload): Json<CreateRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let created = state.coordinator.create(&payload.config, payload.job_id)?;
    Ok((StatusCode::ACCEPTED, Json(json!(created))))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let executions = state
        .coordinator
        .list_executions(query.offset, query.limit.unwrap_or(DEFAULT_PAGE))
        .await?;
    Ok(Json(json!(executions)))
}

async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let report = state.coordinator.get_status(&id).await?;
    Ok(Json(json!(report)))
}

async fn delete_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.coordinator.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = state.coordinator.cancel(&id).await?;
    Ok(Json(json!({ "execution_id": id, "cancelled": cancelled })))
}

#[derive(Debug, Default, Deserialize)]
struct TraceQuery {
    #[serde(default)]
    since: u64,
    #[serde(default)]
    limit: Option<usize>,
}

async fn get_trace(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TraceQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = state
        .coordinator
        .get_trace(&id, query.since, query.limit.unwrap_or(DEFAULT_PAGE))
        .await?;
    Ok(Json(json!(page)))
}

/// Server-sent trace events, starting after `since`, until the execution is
/// terminal and its trace has been drained.
async fn stream_trace(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TraceQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Fail fast on unknown ids instead of opening an empty stream
    state.coordinator.get_status(&id).await?;

    let (tx, rx) = mpsc::channel::<TraceEvent>(100);
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        let mut cursor = query.since;
        loop {
            let terminal = match coordinator.get_status(&id).await {
                Ok(report) => report.status.is_terminal(),
                Err(e) => {
                    log::warn!("Trace stream for {} stopped: {}", id, e);
                    return;
                }
            };
            let page = match coordinator.get_trace(&id, cursor, DEFAULT_PAGE).await {
                Ok(page) => page,
                Err(e) => {
                    log::warn!("Trace stream for {} stopped: {}", id, e);
                    return;
                }
            };
            let drained = page.events.is_empty();
            cursor = page.next_cursor;
            for event in page.events {
                if tx.send(event).await.is_err() {
                    return; // client went away
                }
            }
            if terminal && drained {
                return;
            }
            if drained {
                tokio::time::sleep(STREAM_POLL).await;
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let sse = Event::default().id(event.sequence.to_string());
        Ok(sse
            .json_data(&event)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(1))))
}
