//! HTTP server.
//!
//! Publishes raw snippet events into the broker and exposes read-only run
//! inspection for operators. Started by `snip serve` alongside the consumer.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/topics/{topic}` | Publish the request body to a configured topic (202) |
//! | `GET`  | `/runs` | List runs, optionally `?status=running&limit=20` |
//! | `GET`  | `/runs/{run_id}` | One run with its step attempts and outputs |
//! | `POST` | `/runs/{run_id}/cancel` | Request cooperative cancellation |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "run not found: snippet-ingestion-x" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `unavailable` (503),
//! `internal` (500).

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::broker::key_of;
use crate::error::OrchestratorError;
use crate::models::IndexResult;
use crate::orchestrator::{Run, RunFilter, RunStatus};
use crate::runtime::App;

#[derive(Clone)]
struct AppState {
    app: Arc<App>,
}

/// Build the router. Exposed separately so tests can serve it on an
/// ephemeral port.
pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/topics/{topic}", post(handle_publish))
        .route("/runs", get(handle_list_runs))
        .route("/runs/{run_id}", get(handle_get_run))
        .route("/runs/{run_id}/cancel", post(handle_cancel_run))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { app })
}

/// Serve until `shutdown` fires.
pub async fn run_server(app: Arc<App>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("Listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "http server started");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Run everything `snip serve` needs until ctrl-c: resumed runs, the
/// consumer, hourly retention pruning and the HTTP server.
pub async fn serve(app: Arc<App>) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let resumed = app.orchestrator.resume_incomplete().await?;
    if resumed > 0 {
        println!("Resumed {} unfinished run(s)", resumed);
    }

    let consumer = {
        let consumer = app.consumer.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { consumer.run(token).await })
    };

    {
        let orchestrator = app.orchestrator.clone();
        let retention = Duration::from_secs(app.config.orchestrator.retention_hours * 3600);
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = orchestrator.prune(retention).await {
                            tracing::warn!(error = %e, "retention prune failed");
                        }
                    }
                }
            }
        });
    }

    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("shutdown requested");
                    token.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "cannot listen for ctrl-c"),
            }
        });
    }

    let served = run_server(app, shutdown.clone()).await;
    shutdown.cancel();
    consumer.await??;
    served
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %format!("{:#}", err), "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::RunNotFound(_) => not_found(err.to_string()),
            OrchestratorError::Unavailable(_) => AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "unavailable",
                message: err.to_string(),
            },
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /topics/{topic} ============

#[derive(Serialize)]
struct PublishResponse {
    topic: String,
    partition: u32,
    offset: i64,
}

/// Append the raw body to a topic. The body is validated by the consumer,
/// not here, so poison messages take the same path as in production.
async fn handle_publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    if !state.app.config.broker.topics.all().contains(&topic) {
        return Err(not_found(format!("unknown topic: {}", topic)));
    }
    if body.is_empty() {
        return Err(bad_request("request body must not be empty"));
    }

    let key = key_of(&body);
    let (partition, offset) = state
        .app
        .broker
        .publish(&topic, key.as_deref(), &body)
        .await
        .map_err(internal)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            topic,
            partition,
            offset,
        }),
    ))
}

// ============ GET /runs ============

#[derive(Deserialize)]
struct ListParams {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct RunListResponse {
    runs: Vec<Run>,
}

async fn handle_list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<RunListResponse>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<RunStatus>)
        .transpose()
        .map_err(|e| bad_request(e.to_string()))?;

    let filter = RunFilter {
        status,
        task_queue: None,
        limit: Some(params.limit.unwrap_or(100)),
    };
    let runs = state.app.orchestrator.list(&filter).await?;
    Ok(Json(RunListResponse { runs }))
}

// ============ GET /runs/{run_id} ============

#[derive(Serialize)]
struct RunResponse {
    #[serde(flatten)]
    run: Run,
    #[serde(skip_serializing_if = "Option::is_none")]
    index_result: Option<IndexResult>,
}

async fn handle_get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, AppError> {
    let run = state.app.orchestrator.status(&run_id).await?;
    let index_result = run.index_result();
    Ok(Json(RunResponse { run, index_result }))
}

// ============ POST /runs/{run_id}/cancel ============

#[derive(Serialize)]
struct CancelResponse {
    run_id: String,
    cancelled: bool,
}

async fn handle_cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let cancelled = state.app.orchestrator.cancel(&run_id).await?;
    Ok(Json(CancelResponse { run_id, cancelled }))
}
