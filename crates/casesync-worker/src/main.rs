//! HTTP trigger for case sync runs.

mod payload;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, info, warn};

use casesync_engine::connect::connect_database;
use casesync_engine::observability::init_logging;
use casesync_engine::{
    BlaiseDirectory, CancelToken, Orchestrator, ServiceConfig, SyncConfig, SyncError, SyncMode,
    SyncResult, TriggerRequest, TriggerResponse, trigger,
};

use payload::{CopyCasesResponse, HealthResponse};

/// The engine, or the reason it could not be built.
///
/// A worker with bad settings still serves requests so callers see the
/// configuration error instead of a dead endpoint.
#[derive(Clone)]
struct AppState {
    engine: Result<Arc<Orchestrator>, Arc<SyncError>>,
}

/// Cancels the run when the handler future is dropped, e.g. on client disconnect.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn copy_to_unedited_handler(
    State(state): State<AppState>,
    body: Result<Json<TriggerRequest>, JsonRejection>,
) -> (StatusCode, Json<CopyCasesResponse>) {
    copy_cases(&state, SyncMode::Unedited, request_from(body)).await
}

async fn copy_to_edit_handler(
    State(state): State<AppState>,
    body: Result<Json<TriggerRequest>, JsonRejection>,
) -> (StatusCode, Json<CopyCasesResponse>) {
    copy_cases(&state, SyncMode::Edit, request_from(body)).await
}

/// An unreadable body is treated like an empty one and rejected during validation.
fn request_from(body: Result<Json<TriggerRequest>, JsonRejection>) -> TriggerRequest {
    match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection, "ignoring unreadable request body");
            TriggerRequest::default()
        }
    }
}

async fn copy_cases(
    state: &AppState,
    mode: SyncMode,
    request: TriggerRequest,
) -> (StatusCode, Json<CopyCasesResponse>) {
    let response = match &state.engine {
        Err(err) => {
            let response = TriggerResponse::from_error(mode, err, None);
            error!(mode = mode.as_str(), "{}", response.message);
            response
        }
        Ok(orchestrator) => {
            let cancel = CancelToken::new();
            let _guard = CancelOnDrop(cancel.clone());
            // The deadline task exits once the guard cancels the token.
            let _deadline = orchestrator
                .config()
                .run_timeout
                .map(|timeout| cancel.cancel_after(timeout));
            trigger(orchestrator, &request, mode, &cancel).await
        }
    };
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.into()))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/copy-cases-to-unedited", post(copy_to_unedited_handler))
        .route("/copy-cases-to-edit", post(copy_to_edit_handler))
        .with_state(state)
}

async fn build_engine() -> SyncResult<Orchestrator> {
    let config = SyncConfig::from_env()?;
    let database = connect_database(&config.database);
    let directory = BlaiseDirectory::new(config.blaise.api_url.clone())
        .map_err(|source| SyncError::Client { source })?;
    let directory = Arc::new(directory);
    Orchestrator::new(config, directory, database)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let service = ServiceConfig::from_env().context("invalid service settings")?;
    init_logging(service.log_format);

    let engine = match build_engine().await {
        Ok(orchestrator) => Ok(Arc::new(orchestrator)),
        Err(err) => {
            error!(error = %err, "sync engine unavailable");
            Err(Arc::new(err))
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], service.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, router(AppState { engine }))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}
