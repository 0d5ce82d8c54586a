//! Axum invocation surface: one POST runs the job once.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rdstats_sync::{JobConfig, JobRunner, RankedStatsPipeline, RunSummary};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info};

pub const CRATE_NAME: &str = "rdstats-web";

#[derive(Clone)]
pub struct AppState {
    runner: Arc<dyn JobRunner>,
    last_run: Arc<RwLock<Option<RunSummary>>>,
}

impl AppState {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            runner,
            last_run: Arc::default(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/invoke", post(invoke_handler))
        .route("/runs/last", get(last_run_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(JobConfig::from_env()?).await
}

pub async fn serve(config: JobConfig) -> anyhow::Result<()> {
    let pipeline = RankedStatsPipeline::from_config(&config, config.profile.clone())?;
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, profile = %config.profile.name, "serving invocations");
    axum::serve(listener, app(AppState::new(Arc::new(pipeline)))).await?;
    Ok(())
}

/// 200 with an empty body on success.
async fn invoke_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.run_job().await {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                published = summary.published_results,
                "invocation complete"
            );
            *state.last_run.write().await = Some(summary);
            StatusCode::OK.into_response()
        }
        Err(err) => {
            error!(stage = %err.stage(), error = %err, "invocation failed");
            let body = format!("{} failed: {}", err.stage(), err);
            (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
        }
    }
}

async fn last_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.last_run.read().await.clone() {
        Some(summary) => Json(summary).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}
