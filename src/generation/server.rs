use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::config::PipelineConfig;

use super::agent::LlmStepRunner;
use super::api::{self, AppState};
use super::db::{DbHandle, GenerationDb};
use super::orchestrator::GenerationPipeline;
use super::provider::HttpSandboxProvider;
use super::quota::{QuotaLedger, SqliteQuotaLedger};

/// Configuration for the generation server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub pipeline: PipelineConfig,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8420,
            db_path: std::path::PathBuf::from(".atelier/atelier.db"),
            pipeline: PipelineConfig::default(),
            dev_mode: false,
        }
    }
}

/// Build the application router with state attached.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Wire the live pipeline: SQLite ledger, HTTP sandbox provider, and
/// LLM-backed step runner, all sharing one database handle.
pub fn build_state(db: DbHandle, config: &PipelineConfig) -> Arc<AppState> {
    let provider_token = std::env::var("ATELIER_PROVIDER_TOKEN").ok();
    let model_key = std::env::var("ATELIER_MODEL_KEY").ok();

    let quota: Arc<dyn QuotaLedger> = Arc::new(SqliteQuotaLedger::new(db.clone()));
    let provider = Arc::new(HttpSandboxProvider::new(&config.provider_url, provider_token));
    let leases: Arc<dyn super::sandbox::LeaseManager> = provider.clone();
    let tools: Arc<dyn super::sandbox::ToolExecutor> = provider;
    let runner = Arc::new(LlmStepRunner::new(&config.model_url, &config.model, model_key));

    let pipeline = Arc::new(GenerationPipeline::new(
        db.clone(),
        Arc::clone(&quota),
        leases,
        tools,
        runner,
        config.clone(),
    ));

    Arc::new(AppState { db, pipeline, quota })
}

/// Start the generation server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = GenerationDb::new(&config.db_path).context("Failed to initialize database")?;
    let state = build_state(DbHandle::new(db), &config.pipeline);

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "atelier listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("shutting down");
}
