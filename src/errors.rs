//! Typed error hierarchy for the atelier generation pipeline.
//!
//! Three leaf enums cover the three collaborating subsystems:
//! - `QuotaError` — admission ledger failures (always fail closed)
//! - `LeaseError` — sandbox provisioning failures
//! - `AgentError` — step-runner failures
//!
//! `PipelineError` aggregates them for the orchestrator's public surface.

use thiserror::Error;

/// Errors from the quota ledger. Callers must treat any of these as
/// "not admitted" — a storage failure never grants admission.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("Quota storage unavailable: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("Unknown plan '{0}'")]
    UnknownPlan(String),
}

/// Errors from sandbox lease acquisition.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Transient provider failure. Retryable at the orchestrator level
    /// with bounded attempts.
    #[error("Sandbox provisioning failed: {0}")]
    ProvisionFailed(String),

    /// The provider refused capacity for this account. Fatal for the job.
    #[error("Sandbox provider capacity quota exceeded")]
    ProviderQuotaExceeded,
}

impl LeaseError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProvisionFailed(_))
    }
}

/// Errors from a single agent step.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Model requested unknown tool '{tool}'")]
    UnknownTool { tool: String },

    #[error("Model reply could not be interpreted: {0}")]
    MalformedReply(String),

    #[error("Model endpoint error: {0}")]
    Upstream(#[source] anyhow::Error),
}

/// Errors from the generation orchestrator's public surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Job {id} not found")]
    JobNotFound { id: i64 },

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}
