//! Sandbox leases and the tool-execution boundary.
//!
//! A lease is a time-bounded exclusive claim on one remote execution
//! environment. The ttl is a hard ceiling enforced locally: once it
//! elapses the lease is dead no matter what the provider reports, and
//! the orchestrator must not send further tool calls through it.

use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::LeaseError;

/// A live claim on a remote execution environment. Owned exclusively
/// by one job for its whole run; never shared, never reused across jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLease {
    pub lease_id: String,
    pub job_id: i64,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: i64,
    /// Preview/exec endpoint for the sandboxed app.
    pub endpoint: String,
}

impl SandboxLease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.ttl_seconds)
    }

    /// Hard ttl check. Provider-reported liveness is irrelevant here.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Acquires and releases sandbox leases.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Provision a fresh environment for this job with the given ttl.
    async fn acquire(&self, job_id: i64, ttl_seconds: u64) -> Result<SandboxLease, LeaseError>;

    /// Advisory deallocation signal. Best-effort: safe to call zero or
    /// more times, must never block a job's terminal transition.
    /// Failures are logged by the implementation, not surfaced.
    async fn release(&self, lease_id: &str);
}

/// The four operations the sandbox exposes. Anything else the model
/// asks for is a fatal `UnknownTool` for the job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ReadFile,
    WriteFile,
    RunTerminalCommand,
    ListFiles,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::RunTerminalCommand => "run_terminal_command",
            Self::ListFiles => "list_files",
        }
    }

    pub const ALL: [ToolKind; 4] = [
        Self::ReadFile,
        Self::WriteFile,
        Self::RunTerminalCommand,
        Self::ListFiles,
    ];
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_file" => Ok(Self::ReadFile),
            "write_file" => Ok(Self::WriteFile),
            "run_terminal_command" => Ok(Self::RunTerminalCommand),
            "list_files" => Ok(Self::ListFiles),
            _ => Err(format!("Unknown tool: {}", s)),
        }
    }
}

/// A validated tool invocation ready to cross the sandbox boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub kind: ToolKind,
    pub args: serde_json::Value,
}

/// Executes validated tool calls inside a leased sandbox. Treated as an
/// opaque remote procedure boundary; the orchestrator applies its own
/// timeout around every call.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, lease: &SandboxLease, call: &ToolCall) -> Result<String>;
}
