use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A user's generation request. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub principal_id: String,
    pub prompt: String,
    pub plan: String,
    pub created_at: String,
}

/// Lifecycle of a generation job. Transitions are monotonic; a job
/// never revisits a prior state, and the two terminal states absorb.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Admitted,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Admitted => "admitted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Position in the forward-only status order. Both terminal states
    /// share the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Admitted => 1,
            Self::Running => 2,
            Self::Succeeded | Self::Failed => 3,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "admitted" => Ok(Self::Admitted),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Why a job ended in `Failed`. Stored on the Result and rendered to
/// the user via `user_message`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    QuotaExhausted,
    SandboxUnavailable,
    UnknownTool,
    StepBudgetExceeded,
    LeaseExpired,
    StepFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaExhausted => "quota_exhausted",
            Self::SandboxUnavailable => "sandbox_unavailable",
            Self::UnknownTool => "unknown_tool",
            Self::StepBudgetExceeded => "step_budget_exceeded",
            Self::LeaseExpired => "lease_expired",
            Self::StepFailed => "step_failed",
        }
    }

    /// Human-readable message shown to the requesting user. Internal
    /// faults are deliberately generic.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::QuotaExhausted => {
                "You have used all generation credits for this billing window."
            }
            Self::SandboxUnavailable => {
                "No execution environment could be provisioned. Please try again later."
            }
            Self::LeaseExpired => "The generation ran out of time before completing.",
            Self::UnknownTool | Self::StepBudgetExceeded | Self::StepFailed => {
                "Generation failed before producing a complete app."
            }
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quota_exhausted" => Ok(Self::QuotaExhausted),
            "sandbox_unavailable" => Ok(Self::SandboxUnavailable),
            "unknown_tool" => Ok(Self::UnknownTool),
            "step_budget_exceeded" => Ok(Self::StepBudgetExceeded),
            "lease_expired" => Ok(Self::LeaseExpired),
            "step_failed" => Ok(Self::StepFailed),
            _ => Err(format!("Invalid failure reason: {}", s)),
        }
    }
}

/// One job per request, driven Pending → terminal by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub request_id: i64,
    pub status: JobStatus,
    pub attempt_count: i64,
    pub sandbox_lease_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// How a single recorded step ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepDisposition {
    Completed,
    Failed,
}

impl StepDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for StepDisposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid step disposition: {}", s)),
        }
    }
}

/// One entry of a job's step trace. Append-only while the job runs;
/// immutable once the job terminates. `tool` is None for turns where
/// the model produced text without invoking a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub seq: i64,
    pub tool: Option<String>,
    pub input: String,
    pub output: String,
    pub outcome: StepDisposition,
}

/// The durable terminal outcome of a job. Written exactly once, in the
/// same transaction that moves the job into a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub job_id: i64,
    pub status: JobStatus,
    pub title: String,
    pub summary: String,
    pub files: BTreeMap<String, String>,
    pub sandbox_endpoint: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub created_at: String,
}

/// The orchestrator's sole entry point, delivered at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub job_id: i64,
    pub request_id: i64,
    pub principal_id: String,
}
