//! End-to-end tests for the generation job state machine, driven with
//! scripted in-process fakes for the lease provider, tool executor,
//! and step runner.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use atelier::config::PipelineConfig;
use atelier::errors::{AgentError, LeaseError, PipelineError};
use atelier::generation::agent::{FinalOutput, StepOutcome, StepRunner};
use atelier::generation::db::{DbHandle, GenerationDb};
use atelier::generation::models::{
    FailureReason, JobStatus, StepDisposition, StepRecord, TriggerEvent,
};
use atelier::generation::orchestrator::GenerationPipeline;
use atelier::generation::quota::{Plan, QuotaLedger, SqliteQuotaLedger};
use atelier::generation::sandbox::{LeaseManager, SandboxLease, ToolCall, ToolExecutor};

// ── Fakes ─────────────────────────────────────────────────────────────

/// Lease provider with a scripted sequence of outcomes. Once the
/// script is drained, every acquire succeeds.
struct ScriptedLeases {
    script: Mutex<VecDeque<Result<(), LeaseError>>>,
    /// Overrides the requested ttl on minted leases (0 = born expired).
    ttl_override: Option<i64>,
    acquired: Mutex<u32>,
    released: Mutex<Vec<String>>,
}

impl ScriptedLeases {
    fn always_ok() -> Self {
        Self::with_script(Vec::new())
    }

    fn with_script(script: Vec<Result<(), LeaseError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ttl_override: None,
            acquired: Mutex::new(0),
            released: Mutex::new(Vec::new()),
        }
    }

    fn expired_on_arrival() -> Self {
        Self {
            ttl_override: Some(0),
            ..Self::always_ok()
        }
    }

    fn acquire_count(&self) -> u32 {
        *self.acquired.lock().unwrap()
    }

    fn released_ids(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl LeaseManager for ScriptedLeases {
    async fn acquire(&self, job_id: i64, ttl_seconds: u64) -> Result<SandboxLease, LeaseError> {
        let n = {
            let mut acquired = self.acquired.lock().unwrap();
            *acquired += 1;
            *acquired
        };
        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            outcome?;
        }
        Ok(SandboxLease {
            lease_id: format!("lease-{}-{}", job_id, n),
            job_id,
            created_at: Utc::now(),
            ttl_seconds: self.ttl_override.unwrap_or(ttl_seconds as i64),
            endpoint: format!("http://sandbox-{}.test", job_id),
        })
    }

    async fn release(&self, lease_id: &str) {
        self.released.lock().unwrap().push(lease_id.to_string());
    }
}

/// Records every tool call; outcome is fixed at construction.
struct RecordingTools {
    calls: Mutex<Vec<String>>,
    fail: bool,
    delay: Option<Duration>,
}

impl RecordingTools {
    fn ok() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: false,
            delay: None,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::ok()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::ok()
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolExecutor for RecordingTools {
    async fn execute(&self, _lease: &SandboxLease, call: &ToolCall) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(call.kind.as_str().to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("exec failed inside sandbox");
        }
        Ok("tool output".to_string())
    }
}

/// Step runner replaying a scripted sequence of outcomes. Once drained
/// it keeps answering `Continue` so budget tests can run it dry.
struct ScriptedRunner {
    script: Mutex<VecDeque<Result<StepOutcome, AgentError>>>,
}

impl ScriptedRunner {
    fn with_script(script: Vec<Result<StepOutcome, AgentError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }

    fn never_finishes() -> Self {
        Self::with_script(Vec::new())
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run_step(
        &self,
        _goal: &str,
        _trace: &[StepRecord],
    ) -> Result<StepOutcome, AgentError> {
        match self.script.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(StepOutcome::Continue {
                text: "thinking".to_string(),
            }),
        }
    }
}

fn tool_step(tool: &str) -> Result<StepOutcome, AgentError> {
    Ok(StepOutcome::ToolRequest {
        tool: tool.to_string(),
        args: serde_json::json!({"path": "index.html"}),
    })
}

fn done_step(title: &str) -> Result<StepOutcome, AgentError> {
    let mut files = BTreeMap::new();
    files.insert("index.html".to_string(), "<html></html>".to_string());
    Ok(StepOutcome::Done(FinalOutput {
        title: title.to_string(),
        summary: "generated the app".to_string(),
        files,
    }))
}

// ── Harness ───────────────────────────────────────────────────────────

struct Harness {
    db: DbHandle,
    pipeline: Arc<GenerationPipeline>,
    quota: Arc<SqliteQuotaLedger>,
    leases: Arc<ScriptedLeases>,
    tools: Arc<RecordingTools>,
}

impl Harness {
    fn new(
        config: PipelineConfig,
        leases: ScriptedLeases,
        tools: RecordingTools,
        runner: ScriptedRunner,
    ) -> Self {
        let db = DbHandle::new(GenerationDb::new_in_memory().unwrap());
        let quota = Arc::new(SqliteQuotaLedger::new(db.clone()));
        let leases = Arc::new(leases);
        let tools = Arc::new(tools);
        let pipeline = Arc::new(GenerationPipeline::new(
            db.clone(),
            quota.clone(),
            leases.clone(),
            tools.clone(),
            Arc::new(runner),
            config,
        ));
        Self {
            db,
            pipeline,
            quota,
            leases,
            tools,
        }
    }

    /// Fast-retry config so provisioning tests do not sleep for real.
    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            provision_backoff_ms: 1,
            ..PipelineConfig::default()
        }
    }

    async fn seed(&self, principal: &str, plan: Plan) -> TriggerEvent {
        let principal = principal.to_string();
        let (request, job) = self
            .db
            .call(move |db| {
                let request = db.create_request(&principal, "build me a todo app", plan)?;
                let job = db.create_job(request.id)?;
                Ok((request, job))
            })
            .await
            .unwrap();
        TriggerEvent {
            job_id: job.id,
            request_id: request.id,
            principal_id: request.principal_id,
        }
    }

    async fn trace(&self, job_id: i64) -> Vec<StepRecord> {
        self.db.call(move |db| db.get_trace(job_id)).await.unwrap()
    }

    async fn result(&self, job_id: i64) -> Option<atelier::generation::models::GenerationResult> {
        self.db.call(move |db| db.get_result(job_id)).await.unwrap()
    }

    /// The pipeline releases leases off the critical path; poll briefly.
    async fn wait_for_release(&self) -> Vec<String> {
        self.wait_until_released(1).await
    }

    async fn wait_until_released(&self, expected: usize) -> Vec<String> {
        for _ in 0..100 {
            let released = self.leases.released_ids();
            if released.len() >= expected {
                return released;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.leases.released_ids()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn successful_run_produces_result_and_releases_lease() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![tool_step("write_file"), done_step("Todo app")]),
    );
    let event = h.seed("alice", Plan::Free).await;
    let job_id = event.job_id;

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt_count, 1);

    let trace = h.trace(job_id).await;
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].tool.as_deref(), Some("write_file"));
    assert_eq!(trace[0].outcome, StepDisposition::Completed);
    assert_eq!(h.tools.call_count(), 1);

    let result = h.result(job_id).await.unwrap();
    assert_eq!(result.status, JobStatus::Succeeded);
    assert_eq!(result.title, "Todo app");
    assert_eq!(result.files.get("index.html").unwrap(), "<html></html>");
    assert!(result.sandbox_endpoint.is_some());
    assert!(result.failure_reason.is_none());

    let released = h.wait_for_release().await;
    assert_eq!(released.len(), 1);
}

#[tokio::test]
async fn duplicate_trigger_after_terminal_is_a_noop() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![done_step("First"), done_step("Second")]),
    );
    let event = h.seed("alice", Plan::Pro).await;
    let job_id = event.job_id;

    let first = h.pipeline.run(event.clone()).await.unwrap();
    assert_eq!(first.status, JobStatus::Succeeded);

    let second = h.pipeline.run(event).await.unwrap();
    assert_eq!(second.status, JobStatus::Succeeded);
    // No second attempt, no second lease, and the original result stands.
    assert_eq!(second.attempt_count, 1);
    assert_eq!(h.leases.acquire_count(), 1);
    assert_eq!(h.result(job_id).await.unwrap().title, "First");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_produce_exactly_one_result() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![done_step("A"), done_step("B")]),
    );
    let event = h.seed("alice", Plan::Pro).await;
    let job_id = event.job_id;

    let p1 = h.pipeline.clone();
    let p2 = h.pipeline.clone();
    let e1 = event.clone();
    let e2 = event;
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { p1.run(e1).await }),
        tokio::spawn(async move { p2.run(e2).await }),
    );

    // At least one delivery must complete the job; the other backs out
    // at whichever conditional write it loses.
    let outcomes = [r1.unwrap(), r2.unwrap()];
    assert!(outcomes.iter().any(|r| r.is_ok()));

    let job = h.db.call(move |db| db.get_job(job_id)).await.unwrap().unwrap();
    assert!(job.status.is_terminal());

    let result = h.result(job_id).await.unwrap();
    assert!(result.title == "A" || result.title == "B");

    // Only the delivery that won the pending → admitted transition paid.
    let decision = h.quota.peek("alice", Plan::Pro).await.unwrap();
    assert_eq!(decision.remaining, Plan::Pro.allotment() - 1);

    // No live leases survive, whichever delivery acquired them.
    let acquired = h.leases.acquire_count() as usize;
    let released = h.wait_until_released(acquired).await;
    assert_eq!(released.len(), acquired);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_recovery_keeps_at_most_one_live_lease() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![done_step("R1"), done_step("R2")]),
    );
    let event = h.seed("nina", Plan::Pro).await;
    let job_id = event.job_id;

    // A prior process leased the job, entered running, and died.
    let stale = SandboxLease {
        lease_id: "stale-lease".to_string(),
        job_id,
        created_at: Utc::now(),
        ttl_seconds: 1800,
        endpoint: "http://dead-sandbox.test".to_string(),
    };
    h.db.call(move |db| {
        db.advance_job(job_id, JobStatus::Pending, JobStatus::Admitted)?;
        anyhow::ensure!(db.install_lease(&stale, None)?, "stale lease not installed");
        Ok(())
    })
    .await
    .unwrap();

    let p1 = h.pipeline.clone();
    let p2 = h.pipeline.clone();
    let e1 = event.clone();
    let e2 = event;
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { p1.run(e1).await }),
        tokio::spawn(async move { p2.run(e2).await }),
    );
    let outcomes = [r1.unwrap(), r2.unwrap()];
    assert!(outcomes.iter().any(|r| r.is_ok()));

    let job = h.db.call(move |db| db.get_job(job_id)).await.unwrap().unwrap();
    assert!(job.status.is_terminal());
    assert!(h.result(job_id).await.is_some());

    // Every freshly acquired sandbox goes back: the lease-swap loser
    // hands its own back immediately, the winner releases at finalize.
    let acquired = h.leases.acquire_count() as usize;
    assert!(acquired >= 1);
    let released = h.wait_until_released(acquired).await;
    assert_eq!(released.len(), acquired);

    // Recovery never pays admission again.
    let decision = h.quota.peek("nina", Plan::Pro).await.unwrap();
    assert_eq!(decision.remaining, Plan::Pro.allotment());
}

#[tokio::test]
async fn lease_is_released_when_its_record_write_fails() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![done_step("Never reached")]),
    );
    let event = h.seed("mallory", Plan::Free).await;
    let job_id = event.job_id;

    // Occupy the lease id the provider will mint for this job, so
    // recording the acquired lease fails after acquisition.
    let other = h.seed("mallory-helper", Plan::Free).await;
    let collider = SandboxLease {
        lease_id: format!("lease-{}-1", job_id),
        job_id: other.job_id,
        created_at: Utc::now(),
        ttl_seconds: 1800,
        endpoint: "http://occupied.test".to_string(),
    };
    h.db.call(move |db| {
        db.advance_job(other.job_id, JobStatus::Pending, JobStatus::Admitted)?;
        anyhow::ensure!(db.install_lease(&collider, None)?, "collider not installed");
        Ok(())
    })
    .await
    .unwrap();

    let err = h.pipeline.run(event).await.unwrap_err();
    assert!(matches!(err, PipelineError::Database(_)));
    assert_eq!(h.leases.acquire_count(), 1);

    // The sandbox was handed back even though the run errored out.
    let released = h.wait_for_release().await;
    assert_eq!(released, vec![format!("lease-{}-1", job_id)]);

    // The job stays non-terminal and re-triggerable.
    let job = h.db.call(move |db| db.get_job(job_id)).await.unwrap().unwrap();
    assert!(!job.status.is_terminal());
    assert!(h.result(job_id).await.is_none());
}

#[tokio::test]
async fn quota_denial_fails_job_before_any_lease() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![done_step("One"), done_step("Two")]),
    );

    // Free plan: one point per window. Second job is denied.
    let first = h.seed("bob", Plan::Free).await;
    let second = h.seed("bob", Plan::Free).await;
    let denied_id = second.job_id;

    let job = h.pipeline.run(first).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);

    let job = h.pipeline.run(second).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let result = h.result(denied_id).await.unwrap();
    assert_eq!(result.failure_reason, Some(FailureReason::QuotaExhausted));
    assert!(result.sandbox_endpoint.is_none());

    // Only the admitted job ever touched the provider.
    assert_eq!(h.leases.acquire_count(), 1);
    let count = h
        .db
        .call(move |db| db.count_leases_for_job(denied_id))
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn provisioning_retries_then_fails_sandbox_unavailable() {
    let h = Harness::new(
        Harness::fast_config(),
        ScriptedLeases::with_script(vec![
            Err(LeaseError::ProvisionFailed("boot timeout".into())),
            Err(LeaseError::ProvisionFailed("boot timeout".into())),
            Err(LeaseError::ProvisionFailed("boot timeout".into())),
        ]),
        RecordingTools::ok(),
        ScriptedRunner::never_finishes(),
    );
    let event = h.seed("carol", Plan::Free).await;
    let job_id = event.job_id;

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(h.leases.acquire_count(), 3);

    let result = h.result(job_id).await.unwrap();
    assert_eq!(result.failure_reason, Some(FailureReason::SandboxUnavailable));
}

#[tokio::test]
async fn provisioning_recovers_within_retry_budget() {
    let h = Harness::new(
        Harness::fast_config(),
        ScriptedLeases::with_script(vec![
            Err(LeaseError::ProvisionFailed("boot timeout".into())),
            Ok(()),
        ]),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![done_step("Recovered")]),
    );
    let event = h.seed("carol", Plan::Free).await;

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(h.leases.acquire_count(), 2);
}

#[tokio::test]
async fn fatal_provider_error_is_not_retried() {
    let h = Harness::new(
        Harness::fast_config(),
        ScriptedLeases::with_script(vec![Err(LeaseError::ProviderQuotaExceeded)]),
        RecordingTools::ok(),
        ScriptedRunner::never_finishes(),
    );
    let event = h.seed("dave", Plan::Free).await;
    let job_id = event.job_id;

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(h.leases.acquire_count(), 1);
    assert_eq!(
        h.result(job_id).await.unwrap().failure_reason,
        Some(FailureReason::SandboxUnavailable)
    );
}

#[tokio::test]
async fn step_budget_bounds_the_trace() {
    let config = PipelineConfig {
        max_steps: 3,
        ..PipelineConfig::default()
    };
    let h = Harness::new(
        config,
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::never_finishes(),
    );
    let event = h.seed("erin", Plan::Free).await;
    let job_id = event.job_id;

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        h.result(job_id).await.unwrap().failure_reason,
        Some(FailureReason::StepBudgetExceeded)
    );
    assert_eq!(h.trace(job_id).await.len(), 3);
}

#[tokio::test]
async fn finishing_on_the_last_step_succeeds() {
    let config = PipelineConfig {
        max_steps: 3,
        ..PipelineConfig::default()
    };
    let h = Harness::new(
        config,
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![
            tool_step("write_file"),
            tool_step("run_terminal_command"),
            done_step("Just in time"),
        ]),
    );
    let event = h.seed("erin", Plan::Free).await;
    let job_id = event.job_id;

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(h.trace(job_id).await.len(), 3);
}

#[tokio::test]
async fn expired_lease_fails_before_any_tool_call() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::expired_on_arrival(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![tool_step("write_file")]),
    );
    let event = h.seed("frank", Plan::Free).await;
    let job_id = event.job_id;

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        h.result(job_id).await.unwrap().failure_reason,
        Some(FailureReason::LeaseExpired)
    );
    assert_eq!(h.tools.call_count(), 0);
    assert!(h.trace(job_id).await.is_empty());
}

#[tokio::test]
async fn unknown_tool_fails_without_touching_the_sandbox() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![Ok(StepOutcome::ToolRequest {
            tool: "format_disk".to_string(),
            args: serde_json::json!({}),
        })]),
    );
    let event = h.seed("grace", Plan::Free).await;
    let job_id = event.job_id;

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        h.result(job_id).await.unwrap().failure_reason,
        Some(FailureReason::UnknownTool)
    );
    assert_eq!(h.tools.call_count(), 0);
}

#[tokio::test]
async fn tool_failure_is_recorded_then_fails_the_job() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::failing(),
        ScriptedRunner::with_script(vec![tool_step("run_terminal_command")]),
    );
    let event = h.seed("heidi", Plan::Free).await;
    let job_id = event.job_id;

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        h.result(job_id).await.unwrap().failure_reason,
        Some(FailureReason::StepFailed)
    );

    let trace = h.trace(job_id).await;
    assert_eq!(trace.len(), 1);
    assert_eq!(trace[0].outcome, StepDisposition::Failed);
    assert!(trace[0].output.contains("exec failed"));
}

#[tokio::test]
async fn hung_tool_call_times_out_and_fails_the_job() {
    let config = PipelineConfig {
        tool_timeout_seconds: 0,
        ..PipelineConfig::default()
    };
    let h = Harness::new(
        config,
        ScriptedLeases::always_ok(),
        RecordingTools::slow(Duration::from_millis(200)),
        ScriptedRunner::with_script(vec![tool_step("read_file")]),
    );
    let event = h.seed("ivan", Plan::Free).await;
    let job_id = event.job_id;

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        h.result(job_id).await.unwrap().failure_reason,
        Some(FailureReason::StepFailed)
    );

    let trace = h.trace(job_id).await;
    assert_eq!(trace.len(), 1);
    assert_eq!(trace[0].outcome, StepDisposition::Failed);
    assert!(trace[0].output.contains("timed out"));
}

#[tokio::test]
async fn malformed_step_fails_the_job() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![Err(AgentError::Upstream(anyhow::anyhow!(
            "model endpoint returned 500"
        )))]),
    );
    let event = h.seed("judy", Plan::Free).await;
    let job_id = event.job_id;

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        h.result(job_id).await.unwrap().failure_reason,
        Some(FailureReason::StepFailed)
    );
}

#[tokio::test]
async fn stuck_running_job_is_recovered_with_a_fresh_lease() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![done_step("Recovered")]),
    );
    let event = h.seed("kim", Plan::Pro).await;
    let job_id = event.job_id;

    // Simulate a prior process that admitted the job, attached a lease,
    // started running, and died.
    let stale = SandboxLease {
        lease_id: "stale-lease".to_string(),
        job_id,
        created_at: Utc::now(),
        ttl_seconds: 1800,
        endpoint: "http://dead-sandbox.test".to_string(),
    };
    h.db.call(move |db| {
        db.advance_job(job_id, JobStatus::Pending, JobStatus::Admitted)?;
        anyhow::ensure!(db.install_lease(&stale, None)?, "stale lease not installed");
        Ok(())
    })
    .await
    .unwrap();

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);

    // The stored lease was never trusted; a fresh one was minted.
    assert_eq!(h.leases.acquire_count(), 1);
    let count = h
        .db
        .call(move |db| db.count_leases_for_job(job_id))
        .await
        .unwrap();
    assert_eq!(count, 2);

    // A non-pending job never pays admission again.
    let decision = h.quota.peek("kim", Plan::Pro).await.unwrap();
    assert_eq!(decision.remaining, 2);
}

#[tokio::test]
async fn resumed_job_does_not_replay_completed_steps() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::with_script(vec![done_step("Resumed")]),
    );
    let event = h.seed("lena", Plan::Free).await;
    let job_id = event.job_id;

    // Prior invocation got through admission and two steps before dying.
    h.db.call(move |db| {
        db.advance_job(job_id, JobStatus::Pending, JobStatus::Admitted)?;
        db.advance_job(job_id, JobStatus::Admitted, JobStatus::Running)?;
        for seq in 0..2 {
            db.append_step(
                job_id,
                &StepRecord {
                    seq,
                    tool: Some("write_file".to_string()),
                    input: "{}".to_string(),
                    output: "ok".to_string(),
                    outcome: StepDisposition::Completed,
                },
            )?;
        }
        Ok(())
    })
    .await
    .unwrap();

    let job = h.pipeline.run(event).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);

    // Two restored steps plus the finishing one; no tool re-execution.
    assert_eq!(h.trace(job_id).await.len(), 3);
    assert_eq!(h.tools.call_count(), 0);
}

#[tokio::test]
async fn trigger_for_unknown_job_is_an_error() {
    let h = Harness::new(
        PipelineConfig::default(),
        ScriptedLeases::always_ok(),
        RecordingTools::ok(),
        ScriptedRunner::never_finishes(),
    );
    let err = h
        .pipeline
        .run(TriggerEvent {
            job_id: 404,
            request_id: 1,
            principal_id: "nobody".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::JobNotFound { id: 404 }));
}
