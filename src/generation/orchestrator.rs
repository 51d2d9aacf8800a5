//! Generation job orchestrator.
//!
//! Drives a single job from Pending to a terminal status:
//! admission check → sandbox lease → bounded agent step loop →
//! exactly-one Result write. The whole path is safe to re-invoke for
//! the same job id: re-delivery of a trigger for a terminal job is a
//! no-op, and a job found stuck in Admitted/Running gets a fresh lease
//! rather than trusting a possibly-dead prior one. Simultaneous
//! deliveries of one trigger elect a single owner through two
//! conditional writes (the `pending → admitted` transition and the
//! lease swap on the job row); every loser backs out before paying
//! quota or keeping a sandbox.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::errors::{AgentError, PipelineError};

use super::agent::{StepOutcome, StepRunner};
use super::db::{DbHandle, ResultDraft};
use super::models::*;
use super::quota::{Plan, QuotaLedger};
use super::sandbox::{LeaseManager, SandboxLease, ToolCall, ToolExecutor, ToolKind};

/// Spacing between terminal-write retries.
const RESULT_WRITE_RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct GenerationPipeline {
    db: DbHandle,
    quota: Arc<dyn QuotaLedger>,
    leases: Arc<dyn LeaseManager>,
    tools: Arc<dyn ToolExecutor>,
    runner: Arc<dyn StepRunner>,
    config: PipelineConfig,
}

impl GenerationPipeline {
    pub fn new(
        db: DbHandle,
        quota: Arc<dyn QuotaLedger>,
        leases: Arc<dyn LeaseManager>,
        tools: Arc<dyn ToolExecutor>,
        runner: Arc<dyn StepRunner>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            quota,
            leases,
            tools,
            runner,
            config,
        }
    }

    /// Run one job to a terminal status. Sole entry point; delivered
    /// at-least-once, so every path here must tolerate re-invocation.
    pub async fn run(&self, event: TriggerEvent) -> Result<Job, PipelineError> {
        let job_id = event.job_id;
        let (job, request) = self
            .db
            .call(move |db| db.get_job_context(job_id))
            .await
            .map_err(PipelineError::Database)?
            .ok_or(PipelineError::JobNotFound { id: job_id })?;

        if job.status.is_terminal() {
            info!(job_id, status = %job.status, "job already terminal; trigger is a no-op");
            return Ok(job);
        }

        self.db
            .call(move |db| db.increment_attempt(job_id))
            .await
            .map_err(PipelineError::Database)?;

        // Admission. Only a Pending job passes the quota gate; a
        // re-invoked Admitted/Running job already paid. The conditional
        // transition is the winner election: of several simultaneous
        // deliveries, exactly one applies it, and only that one
        // consults the ledger or the lease manager.
        if job.status == JobStatus::Pending {
            let plan = Plan::from_str(&request.plan)?;
            let won = self
                .db
                .call(move |db| db.advance_job(job_id, JobStatus::Pending, JobStatus::Admitted))
                .await
                .map_err(PipelineError::Database)?;
            if !won {
                let job = self.fetch_job(job_id).await?;
                info!(job_id, status = %job.status, "job claimed by a concurrent delivery");
                return Ok(job);
            }
            // Fail closed: a ledger error counts as a denial. The
            // winner must never run unpaid, and redelivery of an
            // Admitted job skips this gate entirely.
            let admitted = match self.quota.try_consume(&request.principal_id, plan, 1).await {
                Ok(decision) => {
                    if !decision.allowed {
                        info!(
                            job_id,
                            principal = %request.principal_id,
                            remaining = decision.remaining,
                            "admission denied"
                        );
                    }
                    decision.allowed
                }
                Err(e) => {
                    warn!(job_id, error = %e, "quota ledger unavailable; denying admission");
                    false
                }
            };
            if !admitted {
                return self
                    .finalize(
                        job_id,
                        JobStatus::Failed,
                        ResultDraft::failure(FailureReason::QuotaExhausted, None),
                        None,
                    )
                    .await;
            }
        }

        // Lease. Always a fresh one, even when a prior invocation left
        // a lease id on the job: that lease may be dead.
        let lease = match self.acquire_lease(job_id).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(job_id, error = %e, "sandbox provisioning exhausted");
                return self
                    .finalize(
                        job_id,
                        JobStatus::Failed,
                        ResultDraft::failure(FailureReason::SandboxUnavailable, None),
                        None,
                    )
                    .await;
            }
        };

        // Install the lease and enter Running. The swap is conditional
        // on the lease id read above, so two recoveries of the same
        // stuck job cannot both keep a sandbox; once acquired, the
        // lease goes back on every exit from this function.
        let installed = {
            let l = lease.clone();
            let prior = job.sandbox_lease_id.clone();
            self.db.call(move |db| db.install_lease(&l, prior.as_deref())).await
        };
        match installed {
            Ok(true) => {}
            Ok(false) => {
                self.spawn_release(&lease);
                let job = self.fetch_job(job_id).await?;
                info!(job_id, status = %job.status, "job re-leased by a concurrent delivery");
                return Ok(job);
            }
            Err(e) => {
                self.spawn_release(&lease);
                return Err(PipelineError::Database(e));
            }
        }

        let (status, draft) = match self.drive_steps(&request, &lease).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The job keeps its non-terminal status so a redelivered
                // trigger can resume it, but the sandbox goes back now.
                self.spawn_release(&lease);
                return Err(e);
            }
        };
        self.finalize(job_id, status, draft, Some(&lease)).await
    }

    async fn fetch_job(&self, job_id: i64) -> Result<Job, PipelineError> {
        self.db
            .call(move |db| db.get_job(job_id))
            .await
            .map_err(PipelineError::Database)?
            .ok_or(PipelineError::JobNotFound { id: job_id })
    }

    /// Bounded provisioning retry with doubling backoff.
    async fn acquire_lease(&self, job_id: i64) -> Result<SandboxLease, crate::errors::LeaseError> {
        let mut attempt = 0u32;
        loop {
            match self
                .leases
                .acquire(job_id, self.config.lease_ttl_seconds)
                .await
            {
                Ok(lease) => return Ok(lease),
                Err(e) if e.is_retryable() && attempt + 1 < self.config.provision_attempts => {
                    let backoff = self.config.provision_backoff(attempt);
                    warn!(
                        job_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "sandbox provisioning failed; backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The agent step loop. Strictly sequential: step k+1 starts only
    /// after step k's record is appended. Returns the terminal status
    /// and the Result to persist.
    async fn drive_steps(
        &self,
        request: &Request,
        lease: &SandboxLease,
    ) -> Result<(JobStatus, ResultDraft), PipelineError> {
        let job_id = lease.job_id;
        let endpoint = Some(lease.endpoint.clone());

        // A re-invoked job resumes from its persisted trace; completed
        // steps are never replayed.
        let mut trace = self
            .db
            .call(move |db| db.get_trace(job_id))
            .await
            .map_err(PipelineError::Database)?;

        loop {
            if trace.len() as u32 >= self.config.max_steps {
                warn!(job_id, steps = trace.len(), "step budget exhausted");
                return Ok((
                    JobStatus::Failed,
                    ResultDraft::failure(FailureReason::StepBudgetExceeded, endpoint),
                ));
            }
            if lease.is_expired(Utc::now()) {
                warn!(job_id, lease_id = %lease.lease_id, "lease expired mid-run");
                return Ok((
                    JobStatus::Failed,
                    ResultDraft::failure(FailureReason::LeaseExpired, endpoint),
                ));
            }

            let outcome = match self.runner.run_step(&request.prompt, &trace).await {
                Ok(outcome) => outcome,
                Err(AgentError::UnknownTool { tool }) => {
                    warn!(job_id, tool, "step requested tool outside the permitted set");
                    return Ok((
                        JobStatus::Failed,
                        ResultDraft::failure(FailureReason::UnknownTool, endpoint),
                    ));
                }
                Err(e) => {
                    warn!(job_id, error = %e, "agent step failed");
                    return Ok((
                        JobStatus::Failed,
                        ResultDraft::failure(FailureReason::StepFailed, endpoint),
                    ));
                }
            };

            let seq = trace.len() as i64;
            match outcome {
                StepOutcome::ToolRequest { tool, args } => {
                    let Ok(kind) = ToolKind::from_str(&tool) else {
                        warn!(job_id, tool, "model requested unknown tool");
                        return Ok((
                            JobStatus::Failed,
                            ResultDraft::failure(FailureReason::UnknownTool, endpoint),
                        ));
                    };
                    // Re-check immediately before crossing the boundary:
                    // an expired lease must never see another tool call.
                    if lease.is_expired(Utc::now()) {
                        warn!(job_id, lease_id = %lease.lease_id, "lease expired before tool call");
                        return Ok((
                            JobStatus::Failed,
                            ResultDraft::failure(FailureReason::LeaseExpired, endpoint),
                        ));
                    }

                    let call = ToolCall { kind, args };
                    let input = call.args.to_string();
                    let executed =
                        tokio::time::timeout(self.config.tool_timeout(), self.tools.execute(lease, &call))
                            .await;

                    let record = match executed {
                        Err(_elapsed) => {
                            warn!(job_id, tool = %kind, "tool call timed out");
                            let record = StepRecord {
                                seq,
                                tool: Some(kind.as_str().to_string()),
                                input,
                                output: "tool call timed out".to_string(),
                                outcome: StepDisposition::Failed,
                            };
                            self.append_step(job_id, record).await?;
                            return Ok((
                                JobStatus::Failed,
                                ResultDraft::failure(FailureReason::StepFailed, endpoint),
                            ));
                        }
                        Ok(Err(e)) => {
                            warn!(job_id, tool = %kind, error = %e, "tool execution failed");
                            let record = StepRecord {
                                seq,
                                tool: Some(kind.as_str().to_string()),
                                input,
                                output: format!("tool error: {:#}", e),
                                outcome: StepDisposition::Failed,
                            };
                            self.append_step(job_id, record).await?;
                            return Ok((
                                JobStatus::Failed,
                                ResultDraft::failure(FailureReason::StepFailed, endpoint),
                            ));
                        }
                        Ok(Ok(output)) => StepRecord {
                            seq,
                            tool: Some(kind.as_str().to_string()),
                            input,
                            output,
                            outcome: StepDisposition::Completed,
                        },
                    };
                    trace.push(record.clone());
                    self.append_step(job_id, record).await?;
                }
                StepOutcome::Continue { text } => {
                    let record = StepRecord {
                        seq,
                        tool: None,
                        input: String::new(),
                        output: text,
                        outcome: StepDisposition::Completed,
                    };
                    trace.push(record.clone());
                    self.append_step(job_id, record).await?;
                }
                StepOutcome::Done(output) => {
                    let record = StepRecord {
                        seq,
                        tool: None,
                        input: String::new(),
                        output: output.summary.clone(),
                        outcome: StepDisposition::Completed,
                    };
                    self.append_step(job_id, record).await?;
                    info!(job_id, steps = seq + 1, "generation complete");
                    return Ok((
                        JobStatus::Succeeded,
                        ResultDraft {
                            title: output.title,
                            summary: output.summary,
                            files: output.files,
                            sandbox_endpoint: endpoint,
                            failure_reason: None,
                        },
                    ));
                }
            }
        }
    }

    async fn append_step(&self, job_id: i64, record: StepRecord) -> Result<(), PipelineError> {
        self.db
            .call(move |db| db.append_step(job_id, &record))
            .await
            .map_err(PipelineError::Database)
    }

    /// Apply the terminal transition and Result write, retrying the
    /// write a bounded number of times. Lease release happens after
    /// the transition and never affects the outcome.
    async fn finalize(
        &self,
        job_id: i64,
        status: JobStatus,
        draft: ResultDraft,
        lease: Option<&SandboxLease>,
    ) -> Result<Job, PipelineError> {
        let mut last_err = None;
        let mut wrote = false;
        for attempt in 0..self.config.result_write_attempts.max(1) {
            let d = draft.clone();
            match self
                .db
                .call(move |db| db.finalize_job(job_id, status, &d))
                .await
            {
                Ok(applied) => {
                    wrote = true;
                    if !applied {
                        info!(job_id, "job reached terminal state concurrently; keeping existing result");
                    }
                    break;
                }
                Err(e) => {
                    warn!(job_id, attempt, error = %e, "result write failed");
                    last_err = Some(e);
                    tokio::time::sleep(RESULT_WRITE_RETRY_DELAY).await;
                }
            }
        }

        if let Some(lease) = lease {
            self.spawn_release(lease);
        }

        if !wrote {
            // The job is still re-triggerable; the next delivery retries
            // the whole terminal write.
            return Err(PipelineError::Database(
                last_err.unwrap_or_else(|| anyhow::anyhow!("result write failed")),
            ));
        }

        let job = self.fetch_job(job_id).await?;
        info!(job_id, status = %job.status, "job finalized");
        Ok(job)
    }

    /// Best-effort, off the critical path. A failed release is logged
    /// and nothing more; it cannot change the user-visible outcome.
    fn spawn_release(&self, lease: &SandboxLease) {
        let leases = Arc::clone(&self.leases);
        let db = self.db.clone();
        let lease_id = lease.lease_id.clone();
        tokio::spawn(async move {
            leases.release(&lease_id).await;
            let id = lease_id.clone();
            if let Err(e) = db.call(move |db| db.mark_lease_released(&id)).await {
                warn!(lease_id, error = %e, "failed to record lease release");
            }
        });
    }
}
