use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use super::models::*;
use super::quota::{Plan, QuotaDecision, window_expired};
use super::sandbox::SandboxLease;

/// Async-safe handle to the generation database.
///
/// Wraps `GenerationDb` behind `Arc<Mutex>` and runs all access on
/// tokio's blocking thread pool via `spawn_blocking`, preventing
/// synchronous SQLite I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<GenerationDb>>,
}

impl DbHandle {
    pub fn new(db: GenerationDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&GenerationDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// What to persist as a job's terminal Result.
#[derive(Debug, Clone)]
pub struct ResultDraft {
    pub title: String,
    pub summary: String,
    pub files: BTreeMap<String, String>,
    pub sandbox_endpoint: Option<String>,
    pub failure_reason: Option<FailureReason>,
}

impl ResultDraft {
    pub fn failure(reason: FailureReason, endpoint: Option<String>) -> Self {
        Self {
            title: String::new(),
            summary: reason.user_message().to_string(),
            files: BTreeMap::new(),
            sandbox_endpoint: endpoint,
            failure_reason: Some(reason),
        }
    }
}

pub struct GenerationDb {
    conn: Connection,
}

impl GenerationDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    principal_id TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    plan TEXT NOT NULL DEFAULT 'free',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id INTEGER NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    sandbox_lease_id TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS quota_records (
                    principal_id TEXT PRIMARY KEY,
                    points_remaining INTEGER NOT NULL,
                    window_expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sandbox_leases (
                    lease_id TEXT PRIMARY KEY,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    ttl_seconds INTEGER NOT NULL,
                    endpoint TEXT NOT NULL,
                    released INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS step_traces (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    seq INTEGER NOT NULL,
                    tool TEXT,
                    input TEXT NOT NULL DEFAULT '',
                    output TEXT NOT NULL DEFAULT '',
                    outcome TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(job_id, seq)
                );

                CREATE TABLE IF NOT EXISTS results (
                    job_id INTEGER PRIMARY KEY REFERENCES jobs(id),
                    status TEXT NOT NULL,
                    title TEXT NOT NULL DEFAULT '',
                    summary TEXT NOT NULL DEFAULT '',
                    files TEXT NOT NULL DEFAULT '{}',
                    sandbox_endpoint TEXT,
                    failure_reason TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_request ON jobs(request_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_leases_job ON sandbox_leases(job_id);
                CREATE INDEX IF NOT EXISTS idx_traces_job ON step_traces(job_id, seq);
                ",
            )
            .context("Failed to create tables")?;

        Ok(())
    }

    // ── Request / Job CRUD ────────────────────────────────────────────

    pub fn create_request(&self, principal_id: &str, prompt: &str, plan: Plan) -> Result<Request> {
        self.conn
            .execute(
                "INSERT INTO requests (principal_id, prompt, plan) VALUES (?1, ?2, ?3)",
                params![principal_id, prompt, plan.as_str()],
            )
            .context("Failed to insert request")?;
        let id = self.conn.last_insert_rowid();
        self.get_request(id)?
            .context("Request not found after insert")
    }

    pub fn get_request(&self, id: i64) -> Result<Option<Request>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, principal_id, prompt, plan, created_at FROM requests WHERE id = ?1",
            )
            .context("Failed to prepare get_request")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok(Request {
                    id: row.get(0)?,
                    principal_id: row.get(1)?,
                    prompt: row.get(2)?,
                    plan: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query request")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read request row")?)),
            None => Ok(None),
        }
    }

    /// Create the (single) job for a request. The unique index on
    /// request_id rejects a second job for the same request.
    pub fn create_job(&self, request_id: i64) -> Result<Job> {
        self.conn
            .execute(
                "INSERT INTO jobs (request_id) VALUES (?1)",
                params![request_id],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, request_id, status, attempt_count, sandbox_lease_id, created_at, updated_at
                 FROM jobs WHERE id = ?1",
            )
            .context("Failed to prepare get_job")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok(JobRow {
                    id: row.get(0)?,
                    request_id: row.get(1)?,
                    status: row.get(2)?,
                    attempt_count: row.get(3)?,
                    sandbox_lease_id: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })
            .context("Failed to query job")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read job row")?;
                Ok(Some(r.into_job()?))
            }
            None => Ok(None),
        }
    }

    /// Fetch a job together with its originating request.
    pub fn get_job_context(&self, job_id: i64) -> Result<Option<(Job, Request)>> {
        let Some(job) = self.get_job(job_id)? else {
            return Ok(None);
        };
        let request = self
            .get_request(job.request_id)?
            .context("Job references a missing request")?;
        Ok(Some((job, request)))
    }

    /// Conditionally advance a job's status. Returns false when the job
    /// was not in `from` (someone else advanced it, or it is terminal).
    pub fn advance_job(&self, id: i64, from: JobStatus, to: JobStatus) -> Result<bool> {
        debug_assert!(to.rank() >= from.rank());
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status = ?3",
                params![to.as_str(), id, from.as_str()],
            )
            .context("Failed to advance job status")?;
        Ok(changed == 1)
    }

    pub fn increment_attempt(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET attempt_count = attempt_count + 1, updated_at = datetime('now')
                 WHERE id = ?1",
                params![id],
            )
            .context("Failed to increment attempt count")?;
        Ok(())
    }

    // ── Sandbox leases ────────────────────────────────────────────────

    /// Record a freshly acquired lease, point the job at it, and enter
    /// Running, all in one transaction. The attach is a conditional
    /// swap on the lease the job held when the caller read it: when two
    /// deliveries race to re-lease the same job, exactly one install
    /// succeeds and the other gets false (and must hand its sandbox
    /// back). A job that is already terminal also refuses the install.
    pub fn install_lease(&self, lease: &SandboxLease, prior: Option<&str>) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin lease transaction")?;

        let changed = tx
            .execute(
                "UPDATE jobs SET sandbox_lease_id = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND sandbox_lease_id IS ?3
                   AND status IN ('admitted', 'running')",
                params![lease.lease_id, lease.job_id, prior],
            )
            .context("Failed to attach lease to job")?;
        if changed == 0 {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO sandbox_leases (lease_id, job_id, created_at, ttl_seconds, endpoint)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                lease.lease_id,
                lease.job_id,
                lease.created_at.to_rfc3339(),
                lease.ttl_seconds,
                lease.endpoint,
            ],
        )
        .context("Failed to insert sandbox lease")?;

        tx.execute(
            "UPDATE jobs SET status = 'running', updated_at = datetime('now')
             WHERE id = ?1 AND status = 'admitted'",
            params![lease.job_id],
        )
        .context("Failed to enter running status")?;

        tx.commit().context("Failed to commit lease transaction")?;
        Ok(true)
    }

    /// Safe to call for already-released or unknown leases.
    pub fn mark_lease_released(&self, lease_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sandbox_leases SET released = 1 WHERE lease_id = ?1",
                params![lease_id],
            )
            .context("Failed to mark lease released")?;
        Ok(())
    }

    pub fn count_leases_for_job(&self, job_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM sandbox_leases WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .context("Failed to count leases")
    }

    // ── Step trace ────────────────────────────────────────────────────

    /// Append one step record. `seq` must be the next sequence number;
    /// the UNIQUE(job_id, seq) constraint rejects replays.
    pub fn append_step(&self, job_id: i64, record: &StepRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO step_traces (job_id, seq, tool, input, output, outcome)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    job_id,
                    record.seq,
                    record.tool,
                    record.input,
                    record.output,
                    record.outcome.as_str(),
                ],
            )
            .context("Failed to append step record")?;
        Ok(())
    }

    pub fn get_trace(&self, job_id: i64) -> Result<Vec<StepRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT seq, tool, input, output, outcome
                 FROM step_traces WHERE job_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare get_trace")?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query step trace")?;
        let mut trace = Vec::new();
        for row in rows {
            let (seq, tool, input, output, outcome) = row.context("Failed to read step row")?;
            trace.push(StepRecord {
                seq,
                tool,
                input,
                output,
                outcome: StepDisposition::from_str(&outcome)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Corrupt step outcome")?,
            });
        }
        Ok(trace)
    }

    // ── Terminal transition + Result (exactly once) ───────────────────

    /// Move a job into a terminal status and persist its Result, in one
    /// transaction. Returns false without writing anything when the job
    /// is already terminal — this is what makes duplicate trigger
    /// delivery and crash re-invocation safe.
    pub fn finalize_job(&self, job_id: i64, status: JobStatus, draft: &ResultDraft) -> Result<bool> {
        anyhow::ensure!(status.is_terminal(), "finalize_job requires a terminal status");

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin finalize transaction")?;

        let changed = tx
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status IN ('pending', 'admitted', 'running')",
                params![status.as_str(), job_id],
            )
            .context("Failed to apply terminal status")?;

        if changed == 0 {
            // Already terminal; the existing Result stands.
            return Ok(false);
        }

        let files_json =
            serde_json::to_string(&draft.files).context("Failed to serialize result files")?;
        tx.execute(
            "INSERT INTO results (job_id, status, title, summary, files, sandbox_endpoint, failure_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job_id,
                status.as_str(),
                draft.title,
                draft.summary,
                files_json,
                draft.sandbox_endpoint,
                draft.failure_reason.map(|r| r.as_str()),
            ],
        )
        .context("Failed to insert result")?;

        tx.commit().context("Failed to commit finalize transaction")?;
        Ok(true)
    }

    pub fn get_result(&self, job_id: i64) -> Result<Option<GenerationResult>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT job_id, status, title, summary, files, sandbox_endpoint, failure_reason, created_at
                 FROM results WHERE job_id = ?1",
            )
            .context("Failed to prepare get_result")?;
        let mut rows = stmt
            .query_map(params![job_id], |row| {
                Ok(ResultRow {
                    job_id: row.get(0)?,
                    status: row.get(1)?,
                    title: row.get(2)?,
                    summary: row.get(3)?,
                    files: row.get(4)?,
                    sandbox_endpoint: row.get(5)?,
                    failure_reason: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .context("Failed to query result")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read result row")?;
                Ok(Some(r.into_result()?))
            }
            None => Ok(None),
        }
    }

    // ── Quota ledger ──────────────────────────────────────────────────

    /// Atomic conditional decrement with lazy window reset. The whole
    /// operation is one transaction: a concurrent consumer for the same
    /// principal either sees the decremented row or gets denied.
    pub fn try_consume_quota(
        &self,
        principal_id: &str,
        plan: Plan,
        cost: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin quota transaction")?;

        let existing: Option<String> = {
            let mut stmt = tx
                .prepare("SELECT window_expires_at FROM quota_records WHERE principal_id = ?1")
                .context("Failed to prepare quota lookup")?;
            let mut rows = stmt
                .query_map(params![principal_id], |row| row.get(0))
                .context("Failed to query quota record")?;
            match rows.next() {
                Some(row) => Some(row.context("Failed to read quota row")?),
                None => None,
            }
        };

        let needs_reset = match existing.as_deref() {
            Some(expires) => window_expired(expires, now),
            None => true,
        };
        if needs_reset {
            tx.execute(
                "INSERT INTO quota_records (principal_id, points_remaining, window_expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(principal_id) DO UPDATE SET
                     points_remaining = excluded.points_remaining,
                     window_expires_at = excluded.window_expires_at",
                params![
                    principal_id,
                    plan.allotment(),
                    (now + plan.window()).to_rfc3339(),
                ],
            )
            .context("Failed to reset quota window")?;
        }

        let changed = tx
            .execute(
                "UPDATE quota_records SET points_remaining = points_remaining - ?1
                 WHERE principal_id = ?2 AND points_remaining >= ?1",
                params![cost, principal_id],
            )
            .context("Failed to apply quota decrement")?;

        let remaining: i64 = tx
            .query_row(
                "SELECT points_remaining FROM quota_records WHERE principal_id = ?1",
                params![principal_id],
                |row| row.get(0),
            )
            .context("Failed to read remaining quota")?;

        tx.commit().context("Failed to commit quota transaction")?;
        Ok(QuotaDecision {
            allowed: changed == 1,
            remaining,
        })
    }

    /// Read-only view of what `try_consume_quota` would decide for a
    /// cost of 1. Computes the lazy reset virtually, writing nothing.
    pub fn peek_quota(
        &self,
        principal_id: &str,
        plan: Plan,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT points_remaining, window_expires_at
                 FROM quota_records WHERE principal_id = ?1",
            )
            .context("Failed to prepare quota peek")?;
        let mut rows = stmt
            .query_map(params![principal_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query quota record")?;

        let remaining = match rows.next() {
            Some(row) => {
                let (points, expires) = row.context("Failed to read quota row")?;
                if window_expired(&expires, now) {
                    plan.allotment()
                } else {
                    points
                }
            }
            None => plan.allotment(),
        };

        Ok(QuotaDecision {
            allowed: remaining >= 1,
            remaining,
        })
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

struct JobRow {
    id: i64,
    request_id: i64,
    status: String,
    attempt_count: i64,
    sandbox_lease_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            request_id: self.request_id,
            status: JobStatus::from_str(&self.status)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Corrupt job status")?,
            attempt_count: self.attempt_count,
            sandbox_lease_id: self.sandbox_lease_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct ResultRow {
    job_id: i64,
    status: String,
    title: String,
    summary: String,
    files: String,
    sandbox_endpoint: Option<String>,
    failure_reason: Option<String>,
    created_at: String,
}

impl ResultRow {
    fn into_result(self) -> Result<GenerationResult> {
        Ok(GenerationResult {
            job_id: self.job_id,
            status: JobStatus::from_str(&self.status)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Corrupt result status")?,
            title: self.title,
            summary: self.summary,
            files: serde_json::from_str(&self.files).context("Corrupt result files")?,
            sandbox_endpoint: self.sandbox_endpoint,
            failure_reason: self
                .failure_reason
                .as_deref()
                .map(|s| {
                    FailureReason::from_str(s)
                        .map_err(|e| anyhow::anyhow!(e))
                        .context("Corrupt failure reason")
                })
                .transpose()?,
            created_at: self.created_at,
        })
    }
}
