//! Admission quota ledger.
//!
//! Each principal holds a small number of generation credits per
//! rolling 30-day window. Admission is an atomic conditional decrement
//! so two simultaneous requests can never both be admitted on the last
//! remaining point. The window is replenished lazily on the next
//! lookup after expiry, never by a background sweep.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::QuotaError;

use super::db::DbHandle;

/// Days in one quota window.
pub const WINDOW_DAYS: i64 = 30;

/// Billing plan, used only for its numeric point allotment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Pro,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }

    /// Admission points granted per window.
    pub fn allotment(&self) -> i64 {
        match self {
            Self::Free => 1,
            Self::Pro => 2,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::days(WINDOW_DAYS)
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            _ => Err(QuotaError::UnknownPlan(s.to_string())),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: i64,
}

/// Admission ledger contract. Implementations must apply the decrement
/// as a single atomic conditional update, and any storage failure must
/// surface as an error (the caller treats it as "not admitted").
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Consume `cost` points if available. Never mutates on denial.
    async fn try_consume(
        &self,
        principal_id: &str,
        plan: Plan,
        cost: i64,
    ) -> Result<QuotaDecision, QuotaError>;

    /// Report what `try_consume` would decide, without consuming.
    /// Backs the pre-flight UI endpoint.
    async fn peek(&self, principal_id: &str, plan: Plan) -> Result<QuotaDecision, QuotaError>;
}

/// SQLite-backed ledger. The conditional decrement runs inside one
/// transaction on the shared connection, so concurrent jobs for the
/// same principal serialize on the write.
pub struct SqliteQuotaLedger {
    db: DbHandle,
}

impl SqliteQuotaLedger {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl QuotaLedger for SqliteQuotaLedger {
    async fn try_consume(
        &self,
        principal_id: &str,
        plan: Plan,
        cost: i64,
    ) -> Result<QuotaDecision, QuotaError> {
        let principal = principal_id.to_string();
        self.db
            .call(move |db| db.try_consume_quota(&principal, plan, cost, Utc::now()))
            .await
            .map_err(QuotaError::Storage)
    }

    async fn peek(&self, principal_id: &str, plan: Plan) -> Result<QuotaDecision, QuotaError> {
        let principal = principal_id.to_string();
        self.db
            .call(move |db| db.peek_quota(&principal, plan, Utc::now()))
            .await
            .map_err(QuotaError::Storage)
    }
}

/// True if a stored window expiry is in the past (or unparseable, in
/// which case the record is treated as stale and reset).
pub(crate) fn window_expired(window_expires_at: &str, now: DateTime<Utc>) -> bool {
    DateTime::parse_from_rfc3339(window_expires_at)
        .map(|t| now > t.with_timezone(&Utc))
        .unwrap_or(true)
}
