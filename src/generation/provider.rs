//! HTTP sandbox provider client.
//!
//! Implements `LeaseManager` and `ToolExecutor` against a remote
//! sandbox service. Provisioning failures are classified into the
//! lease error taxonomy; release is fire-and-forget.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::LeaseError;

use super::sandbox::{LeaseManager, SandboxLease, ToolCall, ToolExecutor};

#[derive(Deserialize)]
struct CreateSandboxResponse {
    id: Option<String>,
    endpoint: String,
}

#[derive(Deserialize)]
struct ExecResponse {
    output: String,
}

pub struct HttpSandboxProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpSandboxProvider {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl LeaseManager for HttpSandboxProvider {
    async fn acquire(&self, job_id: i64, ttl_seconds: u64) -> Result<SandboxLease, LeaseError> {
        let req = self
            .http
            .post(format!("{}/v1/sandboxes", self.base_url))
            .json(&serde_json::json!({ "ttl_seconds": ttl_seconds }));

        let response = self
            .authed(req)
            .send()
            .await
            .map_err(|e| LeaseError::ProvisionFailed(format!("provider unreachable: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LeaseError::ProviderQuotaExceeded);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LeaseError::ProvisionFailed(format!(
                "provider returned {}: {}",
                status, detail
            )));
        }

        let body: CreateSandboxResponse = response
            .json()
            .await
            .map_err(|e| LeaseError::ProvisionFailed(format!("malformed provider reply: {}", e)))?;

        Ok(SandboxLease {
            lease_id: body.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            job_id,
            created_at: Utc::now(),
            ttl_seconds: ttl_seconds as i64,
            endpoint: body.endpoint,
        })
    }

    async fn release(&self, lease_id: &str) {
        let req = self
            .http
            .delete(format!("{}/v1/sandboxes/{}", self.base_url, lease_id));
        match self.authed(req).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    lease_id,
                    status = %response.status(),
                    "sandbox release rejected by provider"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(lease_id, error = %e, "sandbox release failed");
            }
        }
    }
}

#[async_trait]
impl ToolExecutor for HttpSandboxProvider {
    async fn execute(&self, lease: &SandboxLease, call: &ToolCall) -> Result<String> {
        let req = self
            .http
            .post(format!(
                "{}/v1/sandboxes/{}/exec",
                self.base_url, lease.lease_id
            ))
            .json(&serde_json::json!({
                "tool": call.kind.as_str(),
                "args": call.args,
            }));

        let response = self
            .authed(req)
            .send()
            .await
            .context("Tool execution request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("Tool execution returned {}: {}", status, detail);
        }

        let body: ExecResponse = response
            .json()
            .await
            .context("Malformed tool execution reply")?;
        Ok(body.output)
    }
}
