use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Tunable configuration for the generation pipeline.
///
/// Every operational constant of the job state machine lives here
/// rather than being hard-coded: the step budget, the lease ttl, the
/// provisioning retry policy, and the per-tool-call timeout.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum agent turns per job. Exceeding it fails the job.
    pub max_steps: u32,
    /// Hard ceiling on sandbox lifetime, in seconds.
    pub lease_ttl_seconds: u64,
    /// How many times to attempt sandbox provisioning before giving up.
    pub provision_attempts: u32,
    /// Base backoff between provisioning attempts, in milliseconds.
    /// Doubles per attempt.
    pub provision_backoff_ms: u64,
    /// Timeout for a single tool call at the sandbox boundary, in seconds.
    pub tool_timeout_seconds: u64,
    /// Retries for the terminal Result write before surfacing an error.
    pub result_write_attempts: u32,
    /// Base URL of the sandbox provider.
    pub provider_url: String,
    /// Base URL of the chat-completions endpoint.
    pub model_url: String,
    /// Model name sent with each step request.
    pub model: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_steps: 24,
            lease_ttl_seconds: 1800,
            provision_attempts: 3,
            provision_backoff_ms: 500,
            tool_timeout_seconds: 120,
            result_write_attempts: 3,
            provider_url: "http://127.0.0.1:8700".to_string(),
            model_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_seconds)
    }

    pub fn provision_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.provision_backoff_ms << attempt.min(6))
    }
}

/// Raw TOML structure for `atelier.toml`
#[derive(Debug, Deserialize)]
struct ConfigToml {
    pipeline: Option<PipelineSection>,
    provider: Option<ProviderSection>,
    model: Option<ModelSection>,
}

#[derive(Debug, Deserialize)]
struct PipelineSection {
    max_steps: Option<u32>,
    lease_ttl_seconds: Option<u64>,
    provision_attempts: Option<u32>,
    provision_backoff_ms: Option<u64>,
    tool_timeout_seconds: Option<u64>,
    result_write_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProviderSection {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelSection {
    url: Option<String>,
    name: Option<String>,
}

impl PipelineConfig {
    /// Load configuration from `atelier.toml` at the given path.
    /// Returns defaults if the file doesn't exist; absent keys keep
    /// their default values.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let toml: ConfigToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let mut config = Self::default();
        if let Some(section) = toml.pipeline {
            if let Some(v) = section.max_steps {
                config.max_steps = v;
            }
            if let Some(v) = section.lease_ttl_seconds {
                config.lease_ttl_seconds = v;
            }
            if let Some(v) = section.provision_attempts {
                config.provision_attempts = v;
            }
            if let Some(v) = section.provision_backoff_ms {
                config.provision_backoff_ms = v;
            }
            if let Some(v) = section.tool_timeout_seconds {
                config.tool_timeout_seconds = v;
            }
            if let Some(v) = section.result_write_attempts {
                config.result_write_attempts = v;
            }
        }
        if let Some(section) = toml.provider {
            if let Some(url) = section.url {
                config.provider_url = url;
            }
        }
        if let Some(section) = toml.model {
            if let Some(url) = section.url {
                config.model_url = url;
            }
            if let Some(name) = section.name {
                config.model = name;
            }
        }

        Ok(config)
    }
}
