//! Agent step runner.
//!
//! One call to `run_step` is one bounded turn of the generation model:
//! given the original goal plus the accumulated trace, the model either
//! requests a tool invocation, emits partial text, or delivers the
//! final app. Control always returns to the orchestrator between
//! turns; the runner never chains tool calls on its own.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

use super::models::StepRecord;

/// The finished app as reported by the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalOutput {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

/// What a single agent turn produced.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The model wants a tool run in the sandbox. The tool name is
    /// unvalidated here; the orchestrator checks it against the
    /// permitted set before it can reach the sandbox boundary.
    ToolRequest {
        tool: String,
        args: serde_json::Value,
    },
    /// Partial output with no tool invocation; fed back on the next turn.
    Continue { text: String },
    /// Terminal answer.
    Done(FinalOutput),
}

/// One bounded model turn. Implementations must not execute tools
/// themselves.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(
        &self,
        goal: &str,
        trace: &[StepRecord],
    ) -> Result<StepOutcome, AgentError>;
}

/// Parse a raw model reply into a step outcome.
///
/// Priority order:
/// 1. JSON with `"type": "tool_call"` → `ToolRequest`
/// 2. JSON with `"type": "final"` → `Done`
/// 3. Anything else (other JSON, plain text) → `Continue`
///
/// A `tool_call` missing its `tool` field is malformed and rejected;
/// a `final` missing fields degrades to empty strings.
pub fn parse_reply(raw: &str) -> Result<StepOutcome, AgentError> {
    let trimmed = raw.trim();

    if trimmed.starts_with('{')
        && let Ok(parsed) = serde_json::from_str::<serde_json::Value>(trimmed)
        && let Some(msg_type) = parsed.get("type").and_then(|t| t.as_str())
    {
        return match msg_type {
            "tool_call" => {
                let tool = parsed
                    .get("tool")
                    .and_then(|t| t.as_str())
                    .ok_or_else(|| {
                        AgentError::MalformedReply("tool_call without a tool name".to_string())
                    })?
                    .to_string();
                let args = parsed.get("args").cloned().unwrap_or(serde_json::json!({}));
                Ok(StepOutcome::ToolRequest { tool, args })
            }
            "final" => {
                let output: FinalOutput = serde_json::from_value(parsed.clone())
                    .unwrap_or_else(|_| FinalOutput {
                        title: String::new(),
                        summary: trimmed.to_string(),
                        files: BTreeMap::new(),
                    });
                Ok(StepOutcome::Done(output))
            }
            _ => Ok(StepOutcome::Continue {
                text: trimmed.to_string(),
            }),
        };
    }

    Ok(StepOutcome::Continue {
        text: trimmed.to_string(),
    })
}

const SYSTEM_PROMPT: &str = "\
You are an app-generation agent working inside a disposable sandbox. \
You may use exactly these tools: read_file, write_file, run_terminal_command, list_files. \
Reply with a single JSON object per turn. \
To invoke a tool: {\"type\":\"tool_call\",\"tool\":\"<name>\",\"args\":{...}}. \
When the app is complete: {\"type\":\"final\",\"title\":...,\"summary\":...,\"files\":{path:content}}.";

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Step runner backed by an OpenAI-compatible chat-completions endpoint.
pub struct LlmStepRunner {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl LlmStepRunner {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        }
    }

    /// Replay the goal and every prior step into the message list so
    /// the model sees the full ordered history each turn.
    fn build_messages(&self, goal: &str, trace: &[StepRecord]) -> Vec<ChatMessage> {
        let mut messages = vec![
            ChatMessage {
                role: "system",
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user",
                content: goal.to_string(),
            },
        ];
        for record in trace {
            match &record.tool {
                Some(tool) => {
                    messages.push(ChatMessage {
                        role: "assistant",
                        content: format!(
                            "{{\"type\":\"tool_call\",\"tool\":{},\"args\":{}}}",
                            serde_json::Value::String(tool.clone()),
                            if record.input.is_empty() { "{}" } else { record.input.as_str() },
                        ),
                    });
                    messages.push(ChatMessage {
                        role: "user",
                        content: format!("Tool result ({}): {}", record.outcome.as_str(), record.output),
                    });
                }
                None => {
                    messages.push(ChatMessage {
                        role: "assistant",
                        content: record.output.clone(),
                    });
                }
            }
        }
        messages
    }
}

#[async_trait]
impl StepRunner for LlmStepRunner {
    async fn run_step(
        &self,
        goal: &str,
        trace: &[StepRecord],
    ) -> Result<StepOutcome, AgentError> {
        let body = ChatRequest {
            model: &self.model,
            messages: self.build_messages(goal, trace),
        };

        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .context("Model request failed")
            .map_err(AgentError::Upstream)?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::Upstream(anyhow::anyhow!(
                "Model endpoint returned {}: {}",
                status,
                detail
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("Malformed model response body")
            .map_err(AgentError::Upstream)?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| AgentError::MalformedReply("reply had no content".to_string()))?;

        parse_reply(&content)
    }
}
