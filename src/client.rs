/// Model provider — streaming chat over an OpenAI-compatible endpoint.
///
/// The agent loop talks to `ModelProvider` only; it does not care which
/// vendor sits behind the endpoint. Transient failures (timeouts, 429,
/// 5xx) retry with exponential backoff and jitter; fatal failures (bad
/// auth, unknown model) surface immediately.
use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::messages::{serialize_for_provider, ContentBlock, Message};
use crate::tools::ToolDef;

// ── Responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

#[derive(Debug)]
pub struct ModelResponse {
    /// Text and tool_use blocks in model output order.
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl ModelResponse {
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Callback receiving each streamed text fragment before the full response
/// is assembled.
pub type TextSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn chat(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDef],
        on_text: TextSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ProviderError>;

    /// One-shot completion used for compaction summaries. No tools, no
    /// streaming consumer.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ProviderError> {
        let messages = vec![Message::user(prompt)];
        let sink = |_: &str| {};
        let cancel = CancellationToken::new();
        let response = self.chat(system, &messages, &[], &sink, &cancel).await?;
        Ok(response.text())
    }
}

// ── Retry policy ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Fraction of the delay added/subtracted at random (0.2 = ±20%).
    pub jitter: f64,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            jitter: 0.2,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter for the given 0-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16)) as f64;
        let jitter_span = base * self.jitter;
        // Cheap jitter source — the clock's subsecond noise.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0) as f64;
        let unit = (nanos / 1_000_000_000.0) * 2.0 - 1.0; // [-1, 1)
        let delayed = (base + unit * jitter_span).max(0.0);
        Duration::from_millis(delayed as u64)
    }
}

// ── SSE delta types for accumulation ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageStats>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<Delta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageStats {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct Client {
    http: reqwest::Client,
    pub endpoint: String,
    model: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl Client {
    pub fn new(endpoint: String, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            model,
            api_key: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn chat_once(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDef],
        on_text: TextSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "stream": true,
            "stream_options": {"include_usage": true},
            "messages": serialize_for_provider(system, messages),
        });

        if !tools.is_empty() {
            body["tools"] = serde_json::json!(
                tools.iter().map(|t| serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })).collect::<Vec<_>>()
            );
            body["tool_choice"] = serde_json::json!("auto");
        }

        let mut req = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .timeout(self.retry.request_timeout)
            .json(&body);

        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req.send().await.map_err(classify_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = format!("API error {status}: {text}");
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(ProviderError::Transient(detail))
            } else {
                Err(ProviderError::Fatal(detail))
            };
        }

        let mut stream = resp.bytes_stream();

        let mut text_buf = String::new();
        let mut pending: Vec<PendingToolCall> = Vec::new();
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;
        let mut finish_reason: Option<String> = None;
        let mut leftover = String::new();

        loop {
            let chunk = tokio::select! {
                c = stream.next() => match c {
                    Some(c) => c,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    return Err(ProviderError::Fatal("cancelled".to_string()));
                }
            };
            let bytes = chunk.map_err(|e| ProviderError::Transient(format!("stream error: {e}")))?;
            let raw = std::str::from_utf8(&bytes).unwrap_or("");

            // SSE may split across chunks; prepend any leftover from last iteration
            let combined = format!("{leftover}{raw}");
            leftover.clear();

            for line in combined.lines() {
                let line = line.trim();
                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(json_str) = line.strip_prefix("data: ") else { continue };

                // If JSON is incomplete (split mid-chunk), save for next iteration
                let chunk_val: StreamChunk = match serde_json::from_str(json_str) {
                    Ok(v) => v,
                    Err(_) => {
                        leftover = line.to_string();
                        continue;
                    }
                };

                if let Some(usage) = chunk_val.usage {
                    input_tokens = usage.prompt_tokens.unwrap_or(0);
                    output_tokens = usage.completion_tokens.unwrap_or(0);
                }

                for choice in chunk_val.choices.unwrap_or_default() {
                    if let Some(reason) = choice.finish_reason {
                        finish_reason = Some(reason);
                    }
                    let Some(delta) = choice.delta else { continue };

                    if let Some(text) = delta.content {
                        if !text.is_empty() {
                            on_text(&text);
                            text_buf.push_str(&text);
                        }
                    }

                    for tc_delta in delta.tool_calls.unwrap_or_default() {
                        let idx = tc_delta.index;
                        while pending.len() <= idx {
                            pending.push(PendingToolCall::default());
                        }
                        let entry = &mut pending[idx];
                        if let Some(id) = tc_delta.id {
                            entry.id = id;
                        }
                        if let Some(func) = tc_delta.function {
                            if let Some(name) = func.name {
                                entry.name.push_str(&name);
                            }
                            if let Some(args) = func.arguments {
                                entry.arguments.push_str(&args);
                            }
                        }
                    }
                }
            }
        }

        let mut blocks: Vec<ContentBlock> = Vec::new();
        if !text_buf.is_empty() {
            blocks.push(ContentBlock::Text { text: text_buf });
        }
        for p in pending.into_iter().filter(|p| !p.name.is_empty()) {
            let input = serde_json::from_str::<Value>(&p.arguments)
                .unwrap_or(Value::String(p.arguments));
            blocks.push(ContentBlock::ToolUse { id: p.id, name: p.name, input });
        }

        let has_tools = blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        let stop_reason = if has_tools {
            StopReason::ToolUse
        } else if finish_reason.as_deref() == Some("length") {
            StopReason::MaxTokens
        } else {
            StopReason::EndTurn
        };

        Ok(ModelResponse { blocks, stop_reason, input_tokens, output_tokens })
    }
}

fn classify_reqwest(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() {
        ProviderError::Transient(e.to_string())
    } else {
        ProviderError::Fatal(e.to_string())
    }
}

#[async_trait]
impl ModelProvider for Client {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDef],
        on_text: TextSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        let mut attempt = 0u32;
        loop {
            match self.chat_once(system, messages, tools, on_text, cancel).await {
                Ok(r) => return Ok(r),
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(attempt, ?delay, error = %e, "provider call failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(ProviderError::Fatal("cancelled".to_string()));
                        }
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
