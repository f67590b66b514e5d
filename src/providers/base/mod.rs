use crate::errors::CoworkError;
use crate::utils::cancel::CancelToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};


/// One block of model-visible content. Messages are sequences of blocks;
/// tool results travel back to the model as `ToolResult` blocks inside a
/// user-role message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One message on the provider thread. `role` is `user` or `assistant`;
/// system content travels separately on the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl ProviderMessage {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".into(),
            content,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentBlock::text(text)])
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: "assistant".into(),
            content,
        }
    }
}

/// Tool description published to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Parameters for one model call.
pub struct ProviderRequest<'a> {
    pub model: &'a str,
    pub system: Option<&'a str>,
    pub messages: &'a [ProviderMessage],
    pub tools: &'a [ToolSchema],
    pub max_tokens: u32,
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl ProviderResponse {
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_tool_uses(&self) -> bool {
        self.tool_uses().next().is_some()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn create_message(&self, req: ProviderRequest<'_>) -> Result<ProviderResponse, CoworkError>;

    fn default_model(&self) -> &str;

    /// Call with automatic retry on transient failures. 4xx-class errors
    /// surface immediately; rate limits honor the `retry_after` hint;
    /// cancellation is never retried.
    async fn create_message_with_retry(
        &self,
        req: ProviderRequest<'_>,
        retry_config: Option<RetryConfig>,
    ) -> Result<ProviderResponse, CoworkError> {
        let config = retry_config.unwrap_or_default();
        let mut last_error = None;

        for attempt in 0..=config.max_retries {
            if attempt > 0 {
                warn!(
                    "provider retry {}/{} after: {}",
                    attempt,
                    config.max_retries,
                    last_error
                        .as_ref()
                        .map(|e: &CoworkError| e.to_string())
                        .unwrap_or_default()
                );
            }
            debug!("sending provider request (attempt {})", attempt);
            let result = self
                .create_message(ProviderRequest {
                    model: req.model,
                    system: req.system,
                    messages: req.messages,
                    tools: req.tools,
                    max_tokens: req.max_tokens,
                    cancel: req.cancel,
                })
                .await;
            match result {
                Ok(response) => return Ok(response),
                Err(CoworkError::Cancelled) => return Err(CoworkError::Cancelled),
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    let rate_limit_delay = match &e {
                        CoworkError::RateLimit { retry_after } => *retry_after,
                        _ => None,
                    };
                    last_error = Some(e);
                    if attempt < config.max_retries {
                        // retry_after hint wins; otherwise exponential backoff
                        // with jitter to avoid thundering herd
                        let delay_ms = if let Some(secs) = rate_limit_delay {
                            secs * 1000
                        } else {
                            let base = (config.initial_delay_ms as f64
                                * config.backoff_multiplier.powi(attempt as i32))
                            .min(config.max_delay_ms as f64)
                                as u64;
                            base + (base as f64 * 0.25 * fastrand::f64()) as u64
                        };
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(CoworkError::Provider {
            message: "all retry attempts failed".into(),
            retryable: false,
        }))
    }
}

/// Characters providers accept in tool names.
fn is_safe_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Sanitize tool names to the provider-safe charset `[A-Za-z0-9_-]{1,64}`,
/// returning the rewritten schemas plus a stable sanitized → original map
/// for reversing names on tool_use blocks. Collisions get a numeric suffix.
pub fn sanitize_tool_names(tools: &[ToolSchema]) -> (Vec<ToolSchema>, HashMap<String, String>) {
    let mut out = Vec::with_capacity(tools.len());
    let mut reverse: HashMap<String, String> = HashMap::new();
    for tool in tools {
        let mut safe: String = tool
            .name
            .chars()
            .map(|c| if is_safe_name_char(c) { c } else { '_' })
            .take(64)
            .collect();
        if safe.is_empty() {
            safe.push('_');
        }
        let mut candidate = safe.clone();
        let mut counter = 1;
        while reverse.contains_key(&candidate) && reverse[&candidate] != tool.name {
            counter += 1;
            let suffix = format!("_{counter}");
            let keep = 64usize.saturating_sub(suffix.len());
            candidate = format!("{}{}", &safe[..safe.len().min(keep)], suffix);
        }
        reverse.insert(candidate.clone(), tool.name.clone());
        out.push(ToolSchema {
            name: candidate,
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        });
    }
    (out, reverse)
}
