use crate::errors::CoworkError;
use crate::providers::base::{
    ContentBlock, LlmProvider, ProviderRequest, ProviderResponse, StopReason, ToolSchema, Usage,
    sanitize_tool_names,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};


const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT_SECS: u64 = 180;

/// Reference provider adapter for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: String, default_model: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model,
        }
    }

    fn build_body(req: &ProviderRequest<'_>, tools: &[ToolSchema]) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role,
                    "content": m.content.iter().map(block_to_wire).collect::<Vec<_>>(),
                })
            })
            .collect();

        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "messages": messages,
        });
        if let Some(system) = req.system {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.input_schema,
                        })
                    })
                    .collect(),
            );
        }
        body
    }

    fn classify_status(status: u16, body: &str, retry_after: Option<u64>) -> CoworkError {
        match status {
            429 => CoworkError::RateLimit { retry_after },
            500..=599 => CoworkError::Provider {
                message: format!("upstream {status}: {body}"),
                retryable: true,
            },
            _ => CoworkError::Provider {
                message: format!("request failed ({status}): {body}"),
                retryable: false,
            },
        }
    }
}

fn block_to_wire(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::ToolUse { id, name, input } => {
            json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let mut wire = json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            });
            if *is_error {
                wire["is_error"] = json!(true);
            }
            wire
        }
    }
}

/// Parse a Messages API response body into a [`ProviderResponse`],
/// mapping sanitized tool names back to their originals.
pub fn parse_response(
    body: &Value,
    name_map: &std::collections::HashMap<String, String>,
) -> ProviderResponse {
    let mut content = Vec::new();
    if let Some(blocks) = body["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(text) = block["text"].as_str() {
                        content.push(ContentBlock::text(text));
                    }
                }
                Some("tool_use") => {
                    let wire_name = block["name"].as_str().unwrap_or("").to_string();
                    let name = name_map.get(&wire_name).cloned().unwrap_or(wire_name);
                    content.push(ContentBlock::ToolUse {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name,
                        input: block.get("input").cloned().unwrap_or(json!({})),
                    });
                }
                _ => {}
            }
        }
    }

    let stop_reason = match body["stop_reason"].as_str() {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    };

    let usage = Usage {
        input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
    };

    ProviderResponse {
        content,
        stop_reason,
        usage,
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn create_message(
        &self,
        req: ProviderRequest<'_>,
    ) -> Result<ProviderResponse, CoworkError> {
        if self.api_key.is_empty() {
            return Err(CoworkError::Auth("anthropic api key not configured".into()));
        }

        let (tools, name_map) = sanitize_tool_names(req.tools);
        let body = Self::build_body(&req, &tools);
        debug!(
            "anthropic request: model={}, messages={}, tools={}",
            req.model,
            req.messages.len(),
            tools.len()
        );

        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send();

        // Honor the cancellation signal: aborted calls raise the
        // distinguished Cancelled failure, dropping the in-flight request.
        let response = tokio::select! {
            result = request => result.map_err(|e| CoworkError::Provider {
                message: format!("transport error: {e}"),
                retryable: true,
            })?,
            () = req.cancel.cancelled() => return Err(CoworkError::Cancelled),
        };

        let status = response.status().as_u16();
        if status != 200 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let text = response.text().await.unwrap_or_default();
            warn!("anthropic error ({status}): {text}");
            return Err(Self::classify_status(status, &text, retry_after));
        }

        let parsed: Value = response.json().await.map_err(|e| CoworkError::Provider {
            message: format!("malformed response body: {e}"),
            retryable: true,
        })?;
        Ok(parse_response(&parsed, &name_map))
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}
