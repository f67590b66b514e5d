//! Scripted provider for tests. Not part of the public API.

use crate::errors::CoworkError;
use crate::providers::base::{
    ContentBlock, LlmProvider, ProviderMessage, ProviderRequest, ProviderResponse, StopReason,
    Usage,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One step in a scripted conversation.
pub enum Script {
    Text(String),
    TextWithStop(String, StopReason),
    ToolUse(Vec<(String, String, Value)>),
    Error(CoworkError),
    /// Sleep this long before answering (for timeout tests).
    Stall(std::time::Duration),
}

#[derive(Clone)]
pub struct RecordedCall {
    pub messages: Vec<ProviderMessage>,
    pub tool_count: usize,
}

/// Provider that replays a fixed script and records every request.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Script>>,
    pub calls: Mutex<Vec<RecordedCall>>,
    pub usage_per_call: Usage,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script: Mutex::new(VecDeque::from(script)),
            calls: Mutex::new(Vec::new()),
            usage_per_call: Usage {
                input_tokens: 100,
                output_tokens: 20,
            },
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage_per_call = usage;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn create_message(
        &self,
        req: ProviderRequest<'_>,
    ) -> Result<ProviderResponse, CoworkError> {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: req.messages.to_vec(),
            tool_count: req.tools.len(),
        });
        let step = self.script.lock().unwrap().pop_front();
        let step = step.unwrap_or_else(|| Script::Text("Done.".to_string()));
        match step {
            Script::Text(text) => Ok(ProviderResponse {
                content: vec![ContentBlock::text(text)],
                stop_reason: StopReason::EndTurn,
                usage: self.usage_per_call,
            }),
            Script::TextWithStop(text, stop_reason) => Ok(ProviderResponse {
                content: vec![ContentBlock::text(text)],
                stop_reason,
                usage: self.usage_per_call,
            }),
            Script::ToolUse(calls) => Ok(ProviderResponse {
                content: calls
                    .into_iter()
                    .map(|(id, name, input)| ContentBlock::ToolUse { id, name, input })
                    .collect(),
                stop_reason: StopReason::ToolUse,
                usage: self.usage_per_call,
            }),
            Script::Error(e) => Err(e),
            Script::Stall(duration) => {
                tokio::select! {
                    () = tokio::time::sleep(duration) => {}
                    () = req.cancel.cancelled() => return Err(CoworkError::Cancelled),
                }
                Ok(ProviderResponse {
                    content: vec![ContentBlock::text("late answer")],
                    stop_reason: StopReason::EndTurn,
                    usage: self.usage_per_call,
                })
            }
        }
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }
}
