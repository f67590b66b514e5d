use crate::config::ContextPolicy;
use crate::policy::{MessageContext, RiskLevel};
use crate::store::{EventKind, TaskDb};
use crate::utils::cancel::CancelToken;
use crate::workspace::Workspace;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;


#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

impl std::fmt::Display for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.content)
    }
}

/// Clone-able handle tools use to emit events onto the owning task's
/// stream. Sends are fire-and-forget; a closed stream is ignored.
#[derive(Clone)]
pub struct EventSink {
    tx: tokio::sync::mpsc::UnboundedSender<(EventKind, Value)>,
}

impl EventSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<(EventKind, Value)>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, kind: EventKind, payload: Value) {
        let _ = self.tx.send((kind, payload));
    }
}

/// Context passed to every tool execution: the task identity, the borrowed
/// workspace, the originating channel context, the task's cancellation
/// token, and handles for event emission and artifact recording.
#[derive(Clone)]
pub struct ExecutionContext {
    pub task_id: String,
    pub workspace: Arc<Workspace>,
    pub origin: MessageContext,
    pub context_policy: Option<ContextPolicy>,
    pub cancel: CancelToken,
    pub events: Option<EventSink>,
    pub db: Option<Arc<TaskDb>>,
}

impl ExecutionContext {
    /// Minimal context for unit tests.
    pub fn for_tests(workspace: Arc<Workspace>) -> Self {
        Self {
            task_id: "test-task".to_string(),
            workspace,
            origin: MessageContext::Private,
            context_policy: None,
            cancel: CancelToken::new(),
            events: None,
            db: None,
        }
    }

    pub fn emit(&self, kind: EventKind, payload: Value) {
        if let Some(events) = &self.events {
            events.emit(kind, payload);
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value; // JSON Schema

    /// Risk classification consumed by policy layer 4.
    fn risk_level(&self) -> RiskLevel;

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult>;

    /// Per-tool execution timeout. Overrides the registry-level default.
    fn execution_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(120)
    }

    /// Whether this tool's results can be cached. Only read-only tools
    /// should return true; tools that mutate state must return false.
    fn cacheable(&self) -> bool {
        false
    }

    /// Approval kind recorded when policy demands an approval for this tool.
    fn approval_kind(&self) -> &str {
        match self.risk_level() {
            RiskLevel::Network => "network",
            RiskLevel::System => "system",
            _ => "destructive",
        }
    }
}

/// Middleware intercepting tool execution for cross-cutting concerns
/// (truncation, caching, logging).
#[async_trait]
pub trait ToolMiddleware: Send + Sync {
    /// Called before tool execution. Return `Some` to short-circuit
    /// (e.g. cache hit).
    async fn before_execute(
        &self,
        _name: &str,
        _params: &Value,
        _ctx: &ExecutionContext,
        _tool: &dyn Tool,
    ) -> Option<ToolResult> {
        None
    }

    /// Called after tool execution. Can modify the result.
    async fn after_execute(
        &self,
        _name: &str,
        _params: &Value,
        _ctx: &ExecutionContext,
        _tool: &dyn Tool,
        _result: &mut ToolResult,
    ) {
    }
}
