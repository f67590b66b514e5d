use crate::approval::{ApprovalGate, ApprovalOutcome};
use crate::errors::CoworkError;
use crate::policy::{Decision, PolicyContext, PolicyManager, deny_to_error};
use crate::providers::base::ToolSchema;
use crate::store::EventKind;
use crate::tools::base::{ExecutionContext, Tool, ToolMiddleware, ToolResult};
use lru::LruCache;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

const DEFAULT_CACHE_MAX_ENTRIES: usize = 128;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_MAX_RESULT_CHARS: usize = 10000;
/// Grace period past the approval TTL before the dispatch-side wait gives up.
const APPROVAL_WAIT_GRACE: Duration = Duration::from_secs(5);

/// Validate tool arguments against the tool's JSON schema.
/// Checks: (1) required fields are present, (2) field types match schema.
/// Returns None if valid, `Some(error_message)` if invalid.
pub(crate) fn validate_tool_params(tool: &dyn Tool, params: &Value) -> Option<String> {
    let schema = tool.parameters();
    let mut errors = Vec::new();

    if let Some(required) = schema["required"].as_array() {
        for field in required {
            if let Some(field_name) = field.as_str()
                && (params.get(field_name).is_none() || params[field_name].is_null())
            {
                errors.push(format!("missing required parameter '{}'", field_name));
            }
        }
    }

    if let Some(properties) = schema["properties"].as_object() {
        for (field_name, field_schema) in properties {
            if let Some(value) = params.get(field_name)
                && !value.is_null()
                && let Some(expected_type) = field_schema["type"].as_str()
            {
                let type_ok = match expected_type {
                    "string" => value.is_string(),
                    "number" | "integer" => value.is_number(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    _ => true,
                };
                if !type_ok {
                    errors.push(format!(
                        "parameter '{}' should be {} but got {}",
                        field_name,
                        expected_type,
                        value_type_name(value)
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Invalid arguments for tool '{}': {}",
            tool.name(),
            errors.join("; ")
        ))
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}

/// Wraps an externally bridged tool under a namespace prefix so bridged
/// names can never shadow built-ins.
struct NamespacedTool {
    name: String,
    inner: Arc<dyn Tool>,
}

#[async_trait::async_trait]
impl Tool for NamespacedTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        self.inner.description()
    }
    fn parameters(&self) -> Value {
        self.inner.parameters()
    }
    fn risk_level(&self) -> crate::policy::RiskLevel {
        self.inner.risk_level()
    }
    fn cacheable(&self) -> bool {
        self.inner.cacheable()
    }
    fn execution_timeout(&self) -> Duration {
        self.inner.execution_timeout()
    }
    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        self.inner.execute(params, ctx).await
    }
}

/// Tool catalog and dispatch pipeline: schema validation → policy decision
/// → approval rendezvous → guarded execution → result middleware.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    middleware: Vec<Arc<dyn ToolMiddleware>>,
    policy: Arc<PolicyManager>,
    approvals: Arc<ApprovalGate>,
}

impl ToolRegistry {
    pub fn new(policy: Arc<PolicyManager>, approvals: Arc<ApprovalGate>) -> Self {
        Self {
            tools: HashMap::new(),
            middleware: vec![
                // Order matters: truncation runs before cache in
                // after_execute, so cached results are already truncated.
                Arc::new(TruncationMiddleware::new(DEFAULT_MAX_RESULT_CHARS)),
                Arc::new(CacheMiddleware::new(
                    DEFAULT_CACHE_MAX_ENTRIES,
                    DEFAULT_CACHE_TTL_SECS,
                )),
                Arc::new(LoggingMiddleware),
            ],
            policy,
            approvals,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if name.is_empty() || name.len() > 256 || name.chars().any(char::is_control) {
            warn!("tool registry: rejecting tool with invalid name (len={})", name.len());
            return;
        }
        if self.tools.contains_key(&name) {
            warn!("tool registry: overwriting duplicate tool '{}'", name);
        }
        self.tools.insert(name, tool);
    }

    /// Register an externally bridged tool under `prefix:name`.
    pub fn register_bridged(&mut self, prefix: &str, tool: Arc<dyn Tool>) {
        let name = format!("{prefix}:{}", tool.name());
        self.register(Arc::new(NamespacedTool { name, inner: tool }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Sorted list of all registered tool names.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// The published catalog, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<_> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Execute a tool through the full pipeline. Every failure mode except
    /// cooperative cancellation is flattened into an error `ToolResult` so
    /// the model can observe it and recover.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolResult, CoworkError> {
        let Some(tool) = self.tools.get(name).cloned() else {
            warn!("model called unknown tool: {}", name);
            return Ok(ToolResult::error(format!(
                "Error: tool '{}' does not exist. Available tools: {}",
                name,
                self.tool_names().join(", ")
            )));
        };

        if let Some(validation_error) = validate_tool_params(tool.as_ref(), &params) {
            warn!("tool '{}' param validation failed: {}", name, validation_error);
            return Ok(ToolResult::error(validation_error));
        }

        // Policy gate: a denial becomes an error result carrying the
        // typed policy error's message
        let policy_ctx = PolicyContext {
            workspace: ctx.workspace.clone(),
            origin: ctx.origin,
            context_policy: ctx.context_policy.clone(),
        };
        let decision = self.policy.decide(name, tool.risk_level(), &params, &policy_ctx);
        if let Some(denied) = deny_to_error(name, &decision) {
            return Ok(ToolResult::error(denied.to_string()));
        }
        if let Decision::RequireApproval { reason } = &decision {
            match self.await_approval(&tool, name, &params, reason, ctx).await? {
                ApprovalOutcome::Approved => {}
                ApprovalOutcome::Denied => {
                    return Ok(ToolResult::error(format!(
                        "The user denied approval for '{name}'."
                    )));
                }
                ApprovalOutcome::TimedOut => {
                    return Ok(ToolResult::error(format!(
                        "The approval request for '{name}' expired without a response."
                    )));
                }
            }
        }

        // Phase 1: before_execute middleware chain
        for mw in &self.middleware {
            if let Some(result) = mw.before_execute(name, &params, ctx, tool.as_ref()).await {
                return Ok(result);
            }
        }

        // Phase 2: guarded execution
        let mut result = self.execute_with_guards(name, tool.clone(), params.clone(), ctx).await?;

        // Phase 3: after_execute middleware chain
        for mw in &self.middleware {
            mw.after_execute(name, &params, ctx, tool.as_ref(), &mut result).await;
        }

        Ok(result)
    }

    /// Create a pending approval, emit the request/resolution events, and
    /// suspend until the gate resolves it (or the TTL sweeper does).
    async fn await_approval(
        &self,
        tool: &Arc<dyn Tool>,
        name: &str,
        params: &Value,
        reason: &str,
        ctx: &ExecutionContext,
    ) -> Result<ApprovalOutcome, CoworkError> {
        let kind = approval_kind_for(name, tool.as_ref());
        let description = format!("{name}: {reason}");
        let (approval, rx) = self
            .approvals
            .request(&ctx.task_id, kind, &description, params.clone())
            .await?;
        ctx.emit(
            EventKind::ApprovalRequested,
            json!({
                "approvalId": approval.id,
                "type": kind,
                "description": description,
            }),
        );

        let wait = self.approvals.ttl() + APPROVAL_WAIT_GRACE;
        let outcome = tokio::select! {
            resolution = tokio::time::timeout(wait, rx) => match resolution {
                Ok(Ok(outcome)) => outcome,
                // Sender dropped or the grace window elapsed: treat as expiry
                _ => ApprovalOutcome::TimedOut,
            },
            () = ctx.cancel.cancelled() => return Err(CoworkError::Cancelled),
        };
        ctx.emit(
            EventKind::ApprovalResolved,
            json!({
                "approvalId": approval.id,
                "status": outcome.status().as_str(),
            }),
        );
        Ok(outcome)
    }

    /// Execute a tool in a spawned task with timeout and panic isolation.
    ///
    /// Panics are caught via `JoinError::is_panic` and timeouts enforced via
    /// `tokio::time::timeout`; both become error results that keep the
    /// executor loop alive. Cooperative cancellation aborts the call.
    async fn execute_with_guards(
        &self,
        name: &str,
        tool: Arc<dyn Tool>,
        params: Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolResult, CoworkError> {
        let tool_name = name.to_string();
        let task_ctx = ctx.clone();
        let timeout = tool.execution_timeout();
        let timeout_secs = timeout.as_secs();

        let mut handle = tokio::task::spawn(async move {
            tokio::time::timeout(timeout, tool.execute(params, &task_ctx)).await
        });

        let join_result = tokio::select! {
            joined = &mut handle => joined,
            () = ctx.cancel.cancelled() => {
                handle.abort();
                return Err(CoworkError::Cancelled);
            }
        };

        match join_result {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => {
                if matches!(e.downcast_ref::<CoworkError>(), Some(CoworkError::Cancelled)) {
                    return Err(CoworkError::Cancelled);
                }
                warn!("tool '{}' failed: {}", tool_name, e);
                let msg = crate::safety::paths::sanitize_error_message(
                    &format!("Tool execution failed: {}", e),
                    Some(&ctx.workspace.root),
                );
                Ok(ToolResult::error(msg))
            }
            Ok(Err(_)) => {
                warn!("tool '{}' timed out after {}s", tool_name, timeout_secs);
                Ok(ToolResult::error(format!(
                    "Tool '{}' timed out after {}s",
                    tool_name, timeout_secs
                )))
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    // Extract the panic message for the model so it can
                    // avoid repeating the call.
                    let panic_payload = join_err.into_panic();
                    let panic_msg = panic_payload
                        .downcast_ref::<String>()
                        .map(String::as_str)
                        .or_else(|| panic_payload.downcast_ref::<&str>().copied())
                        .unwrap_or("unknown cause");
                    error!("tool '{}' panicked: {}", tool_name, panic_msg);
                    Ok(ToolResult::error(format!(
                        "Tool '{}' crashed: {}",
                        tool_name, panic_msg
                    )))
                } else {
                    Err(CoworkError::Cancelled)
                }
            }
        }
    }
}

fn approval_kind_for(name: &str, tool: &dyn Tool) -> &'static str {
    match name {
        "delete_file" => "delete",
        "bulk_rename" => "bulk-rename",
        "run_shell_command" => "shell",
        _ => match tool.risk_level() {
            crate::policy::RiskLevel::Network => "network",
            crate::policy::RiskLevel::System => "system",
            _ => "destructive",
        },
    }
}

// --- Middleware implementations ---

/// Produce a canonical JSON string with object keys sorted recursively so
/// cache keys are stable regardless of key insertion order.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            serde_json::to_string(&sorted).unwrap_or_default()
        }
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

struct CachedResult {
    result: ToolResult,
    cached_at: Instant,
}

/// Cache middleware: checks an LRU cache before execution for tools that
/// opt in via [`Tool::cacheable`], stores results after.
pub struct CacheMiddleware {
    cache: Mutex<LruCache<String, CachedResult>>,
    ttl_secs: u64,
}

impl CacheMiddleware {
    pub fn new(max_entries: usize, ttl_secs: u64) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_entries).expect("cache max_entries must be > 0"),
            )),
            ttl_secs,
        }
    }
}

#[async_trait::async_trait]
impl ToolMiddleware for CacheMiddleware {
    async fn before_execute(
        &self,
        name: &str,
        params: &Value,
        _ctx: &ExecutionContext,
        tool: &dyn Tool,
    ) -> Option<ToolResult> {
        if !tool.cacheable() {
            return None;
        }
        let cache_key = format!("{}#{}:{}", name.len(), name, canonical_json(params));
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&cache_key) {
            if cached.cached_at.elapsed().as_secs() < self.ttl_secs {
                debug!("cache hit for tool '{}'", name);
                return Some(cached.result.clone());
            }
            cache.pop(&cache_key);
        }
        None
    }

    async fn after_execute(
        &self,
        name: &str,
        params: &Value,
        _ctx: &ExecutionContext,
        tool: &dyn Tool,
        result: &mut ToolResult,
    ) {
        if !tool.cacheable() || result.is_error {
            return;
        }
        let cache_key = format!("{}#{}:{}", name.len(), name, canonical_json(params));
        let mut cache = self.cache.lock().await;
        cache.put(
            cache_key,
            CachedResult {
                result: result.clone(),
                cached_at: Instant::now(),
            },
        );
    }
}

/// Truncation middleware: bounds tool results fed back to the model.
pub struct TruncationMiddleware {
    max_chars: usize,
}

impl TruncationMiddleware {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait::async_trait]
impl ToolMiddleware for TruncationMiddleware {
    async fn after_execute(
        &self,
        _name: &str,
        _params: &Value,
        _ctx: &ExecutionContext,
        _tool: &dyn Tool,
        result: &mut ToolResult,
    ) {
        if result.content.chars().count() > self.max_chars {
            let truncated: String = result.content.chars().take(self.max_chars).collect();
            result.content = format!("{truncated}\n[result truncated]");
        }
    }
}

/// Logging middleware: records tool execution outcomes.
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl ToolMiddleware for LoggingMiddleware {
    async fn before_execute(
        &self,
        name: &str,
        _params: &Value,
        ctx: &ExecutionContext,
        _tool: &dyn Tool,
    ) -> Option<ToolResult> {
        debug!("executing tool: {} (task={})", name, ctx.task_id);
        None
    }

    async fn after_execute(
        &self,
        name: &str,
        _params: &Value,
        _ctx: &ExecutionContext,
        _tool: &dyn Tool,
        result: &mut ToolResult,
    ) {
        if result.is_error {
            warn!("tool '{}' returned error: {}", name, result.content);
        } else {
            info!("tool '{}' completed ({} chars)", name, result.content.len());
        }
    }
}
