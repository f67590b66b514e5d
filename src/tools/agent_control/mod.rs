use crate::policy::RiskLevel;
use crate::store::{TaskEvent, TaskStatus};
use crate::tools::base::{ExecutionContext, Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;


const DEFAULT_WAIT_SECS: u64 = 120;
const MAX_WAIT_SECS: u64 = 600;
const MAX_CAPTURED_EVENTS: usize = 50;

/// The slice of the daemon visible to sub-agent control tools. The
/// descendant check is the containment invariant: a parent may only address
/// tasks whose parent chain terminates at itself.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// True when `candidate`'s `parent_task_id` chain reaches `ancestor`.
    fn is_descendant(&self, ancestor: &str, candidate: &str) -> bool;

    async fn send_message(&self, task_id: &str, text: &str) -> Result<()>;

    async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<TaskStatus>;

    fn events_for(&self, task_id: &str) -> Result<Vec<TaskEvent>>;

    /// Create a new child task under `parent_id`, returning its id.
    async fn spawn_child(&self, parent_id: &str, prompt: String) -> Result<String>;
}

fn forbidden(task_id: &str) -> ToolResult {
    ToolResult::error(format!(
        "FORBIDDEN: task '{task_id}' is not a descendant of this task"
    ))
}

pub struct SendAgentMessageTool {
    directory: Arc<dyn AgentDirectory>,
}

impl SendAgentMessageTool {
    pub fn new(directory: Arc<dyn AgentDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Tool for SendAgentMessageTool {
    fn name(&self) -> &str {
        "send_agent_message"
    }

    fn description(&self) -> &str {
        "Send a message to one of your running sub-agent tasks."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {"type": "string", "description": "Target sub-agent task id"},
                "message": {"type": "string", "description": "Message text to inject"}
            },
            "required": ["task_id", "message"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Write
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let task_id = params["task_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'task_id' parameter"))?;
        let message = params["message"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'message' parameter"))?;
        if !self.directory.is_descendant(&ctx.task_id, task_id) {
            return Ok(forbidden(task_id));
        }
        self.directory.send_message(task_id, message).await?;
        Ok(ToolResult::new(format!("Message delivered to {task_id}")))
    }
}

pub struct WaitForAgentTool {
    directory: Arc<dyn AgentDirectory>,
}

impl WaitForAgentTool {
    pub fn new(directory: Arc<dyn AgentDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Tool for WaitForAgentTool {
    fn name(&self) -> &str {
        "wait_for_agent"
    }

    fn description(&self) -> &str {
        "Block until one of your sub-agent tasks reaches a terminal state."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {"type": "string", "description": "Sub-agent task id to wait for"},
                "timeout_secs": {"type": "integer", "description": "Max seconds to wait (default 120)"}
            },
            "required": ["task_id"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Read
    }

    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(MAX_WAIT_SECS + 10)
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let task_id = params["task_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'task_id' parameter"))?;
        let timeout_secs = params["timeout_secs"]
            .as_u64()
            .unwrap_or(DEFAULT_WAIT_SECS)
            .min(MAX_WAIT_SECS);
        if !self.directory.is_descendant(&ctx.task_id, task_id) {
            return Ok(forbidden(task_id));
        }
        match self
            .directory
            .wait_for(task_id, Duration::from_secs(timeout_secs))
            .await
        {
            Ok(status) => Ok(ToolResult::new(format!(
                "Task {task_id} finished with status: {}",
                status.as_str()
            ))),
            Err(e) => Ok(ToolResult::error(format!(
                "wait for {task_id} failed: {e}"
            ))),
        }
    }
}

pub struct SpawnAgentTool {
    directory: Arc<dyn AgentDirectory>,
}

impl SpawnAgentTool {
    pub fn new(directory: Arc<dyn AgentDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent_task"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent task that works on a goal in the background. Returns its task id."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "Goal for the sub-agent"}
            },
            "required": ["prompt"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Write
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let prompt = params["prompt"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'prompt' parameter"))?;
        match self
            .directory
            .spawn_child(&ctx.task_id, prompt.to_string())
            .await
        {
            Ok(child_id) => Ok(ToolResult::new(format!(
                "Sub-agent started with task id {child_id}"
            ))),
            Err(e) => Ok(ToolResult::error(format!("could not spawn sub-agent: {e}"))),
        }
    }
}

pub struct CaptureAgentEventsTool {
    directory: Arc<dyn AgentDirectory>,
}

impl CaptureAgentEventsTool {
    pub fn new(directory: Arc<dyn AgentDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Tool for CaptureAgentEventsTool {
    fn name(&self) -> &str {
        "capture_agent_events"
    }

    fn description(&self) -> &str {
        "Fetch the recent event stream of one of your sub-agent tasks."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {"type": "string", "description": "Sub-agent task id"}
            },
            "required": ["task_id"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Read
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let task_id = params["task_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'task_id' parameter"))?;
        if !self.directory.is_descendant(&ctx.task_id, task_id) {
            return Ok(forbidden(task_id));
        }
        let events = self.directory.events_for(task_id)?;
        if events.is_empty() {
            return Ok(ToolResult::new("(no events yet)"));
        }
        let lines: Vec<String> = events
            .iter()
            .rev()
            .take(MAX_CAPTURED_EVENTS)
            .rev()
            .map(|e| format!("#{} {} {}", e.seq, e.kind.as_str(), e.payload))
            .collect();
        Ok(ToolResult::new(lines.join("\n")))
    }
}
