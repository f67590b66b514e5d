use crate::policy::RiskLevel;
use crate::safety::guardrails::GuardrailEngine;
use crate::safety::paths::{resolve_within, sanitize_error_message};
use crate::sandbox::{ExecSpec, SandboxRunner};
use crate::tools::base::{ExecutionContext, Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;


/// Shell execution tool. Always destructive: policy demands approval, the
/// guardrail engine is consulted a second time here, and the command runs
/// under the sandbox runner.
pub struct RunShellCommandTool {
    guardrails: Arc<GuardrailEngine>,
    runner: Arc<SandboxRunner>,
    timeout: Duration,
}

impl RunShellCommandTool {
    pub fn new(guardrails: Arc<GuardrailEngine>, runner: Arc<SandboxRunner>, timeout: Duration) -> Self {
        Self {
            guardrails,
            runner,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for RunShellCommandTool {
    fn name(&self) -> &str {
        "run_shell_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command inside the workspace sandbox and return its output."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The shell command to execute"},
                "working_dir": {"type": "string", "description": "Optional working directory, relative to the workspace root"}
            },
            "required": ["command"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Destructive
    }

    fn execution_timeout(&self) -> Duration {
        // Leave headroom over the subprocess timeout so the sandbox result
        // (not the registry guard) reports the overrun
        self.timeout + Duration::from_secs(10)
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let command = params["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'command' parameter"))?;

        // The policy layer already inspected the command; re-check here so
        // a direct dispatch can never reach the runner with a blocked command
        if let Err(e) = self.guardrails.inspect(command) {
            return Ok(ToolResult::error(e.to_string()));
        }

        let workdir = match params["working_dir"].as_str() {
            Some(dir) => match resolve_within(&ctx.workspace, Path::new(dir)) {
                Ok(p) => p,
                Err(e) => return Ok(ToolResult::error(e.to_string())),
            },
            None => ctx.workspace.root.clone(),
        };

        let outcome = self
            .runner
            .run(ExecSpec {
                command,
                workdir: &workdir,
                workspace_root: &ctx.workspace.root,
                allow_network: ctx.workspace.permissions.network,
                timeout: self.timeout,
                cancel: &ctx.cancel,
            })
            .await;

        match outcome {
            Ok(outcome) if outcome.timed_out => Ok(ToolResult::error(format!(
                "command timed out after {}s",
                self.timeout.as_secs()
            ))),
            Ok(outcome) if outcome.success() => Ok(ToolResult::new(outcome.combined_output())),
            Ok(outcome) => Ok(ToolResult::error(format!(
                "command failed (exit {}): {}",
                outcome.exit_code,
                outcome.combined_output()
            ))),
            Err(e) => {
                if matches!(
                    e.downcast_ref::<crate::errors::CoworkError>(),
                    Some(crate::errors::CoworkError::Cancelled)
                ) {
                    return Err(e);
                }
                Ok(ToolResult::error(sanitize_error_message(
                    &format!("error executing command: {e}"),
                    Some(&ctx.workspace.root),
                )))
            }
        }
    }
}
