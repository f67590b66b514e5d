use crate::config::ContextPolicy;
use crate::daemon::EventRecorder;
use crate::errors::CoworkError;
use crate::policy::MessageContext;
use crate::providers::base::{
    ContentBlock, LlmProvider, ProviderMessage, ProviderRequest, StopReason,
};
use crate::store::{EventKind, Task, TaskDb, TaskStatus};
use crate::tools::base::{EventSink, ExecutionContext};
use crate::tools::registry::ToolRegistry;
use crate::utils::cancel::CancelToken;
use crate::workspace::Workspace;
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};


/// Messages kept from the tail of the thread for the reduced-context
/// finalize call after an LLM timeout.
const FINALIZE_TAIL_MESSAGES: usize = 4;
const FINALIZE_PROMPT: &str =
    "Provide a brief summary of what you accomplished for the user, based on the work so far.";
const CONTINUE_PROMPT: &str = "Continue from where you stopped.";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_iterations: usize,
    pub max_tokens: u32,
    pub llm_timeout: Duration,
    pub auto_switch_workspace: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            max_tokens: 8192,
            llm_timeout: Duration::from_secs(120),
            auto_switch_workspace: true,
        }
    }
}

/// Input injected into a running task from outside the loop.
#[derive(Debug)]
pub enum UserInjection {
    /// A user message appended to the thread at the next loop boundary.
    Message(String),
    /// Acknowledgment of a preflight suspension.
    WorkspaceAck,
}

/// Everything a task run needs, handed over by the daemon.
pub struct ExecutorSeed {
    pub task: Task,
    pub workspace: Arc<Workspace>,
    pub provider: Arc<dyn LlmProvider>,
    pub registry: Arc<ToolRegistry>,
    pub recorder: Arc<EventRecorder>,
    pub db: Arc<TaskDb>,
    pub config: ExecutorConfig,
    pub cancel: CancelToken,
    pub inbox: mpsc::UnboundedReceiver<UserInjection>,
    pub origin: MessageContext,
    pub context_policy: Option<ContextPolicy>,
    pub system_prompt: String,
    pub model: String,
}

enum Terminal {
    Completed { message: Option<String> },
    Failed { reason: String, message: String },
    Cancelled,
}

/// Drives one task through the plan-execute-observe loop to a terminal
/// state. Owns the task exclusively; borrows the workspace.
pub struct TaskExecutor {
    task: Task,
    workspace: Arc<Workspace>,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    recorder: Arc<EventRecorder>,
    db: Arc<TaskDb>,
    config: ExecutorConfig,
    cancel: CancelToken,
    inbox: mpsc::UnboundedReceiver<UserInjection>,
    origin: MessageContext,
    context_policy: Option<ContextPolicy>,
    system_prompt: String,
    model: String,
    /// Messages received while suspended, replayed at the next loop boundary.
    pending_messages: Vec<String>,
    tokens_spent: u64,
}

impl TaskExecutor {
    pub fn new(seed: ExecutorSeed) -> Self {
        Self {
            task: seed.task,
            workspace: seed.workspace,
            provider: seed.provider,
            registry: seed.registry,
            recorder: seed.recorder,
            db: seed.db,
            config: seed.config,
            cancel: seed.cancel,
            inbox: seed.inbox,
            origin: seed.origin,
            context_policy: seed.context_policy,
            system_prompt: seed.system_prompt,
            model: seed.model,
            pending_messages: Vec::new(),
            tokens_spent: 0,
        }
    }

    /// Run the task to completion. Guarantees exactly one terminal event on
    /// the task's stream regardless of how the loop ends.
    pub async fn run(mut self) -> Task {
        let task_id = self.task.id.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);

        // Single-writer event pump: the executor, the registry, and the
        // tools all emit through the same sink, so stream order is send
        // order.
        let recorder = self.recorder.clone();
        let pump_task_id = task_id.clone();
        let pump = tokio::spawn(async move {
            while let Some((kind, payload)) = rx.recv().await {
                if let Err(e) = recorder.record(&pump_task_id, kind, payload) {
                    warn!("event record failed for {pump_task_id}: {e}");
                }
            }
        });

        let terminal = match self.drive(&sink).await {
            Ok(terminal) => terminal,
            Err(CoworkError::Cancelled) => Terminal::Cancelled,
            Err(e) => Terminal::Failed {
                reason: e.reason_code().to_string(),
                message: e.to_string(),
            },
        };

        match &terminal {
            Terminal::Completed { message } => {
                info!("task {task_id} completed");
                self.finish(TaskStatus::Completed, None);
                sink.emit(EventKind::TaskCompleted, json!({"message": message}));
            }
            Terminal::Failed { reason, message } => {
                warn!("task {task_id} failed ({reason}): {message}");
                self.finish(TaskStatus::Failed, Some(message.as_str()));
                sink.emit(EventKind::Error, json!({"reason": reason, "message": message}));
                sink.emit(EventKind::TaskFailed, json!({"reason": reason}));
            }
            Terminal::Cancelled => {
                // Cooperative cancel is not an error
                info!("task {task_id} cancelled");
                self.finish(TaskStatus::Cancelled, None);
                sink.emit(EventKind::TaskCancelled, json!({}));
            }
        }

        // Close the pump and wait for the stream to drain
        drop(sink);
        let _ = pump.await;

        self.db.get_task(&task_id).ok().flatten().unwrap_or(self.task)
    }

    fn finish(&mut self, status: TaskStatus, error: Option<&str>) {
        match self.db.update_task_status(&self.task.id, status, error) {
            Ok(task) => self.task = task,
            Err(e) => warn!("terminal transition failed for {}: {e}", self.task.id),
        }
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), CoworkError> {
        let task = self
            .db
            .update_task_status(&self.task.id, next, None)
            .map_err(CoworkError::Internal)?;
        self.task = task;
        Ok(())
    }

    async fn drive(&mut self, sink: &EventSink) -> Result<Terminal, CoworkError> {
        self.transition(TaskStatus::Planning)?;
        self.preflight(sink).await?;
        self.transition(TaskStatus::Executing)?;

        let exec_ctx = ExecutionContext {
            task_id: self.task.id.clone(),
            workspace: self.workspace.clone(),
            origin: self.origin,
            context_policy: self.context_policy.clone(),
            cancel: self.cancel.clone(),
            events: Some(sink.clone()),
            db: Some(self.db.clone()),
        };

        let mut messages = vec![ProviderMessage::user_text(self.task.prompt.clone())];
        let tools = self.registry.schemas();
        sink.emit(
            EventKind::PlanCreated,
            json!({
                "prompt": truncate_chars(&self.task.prompt, 200),
                "tools": tools.len(),
            }),
        );

        for iteration in 1..=self.config.max_iterations {
            self.drain_inbox(&mut messages, sink);

            // Token budget is checked before each call
            if let Some(budget) = self.task.budget.max_tokens
                && self.tokens_spent >= budget
            {
                return Err(CoworkError::BudgetExceeded(format!(
                    "spent {} of {} budgeted tokens",
                    self.tokens_spent, budget
                )));
            }

            sink.emit(EventKind::StepStarted, json!({"iteration": iteration}));

            let call = self.provider.create_message_with_retry(
                ProviderRequest {
                    model: &self.model,
                    system: Some(&self.system_prompt),
                    messages: &messages,
                    tools: &tools,
                    max_tokens: self.config.max_tokens,
                    cancel: &self.cancel,
                },
                None,
            );
            let response = match tokio::time::timeout(self.config.llm_timeout, call).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!("LLM call timed out after {:?}", self.config.llm_timeout);
                    return self.finalize_after_timeout(&messages, sink).await;
                }
            };
            self.tokens_spent += response.usage.total();

            if response.has_tool_uses() {
                let calls: Vec<(String, String, serde_json::Value)> = response
                    .tool_uses()
                    .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                    .collect();
                messages.push(ProviderMessage::assistant(response.content));

                // Strictly in order; each result is appended before the next
                // call runs, and one denial never aborts the batch
                let mut results = Vec::with_capacity(calls.len());
                for (id, name, input) in calls {
                    sink.emit(EventKind::ToolCall, json!({"id": id, "tool": name}));
                    let result = self.registry.execute(&name, input, &exec_ctx).await?;
                    sink.emit(
                        EventKind::ToolResult,
                        json!({"id": id, "tool": name, "isError": result.is_error}),
                    );
                    results.push(ContentBlock::tool_result(id, result.content, result.is_error));
                }
                messages.push(ProviderMessage::user(results));
                continue;
            }

            let text = response.text();
            if response.stop_reason == StopReason::MaxTokens {
                debug!("response hit max_tokens, continuing with a follow-up turn");
                sink.emit(EventKind::Truncation, json!({"iteration": iteration}));
                messages.push(ProviderMessage::assistant(response.content));
                messages.push(ProviderMessage::user_text(CONTINUE_PROMPT));
                continue;
            }

            sink.emit(EventKind::AssistantMessage, json!({"text": text}));
            return Ok(Terminal::Completed {
                message: Some(text),
            });
        }

        // Iteration cap: one last no-tools call to surface a summary
        warn!("task {} hit the iteration cap", self.task.id);
        match self.finalize_call(&messages).await {
            Ok(text) => {
                sink.emit(EventKind::AssistantMessage, json!({"text": text}));
                Ok(Terminal::Completed {
                    message: Some(text),
                })
            }
            Err(CoworkError::Cancelled) => Err(CoworkError::Cancelled),
            Err(_) => Ok(Terminal::Failed {
                reason: "iteration_limit".to_string(),
                message: format!(
                    "no final response after {} iterations",
                    self.config.max_iterations
                ),
            }),
        }
    }

    /// Workspace applicability check. Runs once; acknowledged suspensions
    /// are never re-entered for the rest of the task.
    async fn preflight(&mut self, sink: &EventSink) -> Result<(), CoworkError> {
        if !self.workspace.is_temp || !prompt_references_files(&self.task.prompt) {
            return Ok(());
        }

        let mru = self.db.most_recently_used_workspace().ok().flatten();

        if self.config.auto_switch_workspace
            && let Some(ws) = &mru
        {
            info!(
                "preflight: auto-switching task {} to workspace '{}'",
                self.task.id, ws.name
            );
            self.db
                .set_task_workspace(&self.task.id, &ws.id)
                .map_err(CoworkError::Internal)?;
            sink.emit(
                EventKind::Log,
                json!({"preflight": "workspace_auto_switch", "workspaceId": ws.id}),
            );
            self.workspace = Arc::new(ws.clone());
            return Ok(());
        }

        let reason = if mru.is_some() {
            "workspace_mismatch"
        } else {
            "workspace_required"
        };
        self.transition(TaskStatus::AwaitingInput)?;
        sink.emit(EventKind::Log, json!({"preflight": reason}));
        info!("task {} awaiting input: {}", self.task.id, reason);

        loop {
            tokio::select! {
                injection = self.inbox.recv() => match injection {
                    Some(UserInjection::WorkspaceAck) => break,
                    Some(UserInjection::Message(text)) => {
                        // A user reply acknowledges the suspension
                        self.pending_messages.push(text);
                        break;
                    }
                    None => return Err(CoworkError::Cancelled),
                },
                () = self.cancel.cancelled() => return Err(CoworkError::Cancelled),
            }
        }

        // The workspace may have been re-pointed while we were suspended
        if let Ok(Some(task)) = self.db.get_task(&self.task.id)
            && task.workspace_id != self.workspace.id
            && let Ok(Some(ws)) = self.db.get_workspace(&task.workspace_id)
        {
            self.workspace = Arc::new(ws);
        }
        Ok(())
    }

    /// Append injected user messages at the loop boundary.
    fn drain_inbox(&mut self, messages: &mut Vec<ProviderMessage>, sink: &EventSink) {
        for text in self.pending_messages.drain(..) {
            sink.emit(EventKind::Log, json!({"userMessage": true}));
            messages.push(ProviderMessage::user_text(text));
        }
        while let Ok(injection) = self.inbox.try_recv() {
            if let UserInjection::Message(text) = injection {
                sink.emit(EventKind::Log, json!({"userMessage": true}));
                messages.push(ProviderMessage::user_text(text));
            }
        }
    }

    /// Best-effort finalize after an LLM wall-clock timeout: one more call
    /// with reduced context and no tools to produce a user-visible summary.
    async fn finalize_after_timeout(
        &mut self,
        messages: &[ProviderMessage],
        sink: &EventSink,
    ) -> Result<Terminal, CoworkError> {
        match self.finalize_call(messages).await {
            Ok(text) => {
                sink.emit(EventKind::RecoveredFromTimeout, json!({}));
                sink.emit(EventKind::AssistantMessage, json!({"text": text}));
                Ok(Terminal::Completed {
                    message: Some(text),
                })
            }
            Err(CoworkError::Cancelled) => Err(CoworkError::Cancelled),
            Err(e) => {
                warn!("finalize after timeout failed: {e}");
                Ok(Terminal::Failed {
                    reason: "timeout".to_string(),
                    message: format!(
                        "LLM call exceeded {}s and the recovery call failed",
                        self.config.llm_timeout.as_secs()
                    ),
                })
            }
        }
    }

    async fn finalize_call(&self, messages: &[ProviderMessage]) -> Result<String, CoworkError> {
        let mut reduced: Vec<ProviderMessage> = Vec::new();
        if let Some(first) = messages.first() {
            reduced.push(first.clone());
        }
        let tail_start = messages.len().saturating_sub(FINALIZE_TAIL_MESSAGES).max(1);
        if tail_start < messages.len() {
            reduced.extend(messages[tail_start..].iter().cloned());
        }
        // Tool-use blocks without their results confuse providers; keep text only
        for message in &mut reduced {
            message.content.retain(|b| matches!(b, ContentBlock::Text { .. }));
        }
        reduced.retain(|m| !m.content.is_empty());
        reduced.push(ProviderMessage::user_text(FINALIZE_PROMPT));

        let call = self.provider.create_message_with_retry(
            ProviderRequest {
                model: &self.model,
                system: Some(&self.system_prompt),
                messages: &reduced,
                tools: &[],
                max_tokens: self.config.max_tokens,
                cancel: &self.cancel,
            },
            None,
        );
        match tokio::time::timeout(self.config.llm_timeout, call).await {
            Ok(Ok(response)) => Ok(response.text()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoworkError::Timeout {
                what: "finalize call".to_string(),
                secs: self.config.llm_timeout.as_secs(),
            }),
        }
    }
}

static FILE_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:files?|folders?|director(?:y|ies)|repo(?:sitory)?|codebase|rename|organize|move|delete)\b|\.[a-z0-9]{1,4}\b|src/|\./",
    )
    .expect("file hint regex")
});

/// Heuristic: does the prompt look like it wants to touch files or code?
pub fn prompt_references_files(prompt: &str) -> bool {
    FILE_HINT_RE.is_match(prompt)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
