pub mod bus;

use crate::approval::ApprovalGate;
use crate::config::{Config, ContextPolicy};
use crate::errors::CoworkError;
use crate::executor::{ExecutorConfig, ExecutorSeed, TaskExecutor, UserInjection};
use crate::policy::MessageContext;
use crate::providers::base::LlmProvider;
use crate::skills::SkillsCatalog;
use crate::store::{EventKind, Task, TaskBudget, TaskDb, TaskEvent, TaskStatus};
use crate::tools::agent_control::AgentDirectory;
use crate::tools::registry::ToolRegistry;
use crate::utils::cancel::CancelToken;
use crate::workspace::{TEMP_WORKSPACE_ID, Workspace};
use anyhow::Result;
use async_trait::async_trait;
use bus::{BusMessage, EventBus, Subscription};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};


const DEFAULT_IDENTITY: &str = "You are CoWork, a desktop agent that completes tasks inside a \
user-selected workspace directory by calling tools. Work step by step, verify results, and \
finish with a concise summary for the user.";

/// Persists an event, then fans it out. The synchronous persist-first order
/// is what makes per-task event order total across storage and broadcast.
pub struct EventRecorder {
    db: Arc<TaskDb>,
    bus: Arc<EventBus>,
}

impl EventRecorder {
    pub fn new(db: Arc<TaskDb>, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    pub fn record(&self, task_id: &str, kind: EventKind, payload: Value) -> Result<TaskEvent> {
        let event = self.db.append_event(task_id, kind, payload)?;
        self.bus.publish(&event);
        Ok(event)
    }
}

/// Request shape for [`AgentDaemon::create_task`].
#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    pub title: Option<String>,
    pub prompt: String,
    pub workspace_id: Option<String>,
    pub budget: TaskBudget,
    pub origin: MessageContext,
    pub context_policy: Option<ContextPolicy>,
}

/// Free-form trigger arriving from the hooks server.
#[derive(Debug, Clone)]
pub struct WakeEvent {
    pub message: String,
    /// `now` or `next-heartbeat`.
    pub immediate: bool,
}

struct TaskHandle {
    cancel: CancelToken,
    inbox: mpsc::UnboundedSender<UserInjection>,
}

/// Owns the task registry and the event fan-out; materializes an executor
/// per task and mirrors its lifecycle to persistence and subscribers.
pub struct AgentDaemon {
    db: Arc<TaskDb>,
    bus: Arc<EventBus>,
    recorder: Arc<EventRecorder>,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    approvals: Arc<ApprovalGate>,
    config: Config,
    guideline_block: String,
    running: Mutex<HashMap<String, TaskHandle>>,
    pending_wakes: Mutex<Vec<WakeEvent>>,
}

impl AgentDaemon {
    pub fn new(
        db: Arc<TaskDb>,
        bus: Arc<EventBus>,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        approvals: Arc<ApprovalGate>,
        config: Config,
        skills: &SkillsCatalog,
    ) -> Result<Arc<Self>> {
        let recorder = Arc::new(EventRecorder::new(db.clone(), bus.clone()));
        // The placeholder workspace always exists so tasks can start before
        // a directory is chosen
        let temp = Workspace::temp();
        std::fs::create_dir_all(&temp.root)?;
        db.upsert_workspace(&temp)?;

        Ok(Arc::new(Self {
            db,
            bus,
            recorder,
            provider,
            registry,
            approvals,
            config,
            guideline_block: skills.guideline_block(),
            running: Mutex::new(HashMap::new()),
            pending_wakes: Mutex::new(Vec::new()),
        }))
    }

    pub fn db(&self) -> &Arc<TaskDb> {
        &self.db
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    pub fn recorder(&self) -> &Arc<EventRecorder> {
        &self.recorder
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    fn build_system_prompt(&self, workspace: &Workspace) -> String {
        let mut prompt = String::from(DEFAULT_IDENTITY);
        if !self.guideline_block.is_empty() {
            prompt.push_str("\n\n## Guidelines\n\n");
            prompt.push_str(&self.guideline_block);
        }
        prompt.push_str(&format!(
            "\n\n## Workspace\n\nActive workspace: '{}' at {}. All file paths are relative to it.",
            workspace.name,
            workspace.root.display()
        ));
        prompt
    }

    // ── Task lifecycle ──────────────────────────────────────────

    pub async fn create_task(self: &Arc<Self>, req: CreateTaskRequest) -> Result<Task, CoworkError> {
        if req.prompt.trim().is_empty() {
            return Err(CoworkError::Validation("prompt must not be empty".into()));
        }
        let workspace_id = req.workspace_id.as_deref().unwrap_or(TEMP_WORKSPACE_ID);
        let workspace = self
            .db
            .get_workspace(workspace_id)
            .map_err(CoworkError::Internal)?
            .ok_or_else(|| CoworkError::Validation(format!("unknown workspace: {workspace_id}")))?;

        let title = req.title.unwrap_or_else(|| {
            let mut t: String = req.prompt.chars().take(60).collect();
            if req.prompt.chars().count() > 60 {
                t.push('…');
            }
            t
        });
        let mut task = Task::new(title, req.prompt, &workspace.id);
        task.budget = req.budget;
        self.db.insert_task(&task).map_err(CoworkError::Internal)?;
        self.db
            .touch_workspace(&workspace.id)
            .map_err(CoworkError::Internal)?;

        self.spawn(task.clone(), workspace, req.origin, req.context_policy)
            .await;
        Ok(task)
    }

    /// Spawn a sub-agent task under a parent. Depth is capped by config.
    pub async fn spawn_child_task(
        self: &Arc<Self>,
        parent_id: &str,
        prompt: String,
    ) -> Result<Task, CoworkError> {
        let parent = self
            .db
            .get_task(parent_id)
            .map_err(CoworkError::Internal)?
            .ok_or_else(|| CoworkError::Validation(format!("unknown task: {parent_id}")))?;
        if parent.depth + 1 > self.config.agent.max_task_depth {
            return Err(CoworkError::Forbidden(format!(
                "sub-agent depth limit ({}) reached",
                self.config.agent.max_task_depth
            )));
        }
        let workspace = self
            .db
            .get_workspace(&parent.workspace_id)
            .map_err(CoworkError::Internal)?
            .ok_or_else(|| CoworkError::Internal(anyhow::anyhow!("parent workspace missing")))?;

        let mut task = Task::new(
            format!("sub-agent of {}", parent.id),
            prompt,
            &workspace.id,
        );
        task.parent_task_id = Some(parent.id.clone());
        task.depth = parent.depth + 1;
        self.db.insert_task(&task).map_err(CoworkError::Internal)?;
        self.spawn(task.clone(), workspace, MessageContext::Private, None)
            .await;
        Ok(task)
    }

    async fn spawn(
        self: &Arc<Self>,
        task: Task,
        workspace: Workspace,
        origin: MessageContext,
        context_policy: Option<ContextPolicy>,
    ) {
        let cancel = CancelToken::new();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let system_prompt = self.build_system_prompt(&workspace);

        let seed = ExecutorSeed {
            task: task.clone(),
            workspace: Arc::new(workspace),
            provider: self.provider.clone(),
            registry: self.registry.clone(),
            recorder: self.recorder.clone(),
            db: self.db.clone(),
            config: ExecutorConfig {
                max_iterations: self.config.agent.max_iterations,
                max_tokens: self.config.agent.max_tokens,
                llm_timeout: Duration::from_secs(self.config.agent.llm_timeout_secs),
                auto_switch_workspace: self.config.agent.auto_switch_workspace,
            },
            cancel: cancel.clone(),
            inbox: inbox_rx,
            origin,
            context_policy,
            system_prompt,
            model: self.config.provider.model.clone(),
        };

        let task_id = task.id.clone();
        self.running.lock().await.insert(
            task_id.clone(),
            TaskHandle {
                cancel,
                inbox: inbox_tx,
            },
        );

        let daemon = self.clone();
        tokio::spawn(async move {
            let finished = TaskExecutor::new(seed).run().await;
            info!(
                "task {} finished with status {}",
                finished.id,
                finished.status.as_str()
            );
            daemon.running.lock().await.remove(&finished.id);
        });
    }

    /// Cooperative cancel. Idempotent: re-cancelling a task is a no-op.
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), CoworkError> {
        if let Some(handle) = self.running.lock().await.get(task_id) {
            handle.cancel.cancel();
            return Ok(());
        }
        // Not running: cancel directly if the record is still live
        let task = self
            .db
            .get_task(task_id)
            .map_err(CoworkError::Internal)?
            .ok_or_else(|| CoworkError::Validation(format!("unknown task: {task_id}")))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        self.db
            .update_task_status(task_id, TaskStatus::Cancelled, None)
            .map_err(CoworkError::Internal)?;
        let _ = self.recorder.record(task_id, EventKind::TaskCancelled, json!({}));
        Ok(())
    }

    /// Inject a user message; it joins the thread at the next loop boundary.
    pub async fn send_message(&self, task_id: &str, text: &str) -> Result<(), CoworkError> {
        let running = self.running.lock().await;
        let handle = running
            .get(task_id)
            .ok_or_else(|| CoworkError::Validation(format!("task {task_id} is not running")))?;
        handle
            .inbox
            .send(UserInjection::Message(text.to_string()))
            .map_err(|_| CoworkError::Validation(format!("task {task_id} is shutting down")))?;
        Ok(())
    }

    /// Re-point a task's workspace (resolving a preflight suspension).
    pub async fn update_task_workspace(
        &self,
        task_id: &str,
        workspace_id: &str,
    ) -> Result<(), CoworkError> {
        self.db
            .get_workspace(workspace_id)
            .map_err(CoworkError::Internal)?
            .ok_or_else(|| CoworkError::Validation(format!("unknown workspace: {workspace_id}")))?;
        self.db
            .set_task_workspace(task_id, workspace_id)
            .map_err(CoworkError::Internal)?;
        if let Some(handle) = self.running.lock().await.get(task_id) {
            let _ = handle.inbox.send(UserInjection::WorkspaceAck);
        }
        Ok(())
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.db.list_tasks()
    }

    pub fn task_events(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        self.db.events_for_task(task_id)
    }

    // ── Workspaces ──────────────────────────────────────────────

    pub fn create_workspace(&self, workspace: &Workspace) -> Result<()> {
        std::fs::create_dir_all(&workspace.root)?;
        self.db.upsert_workspace(workspace)
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.db.list_workspaces()
    }

    // ── Wake events (hooks server) ──────────────────────────────

    /// Enqueue a wake. Immediate wakes become tasks right away; deferred
    /// ones wait for the next heartbeat tick.
    pub async fn enqueue_wake(self: &Arc<Self>, wake: WakeEvent) -> Result<Option<Task>, CoworkError> {
        if wake.immediate {
            let task = self
                .create_task(CreateTaskRequest {
                    title: Some("wake".to_string()),
                    prompt: wake.message,
                    ..CreateTaskRequest::default()
                })
                .await?;
            return Ok(Some(task));
        }
        self.pending_wakes.lock().await.push(wake);
        Ok(None)
    }

    /// Start the heartbeat loop draining deferred wakes into tasks.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let daemon = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(daemon) = daemon.upgrade() else {
                    break;
                };
                let wakes: Vec<WakeEvent> = daemon.pending_wakes.lock().await.drain(..).collect();
                for wake in wakes {
                    if let Err(e) = daemon
                        .create_task(CreateTaskRequest {
                            title: Some("heartbeat wake".to_string()),
                            prompt: wake.message,
                            ..CreateTaskRequest::default()
                        })
                        .await
                    {
                        warn!("heartbeat wake failed: {e}");
                    }
                }
            }
        })
    }

    /// Walk the parent chain from `candidate` up; true when it reaches
    /// `ancestor`.
    pub fn task_is_descendant(&self, ancestor: &str, candidate: &str) -> bool {
        let mut current = candidate.to_string();
        for _ in 0..32 {
            let Ok(Some(task)) = self.db.get_task(&current) else {
                return false;
            };
            match task.parent_task_id {
                Some(parent) if parent == ancestor => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    /// Block until the task reaches a terminal state, watching the event
    /// stream rather than polling.
    pub async fn wait_for_task(&self, task_id: &str, timeout: Duration) -> Result<TaskStatus> {
        let mut sub = self.subscribe();
        // The task may already be done
        if let Some(task) = self.db.get_task(task_id)?
            && task.status.is_terminal()
        {
            self.unsubscribe(sub.id);
            return Ok(task.status);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let status = loop {
            let message = tokio::time::timeout_at(deadline, sub.rx.recv()).await;
            match message {
                Ok(Some(delivery)) => match delivery.message {
                    BusMessage::Event(event)
                        if event.task_id == task_id && event.kind.is_terminal() =>
                    {
                        break match event.kind {
                            EventKind::TaskCompleted => TaskStatus::Completed,
                            EventKind::TaskCancelled => TaskStatus::Cancelled,
                            _ => TaskStatus::Failed,
                        };
                    }
                    // Gap markers force a reconciliation read
                    BusMessage::Gap { .. } => {
                        if let Some(task) = self.db.get_task(task_id)?
                            && task.status.is_terminal()
                        {
                            break task.status;
                        }
                    }
                    BusMessage::Event(_) => {}
                },
                Ok(None) => anyhow::bail!("event bus closed"),
                Err(_) => {
                    self.unsubscribe(sub.id);
                    anyhow::bail!("timed out waiting for task {task_id}");
                }
            }
        };
        self.unsubscribe(sub.id);
        Ok(status)
    }
}

/// Late-bound handle letting sub-agent control tools reach the daemon that
/// owns them. The registry is built before the daemon exists, so the tools
/// hold this handle and the daemon binds itself in after construction.
#[derive(Default)]
pub struct DirectoryHandle {
    slot: std::sync::OnceLock<std::sync::Weak<AgentDaemon>>,
}

impl DirectoryHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind(&self, daemon: &Arc<AgentDaemon>) {
        let _ = self.slot.set(Arc::downgrade(daemon));
    }

    fn daemon(&self) -> Result<Arc<AgentDaemon>> {
        self.slot
            .get()
            .and_then(std::sync::Weak::upgrade)
            .ok_or_else(|| anyhow::anyhow!("agent daemon is not running"))
    }
}

#[async_trait]
impl AgentDirectory for DirectoryHandle {
    fn is_descendant(&self, ancestor: &str, candidate: &str) -> bool {
        self.daemon()
            .map(|d| d.task_is_descendant(ancestor, candidate))
            .unwrap_or(false)
    }

    async fn send_message(&self, task_id: &str, text: &str) -> Result<()> {
        self.daemon()?.send_message(task_id, text).await?;
        Ok(())
    }

    async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<TaskStatus> {
        self.daemon()?.wait_for_task(task_id, timeout).await
    }

    fn events_for(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        self.daemon()?.task_events(task_id)
    }

    async fn spawn_child(&self, parent_id: &str, prompt: String) -> Result<String> {
        let task = self.daemon()?.spawn_child_task(parent_id, prompt).await?;
        Ok(task.id)
    }
}
