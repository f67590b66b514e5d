use crate::workspace::Workspace;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;


/// Task lifecycle states. Transitions are monotone except
/// `AwaitingInput` ⇄ `Executing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    Executing,
    AwaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Executing => "executing",
            TaskStatus::AwaitingInput => "awaiting_input",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "planning" => Some(TaskStatus::Planning),
            "executing" => Some(TaskStatus::Executing),
            "awaiting_input" => Some(TaskStatus::AwaitingInput),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::{AwaitingInput, Cancelled, Completed, Executing, Failed, Pending, Planning};
        if self == next {
            return false;
        }
        match self {
            Pending => matches!(next, Planning | Executing | Cancelled | Failed),
            Planning => matches!(next, Executing | AwaitingInput | Cancelled | Failed),
            Executing => matches!(next, AwaitingInput | Completed | Failed | Cancelled),
            AwaitingInput => matches!(next, Executing | Cancelled | Failed),
            Completed | Failed | Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBudget {
    pub max_tokens: Option<u64>,
    pub max_cost_cents: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub workspace_id: String,
    pub parent_task_id: Option<String>,
    pub depth: u32,
    #[serde(default)]
    pub budget: TaskBudget,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>, prompt: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            prompt: prompt.into(),
            status: TaskStatus::Pending,
            workspace_id: workspace_id.into(),
            parent_task_id: None,
            depth: 0,
            budget: TaskBudget::default(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Event kinds recorded on the append-only per-task stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlanCreated,
    StepStarted,
    ToolCall,
    ToolResult,
    AssistantMessage,
    FileCreated,
    FileModified,
    ApprovalRequested,
    ApprovalResolved,
    Log,
    Error,
    Truncation,
    RecoveredFromTimeout,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    /// Synthetic marker inserted when a subscriber queue overflowed.
    Gap,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PlanCreated => "plan_created",
            EventKind::StepStarted => "step_started",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::AssistantMessage => "assistant_message",
            EventKind::FileCreated => "file_created",
            EventKind::FileModified => "file_modified",
            EventKind::ApprovalRequested => "approval_requested",
            EventKind::ApprovalResolved => "approval_resolved",
            EventKind::Log => "log",
            EventKind::Error => "error",
            EventKind::Truncation => "truncation",
            EventKind::RecoveredFromTimeout => "recovered_from_timeout",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskCancelled => "task_cancelled",
            EventKind::Gap => "gap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::TaskCompleted | EventKind::TaskFailed | EventKind::TaskCancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub id: String,
    pub task_id: String,
    /// Monotonic position within the task's stream, starting at 1.
    pub seq: u64,
    pub kind: EventKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub task_id: String,
    /// Workspace-relative path.
    pub path: String,
    pub mime_type: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    TimedOut,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "denied" => Some(ApprovalStatus::Denied),
            "timed_out" => Some(ApprovalStatus::TimedOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: String,
    pub task_id: String,
    pub kind: String,
    pub description: String,
    pub details: Value,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// SQLite-backed store for tasks, events, artifacts, approvals, and the
/// workspace registry. Events are append-only and ordered per task.
pub struct TaskDb {
    conn: Mutex<Connection>,
}

impl TaskDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open task db at {}", path.display()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS tasks (
                 id TEXT PRIMARY KEY,
                 title TEXT NOT NULL,
                 prompt TEXT NOT NULL,
                 status TEXT NOT NULL,
                 workspace_id TEXT NOT NULL,
                 parent_task_id TEXT,
                 depth INTEGER NOT NULL DEFAULT 0,
                 budget TEXT NOT NULL DEFAULT '{}',
                 error TEXT,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 completed_at TEXT
             );
             CREATE TABLE IF NOT EXISTS task_events (
                 id TEXT PRIMARY KEY,
                 task_id TEXT NOT NULL,
                 seq INTEGER NOT NULL,
                 kind TEXT NOT NULL,
                 payload TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 UNIQUE(task_id, seq)
             );
             CREATE INDEX IF NOT EXISTS idx_task_events ON task_events(task_id, seq);
             CREATE TABLE IF NOT EXISTS artifacts (
                 id TEXT PRIMARY KEY,
                 task_id TEXT NOT NULL,
                 path TEXT NOT NULL,
                 mime_type TEXT NOT NULL,
                 sha256 TEXT NOT NULL,
                 size_bytes INTEGER NOT NULL,
                 created_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS approvals (
                 id TEXT PRIMARY KEY,
                 task_id TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 description TEXT NOT NULL,
                 details TEXT NOT NULL,
                 status TEXT NOT NULL,
                 requested_at TEXT NOT NULL,
                 resolved_at TEXT
             );
             CREATE TABLE IF NOT EXISTS workspaces (
                 id TEXT PRIMARY KEY,
                 name TEXT NOT NULL,
                 root TEXT NOT NULL,
                 permissions TEXT NOT NULL,
                 allowed_paths TEXT NOT NULL,
                 is_temp INTEGER NOT NULL DEFAULT 0,
                 created_at TEXT NOT NULL,
                 last_used_at TEXT NOT NULL
             );",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ── Tasks ───────────────────────────────────────────────────

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tasks (id, title, prompt, status, workspace_id, parent_task_id, depth,
                                budget, error, created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id,
                task.title,
                task.prompt,
                task.status.as_str(),
                task.workspace_id,
                task.parent_task_id,
                task.depth,
                serde_json::to_string(&task.budget)?,
                task.error,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
                task.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Transition a task's status, enforcing the legal transition set.
    /// Sets `completed_at` iff the new status is terminal.
    pub fn update_task_status(
        &self,
        task_id: &str,
        next: TaskStatus,
        error: Option<&str>,
    ) -> Result<Task> {
        let current = self
            .get_task(task_id)?
            .with_context(|| format!("unknown task: {task_id}"))?;
        if !current.status.can_transition_to(next) {
            anyhow::bail!(
                "illegal task transition {} -> {} for {}",
                current.status.as_str(),
                next.as_str(),
                task_id
            );
        }
        let now = Utc::now();
        let completed_at = next.is_terminal().then(|| now.to_rfc3339());
        {
            let conn = self.lock();
            conn.execute(
                "UPDATE tasks SET status = ?1, error = ?2, updated_at = ?3, completed_at = ?4
                 WHERE id = ?5",
                params![next.as_str(), error, now.to_rfc3339(), completed_at, task_id],
            )?;
        }
        Ok(self.get_task(task_id)?.expect("task just updated"))
    }

    pub fn set_task_workspace(&self, task_id: &str, workspace_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tasks SET workspace_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![workspace_id, Utc::now().to_rfc3339(), task_id],
        )?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, title, prompt, status, workspace_id, parent_task_id, depth, budget,
                    error, created_at, updated_at, completed_at
             FROM tasks WHERE id = ?1",
            params![task_id],
            row_to_task,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, prompt, status, workspace_id, parent_task_id, depth, budget,
                    error, created_at, updated_at, completed_at
             FROM tasks ORDER BY created_at DESC",
        )?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    // ── Events ──────────────────────────────────────────────────

    /// Append an event to a task's stream. Sequence assignment and insert
    /// happen in one transaction so per-task order is total.
    pub fn append_event(&self, task_id: &str, kind: EventKind, payload: Value) -> Result<TaskEvent> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM task_events WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        let event = TaskEvent {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            seq: seq as u64,
            kind,
            payload,
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO task_events (id, task_id, seq, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.task_id,
                seq,
                event.kind.as_str(),
                serde_json::to_string(&event.payload)?,
                event.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(event)
    }

    pub fn events_for_task(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, seq, kind, payload, created_at
             FROM task_events WHERE task_id = ?1 ORDER BY seq ASC",
        )?;
        let events = stmt
            .query_map(params![task_id], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    // ── Artifacts ───────────────────────────────────────────────

    pub fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO artifacts (id, task_id, path, mime_type, sha256, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                artifact.id,
                artifact.task_id,
                artifact.path,
                artifact.mime_type,
                artifact.sha256,
                artifact.size_bytes as i64,
                artifact.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn artifacts_for_task(&self, task_id: &str) -> Result<Vec<Artifact>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, path, mime_type, sha256, size_bytes, created_at
             FROM artifacts WHERE task_id = ?1 ORDER BY created_at ASC",
        )?;
        let artifacts = stmt
            .query_map(params![task_id], |row| {
                Ok(Artifact {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    path: row.get(2)?,
                    mime_type: row.get(3)?,
                    sha256: row.get(4)?,
                    size_bytes: row.get::<_, i64>(5)? as u64,
                    created_at: parse_ts(&row.get::<_, String>(6)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(artifacts)
    }

    // ── Approvals ───────────────────────────────────────────────

    pub fn insert_approval(&self, approval: &Approval) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO approvals (id, task_id, kind, description, details, status,
                                    requested_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                approval.id,
                approval.task_id,
                approval.kind,
                approval.description,
                serde_json::to_string(&approval.details)?,
                approval.status.as_str(),
                approval.requested_at.to_rfc3339(),
                approval.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_approval(&self, approval_id: &str) -> Result<Option<Approval>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, task_id, kind, description, details, status, requested_at, resolved_at
             FROM approvals WHERE id = ?1",
            params![approval_id],
            row_to_approval,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Resolve a pending approval. Returns `true` if this call performed the
    /// transition, `false` if the approval was already resolved.
    pub fn resolve_approval(&self, approval_id: &str, status: ApprovalStatus) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE approvals SET status = ?1, resolved_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![status.as_str(), Utc::now().to_rfc3339(), approval_id],
        )?;
        Ok(changed == 1)
    }

    pub fn pending_approval_for_task(&self, task_id: &str) -> Result<Option<Approval>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, task_id, kind, description, details, status, requested_at, resolved_at
             FROM approvals WHERE task_id = ?1 AND status = 'pending' LIMIT 1",
            params![task_id],
            row_to_approval,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_pending_approvals(&self) -> Result<Vec<Approval>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, kind, description, details, status, requested_at, resolved_at
             FROM approvals WHERE status = 'pending' ORDER BY requested_at ASC",
        )?;
        let approvals = stmt
            .query_map([], row_to_approval)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(approvals)
    }

    // ── Workspaces ──────────────────────────────────────────────

    pub fn upsert_workspace(&self, workspace: &Workspace) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO workspaces (id, name, root, permissions, allowed_paths, is_temp,
                                     created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name, root = excluded.root,
                 permissions = excluded.permissions,
                 allowed_paths = excluded.allowed_paths,
                 is_temp = excluded.is_temp",
            params![
                workspace.id,
                workspace.name,
                workspace.root.to_string_lossy(),
                serde_json::to_string(&workspace.permissions)?,
                serde_json::to_string(&workspace.allowed_paths)?,
                workspace.is_temp,
                workspace.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn touch_workspace(&self, workspace_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE workspaces SET last_used_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), workspace_id],
        )?;
        Ok(())
    }

    pub fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, root, permissions, allowed_paths, is_temp, created_at
             FROM workspaces WHERE id = ?1",
            params![workspace_id],
            row_to_workspace,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, root, permissions, allowed_paths, is_temp, created_at
             FROM workspaces ORDER BY last_used_at DESC",
        )?;
        let workspaces = stmt
            .query_map([], row_to_workspace)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(workspaces)
    }

    /// Most recently used non-temp workspace, if any.
    pub fn most_recently_used_workspace(&self) -> Result<Option<Workspace>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, root, permissions, allowed_paths, is_temp, created_at
             FROM workspaces WHERE is_temp = 0 ORDER BY last_used_at DESC LIMIT 1",
            [],
            row_to_workspace,
        )
        .optional()
        .map_err(Into::into)
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    let budget: String = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        prompt: row.get(2)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        workspace_id: row.get(4)?,
        parent_task_id: row.get(5)?,
        depth: row.get::<_, i64>(6)? as u32,
        budget: serde_json::from_str(&budget).unwrap_or_default(),
        error: row.get(8)?,
        created_at: parse_ts(&row.get::<_, String>(9)?),
        updated_at: parse_ts(&row.get::<_, String>(10)?),
        completed_at: row
            .get::<_, Option<String>>(11)?
            .map(|s| parse_ts(&s)),
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskEvent> {
    let kind: String = row.get(3)?;
    let payload: String = row.get(4)?;
    Ok(TaskEvent {
        id: row.get(0)?,
        task_id: row.get(1)?,
        seq: row.get::<_, i64>(2)? as u64,
        kind: EventKind::parse(&kind).unwrap_or(EventKind::Log),
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        created_at: parse_ts(&row.get::<_, String>(5)?),
    })
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<Approval> {
    let status: String = row.get(5)?;
    let details: String = row.get(4)?;
    Ok(Approval {
        id: row.get(0)?,
        task_id: row.get(1)?,
        kind: row.get(2)?,
        description: row.get(3)?,
        details: serde_json::from_str(&details).unwrap_or(Value::Null),
        status: ApprovalStatus::parse(&status).unwrap_or(ApprovalStatus::Pending),
        requested_at: parse_ts(&row.get::<_, String>(6)?),
        resolved_at: row.get::<_, Option<String>>(7)?.map(|s| parse_ts(&s)),
    })
}

fn row_to_workspace(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workspace> {
    let permissions: String = row.get(3)?;
    let allowed: String = row.get(4)?;
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        root: std::path::PathBuf::from(row.get::<_, String>(2)?),
        permissions: serde_json::from_str(&permissions).unwrap_or_default(),
        allowed_paths: serde_json::from_str(&allowed).unwrap_or_default(),
        is_temp: row.get::<_, i64>(5)? != 0,
        created_at: parse_ts(&row.get::<_, String>(6)?),
    })
}
