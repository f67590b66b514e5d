#![allow(dead_code)]

use cowork::approval::ApprovalGate;
use cowork::config::Config;
use cowork::daemon::bus::EventBus;
use cowork::daemon::{AgentDaemon, DirectoryHandle};
use cowork::policy::{PolicyManager, PolicyRules};
use cowork::providers::base::LlmProvider;
use cowork::providers::testing::ScriptedProvider;
use cowork::safety::guardrails::GuardrailEngine;
use cowork::sandbox::SandboxRunner;
use cowork::skills::SkillsCatalog;
use cowork::store::{TaskDb, TaskStatus};
use cowork::tools::agent_control::{
    CaptureAgentEventsTool, SendAgentMessageTool, SpawnAgentTool, WaitForAgentTool,
};
use cowork::tools::filesystem::{
    BulkRenameTool, DeleteFileTool, ListDirTool, ReadFileTool, WriteFileTool,
};
use cowork::tools::registry::ToolRegistry;
use cowork::tools::shell::RunShellCommandTool;
use cowork::workspace::{Workspace, WorkspacePermissions};
use std::sync::Arc;
use std::time::Duration;

pub use cowork::providers::testing::Script;

/// Full-stack daemon wired the way `coworkd daemon` wires it, with a
/// scripted provider and an in-memory task database.
pub struct TestCore {
    pub daemon: Arc<AgentDaemon>,
    pub provider: Arc<ScriptedProvider>,
}

pub fn build_core(script: Vec<Script>, config: Config) -> TestCore {
    let db = Arc::new(TaskDb::in_memory().unwrap());
    let bus = Arc::new(EventBus::default());
    let guardrails = Arc::new(GuardrailEngine::new(&config.guardrails.additional_patterns).unwrap());
    let policy = Arc::new(PolicyManager::new(
        guardrails.clone(),
        PolicyRules {
            bulk_rename_threshold: config.agent.bulk_rename_threshold,
        },
    ));
    let approvals = Arc::new(ApprovalGate::new(
        db.clone(),
        Duration::from_secs(config.approvals.ttl_secs),
    ));
    let runner = Arc::new(SandboxRunner::new(cowork::config::SandboxConfig {
        mode: "none".to_string(),
        ..cowork::config::SandboxConfig::default()
    }));

    let directory = DirectoryHandle::new();
    let mut registry = ToolRegistry::new(policy, approvals.clone());
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(WriteFileTool));
    registry.register(Arc::new(ListDirTool));
    registry.register(Arc::new(DeleteFileTool));
    registry.register(Arc::new(BulkRenameTool));
    registry.register(Arc::new(RunShellCommandTool::new(
        guardrails,
        runner,
        Duration::from_secs(10),
    )));
    registry.register(Arc::new(SendAgentMessageTool::new(directory.clone())));
    registry.register(Arc::new(WaitForAgentTool::new(directory.clone())));
    registry.register(Arc::new(CaptureAgentEventsTool::new(directory.clone())));
    registry.register(Arc::new(SpawnAgentTool::new(directory.clone())));

    let provider = Arc::new(ScriptedProvider::new(script));
    let daemon = AgentDaemon::new(
        db,
        bus,
        provider.clone() as Arc<dyn LlmProvider>,
        Arc::new(registry),
        approvals,
        config,
        &SkillsCatalog::empty(),
    )
    .unwrap();
    directory.bind(&daemon);
    TestCore { daemon, provider }
}

/// Register a workspace with the given permissions, seeded with files.
pub fn seed_workspace(
    core: &TestCore,
    permissions: WorkspacePermissions,
    files: &[(&str, &str)],
) -> (tempfile::TempDir, Workspace) {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    let workspace = Workspace::new("test-workspace", dir.path()).with_permissions(permissions);
    core.daemon.create_workspace(&workspace).unwrap();
    (dir, workspace)
}

/// Poll until the task reaches a terminal state (with a hard deadline).
pub async fn wait_terminal(core: &TestCore, task_id: &str) -> cowork::store::Task {
    for _ in 0..500 {
        if let Some(task) = core.daemon.db().get_task(task_id).unwrap()
            && task.status.is_terminal()
        {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached a terminal state");
}

/// Poll until the task suspends in `awaiting_input` or a pending approval
/// exists, whichever the caller is waiting on.
pub async fn wait_for_status(core: &TestCore, task_id: &str, status: TaskStatus) {
    for _ in 0..500 {
        if let Some(task) = core.daemon.db().get_task(task_id).unwrap()
            && task.status == status
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached {}", status.as_str());
}
