use super::*;
use crate::policy::{PolicyManager, PolicyRules, RiskLevel};
use crate::safety::guardrails::GuardrailEngine;
use crate::store::TaskDb;
use crate::tools::base::{ExecutionContext, Tool, ToolResult};
use crate::workspace::{Workspace, WorkspacePermissions};
use async_trait::async_trait;
use serde_json::json;

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the input back."
    }
    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Read
    }
    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<ToolResult> {
        Ok(ToolResult::new(params["text"].as_str().unwrap_or("").to_string()))
    }
}

struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "panic_tool"
    }
    fn description(&self) -> &str {
        "Always panics."
    }
    fn parameters(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {}})
    }
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Read
    }
    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<ToolResult> {
        panic!("boom");
    }
}

struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow_tool"
    }
    fn description(&self) -> &str {
        "Sleeps past its timeout."
    }
    fn parameters(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {}})
    }
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Read
    }
    fn execution_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(50)
    }
    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<ToolResult> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(ToolResult::new("never"))
    }
}

struct DropTool;

#[async_trait]
impl Tool for DropTool {
    fn name(&self) -> &str {
        "drop_table"
    }
    fn description(&self) -> &str {
        "A destructive operation."
    }
    fn parameters(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {}})
    }
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Destructive
    }
    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<ToolResult> {
        Ok(ToolResult::new("dropped"))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    registry: ToolRegistry,
    gate: Arc<ApprovalGate>,
    db: Arc<TaskDb>,
    ctx: ExecutionContext,
}

fn fixture_with_ttl(ttl: Duration) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let ws = Arc::new(
        Workspace::new("w", dir.path()).with_permissions(WorkspacePermissions::all()),
    );
    let db = Arc::new(TaskDb::in_memory().unwrap());
    let task = crate::store::Task::new("t", "p", &ws.id);
    db.insert_task(&task).unwrap();
    let gate = Arc::new(ApprovalGate::new(db.clone(), ttl));
    let policy = Arc::new(PolicyManager::new(
        Arc::new(GuardrailEngine::new(&[]).unwrap()),
        PolicyRules::default(),
    ));
    let mut registry = ToolRegistry::new(policy, gate.clone());
    registry.register(Arc::new(EchoTool));
    registry.register(Arc::new(PanicTool));
    registry.register(Arc::new(SlowTool));
    registry.register(Arc::new(DropTool));
    let mut ctx = ExecutionContext::for_tests(ws);
    ctx.task_id = task.id;
    ctx.db = Some(db.clone());
    Fixture {
        _dir: dir,
        registry,
        gate,
        db,
        ctx,
    }
}

fn fixture() -> Fixture {
    fixture_with_ttl(Duration::from_secs(300))
}

#[tokio::test]
async fn unknown_tool_yields_error_result_listing_catalog() {
    let f = fixture();
    let result = f.registry.execute("nope", json!({}), &f.ctx).await.unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("does not exist"));
    assert!(result.content.contains("echo"));
}

#[tokio::test]
async fn schema_validation_rejects_missing_required() {
    let f = fixture();
    let result = f.registry.execute("echo", json!({}), &f.ctx).await.unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("missing required parameter 'text'"));
}

#[tokio::test]
async fn schema_validation_rejects_wrong_type() {
    let f = fixture();
    let result = f
        .registry
        .execute("echo", json!({"text": 42}), &f.ctx)
        .await
        .unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("should be string"));
}

#[tokio::test]
async fn read_tool_executes_without_approval() {
    let f = fixture();
    let result = f
        .registry
        .execute("echo", json!({"text": "hi"}), &f.ctx)
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content, "hi");
}

#[tokio::test]
async fn panic_is_isolated_into_error_result() {
    let f = fixture();
    let result = f.registry.execute("panic_tool", json!({}), &f.ctx).await.unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("crashed"));
    assert!(result.content.contains("boom"));
}

#[tokio::test]
async fn timeout_becomes_error_result() {
    let f = fixture();
    let result = f.registry.execute("slow_tool", json!({}), &f.ctx).await.unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("timed out"));
}

#[tokio::test]
async fn destructive_tool_waits_for_approval_then_runs() {
    let f = fixture();
    let gate = f.gate.clone();
    let db = f.db.clone();
    // Approve as soon as the pending record appears
    tokio::spawn(async move {
        loop {
            if let Ok(pending) = db.list_pending_approvals()
                && let Some(approval) = pending.first()
            {
                gate.respond(&approval.id, true).await.unwrap();
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    let result = f.registry.execute("drop_table", json!({}), &f.ctx).await.unwrap();
    assert!(!result.is_error, "{}", result.content);
    assert_eq!(result.content, "dropped");
}

#[tokio::test]
async fn denied_approval_becomes_error_result() {
    let f = fixture();
    let gate = f.gate.clone();
    let db = f.db.clone();
    tokio::spawn(async move {
        loop {
            if let Ok(pending) = db.list_pending_approvals()
                && let Some(approval) = pending.first()
            {
                gate.respond(&approval.id, false).await.unwrap();
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    let result = f.registry.execute("drop_table", json!({}), &f.ctx).await.unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("denied"));
}

#[tokio::test]
async fn expired_approval_becomes_error_result() {
    let f = fixture_with_ttl(Duration::from_millis(20));
    let gate = f.gate.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if gate.sweep_expired().await > 0 {
                break;
            }
        }
    });
    let result = f.registry.execute("drop_table", json!({}), &f.ctx).await.unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("expired"));
}

#[tokio::test]
async fn cancellation_propagates_out_of_dispatch() {
    let f = fixture();
    f.ctx.cancel.cancel();
    let err = f.registry.execute("slow_tool", json!({}), &f.ctx).await.unwrap_err();
    assert!(matches!(err, CoworkError::Cancelled));
}

#[tokio::test]
async fn approval_events_are_emitted() {
    let mut f = fixture();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    f.ctx.events = Some(crate::tools::base::EventSink::new(tx));
    let gate = f.gate.clone();
    let db = f.db.clone();
    tokio::spawn(async move {
        loop {
            if let Ok(pending) = db.list_pending_approvals()
                && let Some(approval) = pending.first()
            {
                gate.respond(&approval.id, true).await.unwrap();
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    f.registry.execute("drop_table", json!({}), &f.ctx).await.unwrap();

    let (kind, payload) = rx.recv().await.unwrap();
    assert_eq!(kind, EventKind::ApprovalRequested);
    assert_eq!(payload["type"], "destructive");
    let (kind, payload) = rx.recv().await.unwrap();
    assert_eq!(kind, EventKind::ApprovalResolved);
    assert_eq!(payload["status"], "approved");
}

#[tokio::test]
async fn bridged_tools_get_namespace_prefix() {
    let mut f = fixture();
    f.registry.register_bridged("mcp-files", Arc::new(EchoTool));
    assert!(f.registry.get("mcp-files:echo").is_some());
    let result = f
        .registry
        .execute("mcp-files:echo", json!({"text": "ns"}), &f.ctx)
        .await
        .unwrap();
    assert_eq!(result.content, "ns");
}

#[tokio::test]
async fn oversized_results_are_truncated() {
    struct BigTool;
    #[async_trait]
    impl Tool for BigTool {
        fn name(&self) -> &str {
            "big"
        }
        fn description(&self) -> &str {
            "Returns a huge result."
        }
        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {}})
        }
        fn risk_level(&self) -> RiskLevel {
            RiskLevel::Read
        }
        async fn execute(
            &self,
            _params: serde_json::Value,
            _ctx: &ExecutionContext,
        ) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::new("x".repeat(50_000)))
        }
    }
    let mut f = fixture();
    f.registry.register(Arc::new(BigTool));
    let result = f.registry.execute("big", json!({}), &f.ctx).await.unwrap();
    assert!(result.content.len() < 20_000);
    assert!(result.content.ends_with("[result truncated]"));
}

#[test]
fn canonical_json_sorts_keys() {
    let a = canonical_json(&json!({"b": 1, "a": {"d": 2, "c": 3}}));
    let b = canonical_json(&json!({"a": {"c": 3, "d": 2}, "b": 1}));
    assert_eq!(a, b);
}
