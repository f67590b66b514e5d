use super::*;
use crate::store::TaskDb;
use crate::workspace::Workspace;
use std::sync::Arc;

struct Fixture {
    _dir: tempfile::TempDir,
    ctx: ExecutionContext,
    db: Arc<TaskDb>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let ws = Arc::new(Workspace::new("w", dir.path()));
    let db = Arc::new(TaskDb::in_memory().unwrap());
    let task = crate::store::Task::new("t", "p", &ws.id);
    db.insert_task(&task).unwrap();
    let mut ctx = ExecutionContext::for_tests(ws);
    ctx.task_id = task.id;
    ctx.db = Some(db.clone());
    Fixture { _dir: dir, ctx, db }
}

#[tokio::test]
async fn write_then_read_roundtrip() {
    let f = fixture();
    let write = WriteFileTool
        .execute(
            serde_json::json!({"path": "notes/a.md", "content": "# hi"}),
            &f.ctx,
        )
        .await
        .unwrap();
    assert!(!write.is_error, "{}", write.content);
    assert!(write.content.starts_with("Created"));

    let read = ReadFileTool
        .execute(serde_json::json!({"path": "notes/a.md"}), &f.ctx)
        .await
        .unwrap();
    assert_eq!(read.content, "# hi");
}

#[tokio::test]
async fn write_records_artifact_with_hash() {
    let f = fixture();
    WriteFileTool
        .execute(
            serde_json::json!({"path": "out.txt", "content": "payload"}),
            &f.ctx,
        )
        .await
        .unwrap();
    let artifacts = f.db.artifacts_for_task(&f.ctx.task_id).unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].path, "out.txt");
    assert_eq!(artifacts[0].mime_type, "text/plain");
    assert_eq!(artifacts[0].size_bytes, 7);
    assert_eq!(artifacts[0].sha256.len(), 64);
}

#[tokio::test]
async fn rewrite_reports_updated() {
    let f = fixture();
    let params = serde_json::json!({"path": "a.txt", "content": "one"});
    WriteFileTool.execute(params.clone(), &f.ctx).await.unwrap();
    let second = WriteFileTool
        .execute(serde_json::json!({"path": "a.txt", "content": "two"}), &f.ctx)
        .await
        .unwrap();
    assert!(second.content.starts_with("Updated"));
}

#[tokio::test]
async fn read_missing_file_is_error_result() {
    let f = fixture();
    let read = ReadFileTool
        .execute(serde_json::json!({"path": "nope.txt"}), &f.ctx)
        .await
        .unwrap();
    assert!(read.is_error);
}

#[tokio::test]
async fn escape_attempts_are_rejected() {
    let f = fixture();
    let write = WriteFileTool
        .execute(
            serde_json::json!({"path": "../escape.txt", "content": "x"}),
            &f.ctx,
        )
        .await
        .unwrap();
    assert!(write.is_error);
    let read = ReadFileTool
        .execute(serde_json::json!({"path": "/etc/passwd"}), &f.ctx)
        .await
        .unwrap();
    assert!(read.is_error);
}

#[tokio::test]
async fn list_dir_sorts_and_marks_directories() {
    let f = fixture();
    std::fs::create_dir(f.ctx.workspace.root.join("sub")).unwrap();
    std::fs::write(f.ctx.workspace.root.join("b.txt"), "b").unwrap();
    std::fs::write(f.ctx.workspace.root.join("a.txt"), "a").unwrap();
    let listing = ListDirTool
        .execute(serde_json::json!({}), &f.ctx)
        .await
        .unwrap();
    let lines: Vec<&str> = listing.content.lines().collect();
    assert_eq!(lines, vec!["a.txt", "b.txt", "sub/"]);
}

#[tokio::test]
async fn recursive_listing_walks_subdirectories() {
    let f = fixture();
    std::fs::create_dir_all(f.ctx.workspace.root.join("sub/deep")).unwrap();
    std::fs::write(f.ctx.workspace.root.join("sub/deep/x.txt"), "x").unwrap();
    let flat = ListDirTool
        .execute(serde_json::json!({}), &f.ctx)
        .await
        .unwrap();
    assert!(!flat.content.contains("x.txt"));
    let deep = ListDirTool
        .execute(serde_json::json!({"recursive": true}), &f.ctx)
        .await
        .unwrap();
    assert!(deep.content.contains("sub/deep/x.txt"));
}

#[tokio::test]
async fn delete_removes_file() {
    let f = fixture();
    std::fs::write(f.ctx.workspace.root.join("old.txt"), "x").unwrap();
    let result = DeleteFileTool
        .execute(serde_json::json!({"path": "old.txt"}), &f.ctx)
        .await
        .unwrap();
    assert!(!result.is_error);
    assert!(!f.ctx.workspace.root.join("old.txt").exists());
}

#[tokio::test]
async fn delete_missing_file_is_error_result() {
    let f = fixture();
    let result = DeleteFileTool
        .execute(serde_json::json!({"path": "ghost.txt"}), &f.ctx)
        .await
        .unwrap();
    assert!(result.is_error);
}

#[tokio::test]
async fn bulk_rename_moves_files_and_records_artifacts() {
    let f = fixture();
    std::fs::write(f.ctx.workspace.root.join("a.log"), "a").unwrap();
    std::fs::write(f.ctx.workspace.root.join("b.log"), "b").unwrap();
    let result = BulkRenameTool
        .execute(
            serde_json::json!({"renames": [
                {"from": "a.log", "to": "logs/a.log"},
                {"from": "b.log", "to": "logs/b.log"}
            ]}),
            &f.ctx,
        )
        .await
        .unwrap();
    assert!(!result.is_error, "{}", result.content);
    assert!(f.ctx.workspace.root.join("logs/a.log").exists());
    assert!(f.ctx.workspace.root.join("logs/b.log").exists());
    let artifacts = f.db.artifacts_for_task(&f.ctx.task_id).unwrap();
    assert_eq!(artifacts.len(), 2);
    assert!(artifacts.iter().all(|a| a.path.starts_with("logs/")));
}

#[tokio::test]
async fn bulk_rename_fails_whole_batch_on_bad_entry() {
    let f = fixture();
    std::fs::write(f.ctx.workspace.root.join("a.log"), "a").unwrap();
    let result = BulkRenameTool
        .execute(
            serde_json::json!({"renames": [
                {"from": "a.log", "to": "logs/a.log"},
                {"from": "missing.log", "to": "logs/missing.log"}
            ]}),
            &f.ctx,
        )
        .await
        .unwrap();
    assert!(result.is_error);
    // Nothing moved
    assert!(f.ctx.workspace.root.join("a.log").exists());
    assert!(!f.ctx.workspace.root.join("logs").exists());
}

#[test]
fn mime_inference_covers_common_types() {
    assert_eq!(mime_for(Path::new("a.log")), "text/plain");
    assert_eq!(mime_for(Path::new("a.json")), "application/json");
    assert_eq!(mime_for(Path::new("a.png")), "image/png");
    assert_eq!(mime_for(Path::new("a.bin")), "application/octet-stream");
}
