use crate::policy::RiskLevel;
use crate::safety::paths::{resolve_for_write, resolve_within, sanitize_path};
use crate::store::{Artifact, EventKind};
use crate::tools::base::{ExecutionContext, Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::warn;

#[cfg(test)]
mod tests;

/// Read cap for `read_file` results.
const MAX_READ_BYTES: usize = 256 * 1024;
/// Directory listing cap.
const MAX_LIST_ENTRIES: usize = 500;
/// Depth cap for recursive listings.
const MAX_LIST_DEPTH: usize = 6;

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "yaml" | "yml" => "application/yaml",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "js" | "mjs" => "text/javascript",
        "py" | "rs" | "go" | "ts" | "tsx" | "jsx" | "c" | "h" | "cpp" | "java" | "rb" | "sh" => {
            "text/x-source"
        }
        _ => "application/octet-stream",
    }
}

/// Record an artifact row and emit the matching file event. Called by every
/// tool that materializes a file inside the workspace.
fn record_artifact(ctx: &ExecutionContext, abs_path: &Path, created: bool) {
    let Ok(rel) = abs_path.strip_prefix(&ctx.workspace.root) else {
        return;
    };
    let rel = rel.to_string_lossy().to_string();

    if let Some(db) = &ctx.db {
        let (sha256, size_bytes) = match std::fs::read(abs_path) {
            Ok(bytes) => (hex::encode(Sha256::digest(&bytes)), bytes.len() as u64),
            Err(e) => {
                warn!("artifact hash failed for {}: {}", abs_path.display(), e);
                return;
            }
        };
        let artifact = Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: ctx.task_id.clone(),
            path: rel.clone(),
            mime_type: mime_for(abs_path).to_string(),
            sha256,
            size_bytes,
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = db.insert_artifact(&artifact) {
            warn!("failed to record artifact {}: {}", rel, e);
        }
    }

    ctx.emit(
        if created {
            EventKind::FileCreated
        } else {
            EventKind::FileModified
        },
        json!({"path": rel}),
    );
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace and return its contents as text."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace root"}
            },
            "required": ["path"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Read
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let path = params["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' parameter"))?;
        let resolved = match resolve_within(&ctx.workspace, Path::new(path)) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };
        let bytes = match std::fs::read(&resolved) {
            Ok(b) => b,
            Err(e) => {
                return Ok(ToolResult::error(format!(
                    "cannot read '{}': {}",
                    sanitize_path(&resolved, Some(&ctx.workspace.root)),
                    e.kind()
                )));
            }
        };
        let truncated = bytes.len() > MAX_READ_BYTES;
        let slice = crate::utils::subprocess::truncate_at_utf8_boundary(&bytes, MAX_READ_BYTES);
        let mut content = String::from_utf8_lossy(slice).to_string();
        if truncated {
            content.push_str("\n[file truncated]");
        }
        Ok(ToolResult::new(content))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text content to a file in the workspace, creating parent directories as needed."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace root"},
                "content": {"type": "string", "description": "Text content to write"}
            },
            "required": ["path", "content"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Write
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let path = params["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' parameter"))?;
        let content = params["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'content' parameter"))?;
        let resolved = match resolve_for_write(&ctx.workspace, Path::new(path)) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };
        let created = !resolved.exists();
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&resolved, content)?;
        record_artifact(ctx, &resolved, created);
        Ok(ToolResult::new(format!(
            "{} {} ({} bytes)",
            if created { "Created" } else { "Updated" },
            sanitize_path(&resolved, Some(&ctx.workspace.root)),
            content.len()
        )))
    }
}

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List files and directories under a workspace path."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory to list, relative to the workspace root (default: the root)"},
                "recursive": {"type": "boolean", "description": "Walk subdirectories (default false)"}
            }
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Read
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let path = params["path"].as_str().unwrap_or(".");
        let recursive = params["recursive"].as_bool().unwrap_or(false);
        let resolved = match resolve_within(&ctx.workspace, Path::new(path)) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };
        if !resolved.is_dir() {
            return Ok(ToolResult::error(format!(
                "'{}' is not a directory",
                sanitize_path(&resolved, Some(&ctx.workspace.root))
            )));
        }
        let max_depth = if recursive { MAX_LIST_DEPTH } else { 1 };
        let mut entries: Vec<String> = Vec::new();
        let mut truncated = false;
        for entry in walkdir::WalkDir::new(&resolved)
            .min_depth(1)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            let Ok(rel) = entry.path().strip_prefix(&resolved) else {
                continue;
            };
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            entries.push(format!("{}{suffix}", rel.display()));
            if entries.len() >= MAX_LIST_ENTRIES {
                truncated = true;
                break;
            }
        }
        entries.sort();
        if truncated {
            entries.push("[listing truncated]".to_string());
        }
        if entries.is_empty() {
            return Ok(ToolResult::new("(empty directory)"));
        }
        Ok(ToolResult::new(entries.join("\n")))
    }
}

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file from the workspace. Requires user approval."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File to delete, relative to the workspace root"}
            },
            "required": ["path"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Destructive
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let path = params["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' parameter"))?;
        let resolved = match resolve_for_write(&ctx.workspace, Path::new(path)) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };
        if !resolved.is_file() {
            return Ok(ToolResult::error(format!(
                "'{}' does not exist or is not a file",
                sanitize_path(&resolved, Some(&ctx.workspace.root))
            )));
        }
        std::fs::remove_file(&resolved)?;
        let rel = resolved
            .strip_prefix(&ctx.workspace.root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string());
        ctx.emit(EventKind::FileModified, json!({"path": rel, "deleted": true}));
        Ok(ToolResult::new(format!(
            "Deleted {}",
            sanitize_path(&resolved, Some(&ctx.workspace.root))
        )))
    }
}

pub struct BulkRenameTool;

#[async_trait]
impl Tool for BulkRenameTool {
    fn name(&self) -> &str {
        "bulk_rename"
    }

    fn description(&self) -> &str {
        "Rename or move multiple files inside the workspace in one operation."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "renames": {
                    "type": "array",
                    "description": "List of {from, to} pairs, paths relative to the workspace root",
                    "items": {
                        "type": "object",
                        "properties": {
                            "from": {"type": "string"},
                            "to": {"type": "string"}
                        },
                        "required": ["from", "to"]
                    }
                }
            },
            "required": ["renames"]
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Write
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<ToolResult> {
        let renames = params["renames"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Missing 'renames' parameter"))?;

        // Resolve everything before moving anything so a bad entry fails
        // the whole batch with no partial effects.
        let mut resolved = Vec::with_capacity(renames.len());
        for entry in renames {
            let from = entry["from"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("rename entry missing 'from'"))?;
            let to = entry["to"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("rename entry missing 'to'"))?;
            let from_abs = match resolve_within(&ctx.workspace, Path::new(from)) {
                Ok(p) => p,
                Err(e) => return Ok(ToolResult::error(e.to_string())),
            };
            let to_abs = match resolve_for_write(&ctx.workspace, Path::new(to)) {
                Ok(p) => p,
                Err(e) => return Ok(ToolResult::error(e.to_string())),
            };
            if !from_abs.is_file() {
                return Ok(ToolResult::error(format!(
                    "'{}' does not exist",
                    sanitize_path(&from_abs, Some(&ctx.workspace.root))
                )));
            }
            resolved.push((from_abs, to_abs));
        }

        for (from_abs, to_abs) in &resolved {
            if let Some(parent) = to_abs.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(from_abs, to_abs)?;
            record_artifact(ctx, to_abs, true);
        }
        Ok(ToolResult::new(format!("Renamed {} file(s)", resolved.len())))
    }
}
