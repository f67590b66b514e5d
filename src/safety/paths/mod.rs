use crate::errors::CoworkError;
use crate::workspace::Workspace;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

#[cfg(test)]
mod tests;

/// System roots that are never writable through file tools, regardless of
/// workspace permissions.
pub const PROTECTED_ROOTS: &[&str] = &[
    "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/sbin", "/sys", "/usr", "/var",
    "/System", "/Library", "/Applications",
];

/// Normalize a path lexically (without touching the filesystem).
/// Resolves `.` and `..` components so that `/workspace/../etc/passwd`
/// correctly normalizes to `/etc/passwd` rather than passing through
/// as if it starts with `/workspace`.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                // Pop the last normal component (but never pop past root)
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Resolve a path to absolute form. Existing paths are canonicalized
/// (resolving symlinks). For non-existent paths the deepest existing
/// ancestor is canonicalized and the remainder reattached, so neither a
/// `..` component nor a symlinked parent directory can smuggle an access
/// outside the workspace.
pub fn resolve(path: &Path, base: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    if let Ok(canonical) = absolute.canonicalize() {
        return canonical;
    }

    let normalized = lexical_normalize(&absolute);
    let mut existing = normalized.clone();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return normalized,
        }
    }
    let mut resolved = existing.canonicalize().unwrap_or(existing);
    for name in tail.iter().rev() {
        resolved.push(name);
    }
    resolved
}

/// Check containment of an already-resolved path against a root via
/// relative-path comparison: the relative form must not begin with `..`
/// and must not itself be absolute. The root itself is contained.
pub fn is_within(root: &Path, resolved: &Path) -> bool {
    match resolved.strip_prefix(root) {
        Ok(rel) => {
            !rel.is_absolute()
                && !rel
                    .components()
                    .any(|c| matches!(c, Component::ParentDir))
        }
        Err(_) => false,
    }
}

/// Resolve `path` and require it to land inside the workspace (or one of
/// its `allowed_paths`). Returns the resolved absolute path.
pub fn resolve_within(workspace: &Workspace, path: &Path) -> Result<PathBuf, CoworkError> {
    let resolved = resolve(path, &workspace.root);
    if workspace.permissions.unrestricted_file_access {
        return Ok(resolved);
    }
    if workspace
        .containment_roots()
        .any(|root| is_within(root, &resolved))
    {
        Ok(resolved)
    } else {
        Err(CoworkError::PathViolation(format!(
            "path '{}' is outside the workspace",
            sanitize_path(&resolved, Some(&workspace.root))
        )))
    }
}

/// Like [`resolve_within`] but additionally denies writes under protected
/// system roots even when `unrestricted_file_access` is set.
pub fn resolve_for_write(workspace: &Workspace, path: &Path) -> Result<PathBuf, CoworkError> {
    let resolved = resolve(path, &workspace.root);
    for root in PROTECTED_ROOTS {
        let root = Path::new(root);
        // A workspace legitimately rooted under e.g. /var/folders is fine;
        // only deny when the workspace itself is not under the protected root.
        if is_within(root, &resolved) && !is_within(root, &workspace.root) {
            return Err(CoworkError::PathViolation(format!(
                "writes under protected root '{}' are not allowed",
                root.display()
            )));
        }
    }
    if workspace.permissions.unrestricted_file_access {
        return Ok(resolved);
    }
    if workspace
        .containment_roots()
        .any(|root| is_within(root, &resolved))
    {
        Ok(resolved)
    } else {
        Err(CoworkError::PathViolation(format!(
            "path '{}' is outside the workspace",
            sanitize_path(&resolved, Some(&workspace.root))
        )))
    }
}

/// Sanitize a path for inclusion in error messages fed back to the model.
///
/// - Paths under the workspace are shown relative to it
/// - Other paths under the home directory are redacted to `<redacted>/filename`
/// - System paths are shown unchanged
pub fn sanitize_path(path: &Path, workspace: Option<&Path>) -> String {
    if let Some(ws) = workspace
        && let Ok(rel) = path.strip_prefix(ws)
    {
        return format!("{}", Path::new("./").join(rel).display());
    }

    let Some(home) = dirs::home_dir() else {
        return path.display().to_string();
    };
    if path.starts_with(&home) {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        return format!("<redacted>/{filename}");
    }
    path.display().to_string()
}

static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/[\w._-]+){2,}").expect("path regex"));

/// Sanitize an error message by finding and redacting absolute paths
/// under the home directory.
pub fn sanitize_error_message(msg: &str, workspace: Option<&Path>) -> String {
    let Some(home) = dirs::home_dir() else {
        return msg.to_string();
    };
    let home_str = home.to_string_lossy();

    PATH_RE
        .replace_all(msg, |caps: &regex::Captures| {
            let matched = &caps[0];
            if matched.starts_with(home_str.as_ref()) {
                sanitize_path(Path::new(matched), workspace)
            } else {
                matched.to_string()
            }
        })
        .to_string()
}
