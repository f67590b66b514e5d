use super::*;
use crate::workspace::{Workspace, WorkspacePermissions};

fn workspace() -> (tempfile::TempDir, Workspace) {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::new("test", dir.path());
    (dir, ws)
}

#[test]
fn lexical_normalize_resolves_parent_components() {
    assert_eq!(
        lexical_normalize(Path::new("/w/sub/../etc/passwd")),
        PathBuf::from("/w/etc/passwd")
    );
    assert_eq!(
        lexical_normalize(Path::new("/w/../../etc/passwd")),
        PathBuf::from("/etc/passwd")
    );
    assert_eq!(
        lexical_normalize(Path::new("/w/./a/./b")),
        PathBuf::from("/w/a/b")
    );
}

#[test]
fn root_itself_is_within() {
    let (_dir, ws) = workspace();
    assert!(is_within(&ws.root, &ws.root));
}

#[test]
fn sibling_of_root_is_rejected() {
    let (_dir, ws) = workspace();
    let sibling = ws.root.parent().unwrap().join("sibling");
    assert!(!is_within(&ws.root, &sibling));
    assert!(resolve_within(&ws, &sibling).is_err());
}

#[test]
fn relative_path_resolves_under_workspace() {
    let (_dir, ws) = workspace();
    let resolved = resolve_within(&ws, Path::new("notes/a.md")).unwrap();
    assert!(resolved.starts_with(&ws.root));
}

#[test]
fn dotdot_escape_is_rejected() {
    let (_dir, ws) = workspace();
    let err = resolve_within(&ws, Path::new("../escape.txt")).unwrap_err();
    assert!(matches!(err, CoworkError::PathViolation(_)));
}

#[test]
fn absolute_outside_path_is_rejected() {
    let (_dir, ws) = workspace();
    assert!(resolve_within(&ws, Path::new("/etc/passwd")).is_err());
}

#[test]
fn allowed_paths_extend_containment() {
    let dir = tempfile::tempdir().unwrap();
    let extra = tempfile::tempdir().unwrap();
    let ws = Workspace::new("test", dir.path())
        .with_allowed_paths(vec![extra.path().to_path_buf()]);
    let inside_extra = extra.path().join("file.txt");
    assert!(resolve_within(&ws, &inside_extra).is_ok());
}

#[test]
fn symlink_escape_is_rejected() {
    #[cfg(unix)]
    {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let ws = Workspace::new("test", dir.path());
        let link = ws.root.join("link");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();
        let err = resolve_within(&ws, Path::new("link/secret.txt"));
        assert!(err.is_err(), "symlinked path should resolve outside");
    }
}

#[test]
fn protected_roots_denied_for_write_even_when_unrestricted() {
    let dir = tempfile::tempdir().unwrap();
    let mut ws = Workspace::new("test", dir.path());
    ws.permissions = WorkspacePermissions {
        unrestricted_file_access: true,
        ..WorkspacePermissions::all()
    };
    let err = resolve_for_write(&ws, Path::new("/etc/hosts")).unwrap_err();
    assert!(matches!(err, CoworkError::PathViolation(_)));
    // Reads outside are allowed in unrestricted mode
    assert!(resolve_within(&ws, Path::new("/etc/hosts")).is_ok());
}

#[test]
fn write_inside_workspace_allowed() {
    let (_dir, ws) = workspace();
    assert!(resolve_for_write(&ws, Path::new("out.txt")).is_ok());
}

#[test]
fn sanitize_path_relativizes_workspace_paths() {
    let (_dir, ws) = workspace();
    let inner = ws.root.join("sub/file.txt");
    let shown = sanitize_path(&inner, Some(&ws.root));
    assert!(shown.starts_with("./"), "got: {shown}");
    assert!(!shown.contains(ws.root.to_str().unwrap()));
}

#[test]
fn sanitize_path_redacts_home_paths() {
    if let Some(home) = dirs::home_dir() {
        let secret = home.join("private/keys.txt");
        let shown = sanitize_path(&secret, None);
        assert_eq!(shown, "<redacted>/keys.txt");
    }
}

#[test]
fn sanitize_error_message_rewrites_embedded_paths() {
    if let Some(home) = dirs::home_dir() {
        let msg = format!("failed to open {}/private/keys.txt", home.display());
        let out = sanitize_error_message(&msg, None);
        assert!(out.contains("<redacted>/keys.txt"), "got: {out}");
    }
}
