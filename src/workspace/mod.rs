use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};


/// Reserved workspace identity meaning "no workspace chosen yet".
pub const TEMP_WORKSPACE_ID: &str = "__temp_workspace__";

/// Capability flags bounding what the agent may do inside a workspace.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkspacePermissions {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub shell: bool,
    pub network: bool,
    pub unrestricted_file_access: bool,
}

impl WorkspacePermissions {
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            delete: true,
            shell: true,
            network: true,
            unrestricted_file_access: false,
        }
    }
}

/// A directory plus the permission set that bounds agent actions within it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub root: PathBuf,
    pub permissions: WorkspacePermissions,
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub is_temp: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        // Canonicalize so containment checks compare resolved paths on both sides
        let root = root.canonicalize().unwrap_or(root);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            root,
            permissions: WorkspacePermissions::read_write(),
            allowed_paths: Vec::new(),
            is_temp: false,
            created_at: chrono::Utc::now(),
        }
    }

    /// The placeholder workspace used before the user has picked a directory.
    pub fn temp() -> Self {
        let root = std::env::temp_dir().join("cowork-temp-workspace");
        Self {
            id: TEMP_WORKSPACE_ID.to_string(),
            name: "Temporary".to_string(),
            root,
            permissions: WorkspacePermissions::read_write(),
            allowed_paths: Vec::new(),
            is_temp: true,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn with_permissions(mut self, permissions: WorkspacePermissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_allowed_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.allowed_paths = paths
            .into_iter()
            .map(|p| p.canonicalize().unwrap_or(p))
            .collect();
        self
    }

    /// All roots a path may resolve under: the workspace plus `allowed_paths`.
    pub fn containment_roots(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.root.as_path()).chain(self.allowed_paths.iter().map(PathBuf::as_path))
    }
}
