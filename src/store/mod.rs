pub mod db;
pub mod settings;

pub use db::{
    Approval, ApprovalStatus, Artifact, EventKind, Task, TaskBudget, TaskDb, TaskEvent, TaskStatus,
};
pub use settings::SettingsStore;
