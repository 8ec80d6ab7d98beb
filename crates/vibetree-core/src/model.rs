//! Repository and task records shared by the store, the daemon and the wire protocol.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Title used when a task is created with a blank title.
pub const DEFAULT_TASK_TITLE: &str = "New Task";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub path: String,
    /// Newline-separated list of files (repo-relative or absolute) copied into each worktree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_files: Option<String>,
    /// Base directory for worktrees, replacing `<repo>/.vibetree/worktrees`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_tool: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_files: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_tool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub repository_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub branch_name: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_merged: Option<bool>,
}

impl Task {
    /// Build a fresh task for `repository_id` with a generated id, branch and timestamp.
    pub fn new(repository_id: &str, title: &str, description: &str) -> Self {
        let now = Utc::now();
        let title = title.trim();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            repository_id: repository_id.to_string(),
            title: if title.is_empty() {
                DEFAULT_TASK_TITLE.to_string()
            } else {
                title.to_string()
            },
            description: description.to_string(),
            branch_name: task_branch_name(now.timestamp_millis()),
            created_at: now.to_rfc3339(),
            pr_url: None,
            pr_merged: None,
        }
    }

    /// Environment injected into the task's shell.
    pub fn shell_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("TASK_ID", self.id.clone()),
            ("TASK_TITLE", self.title.clone()),
            ("TASK_DESCRIPTION", self.description.clone()),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_merged: Option<bool>,
}

/// `feature/task-<millis>`
pub fn task_branch_name(timestamp_millis: i64) -> String {
    format!("feature/task-{timestamp_millis}")
}

/// Strip trailing path separators. The root path `/` collapses to an empty string.
pub fn normalize_path(path: &str) -> String {
    path.trim_end_matches(['/', '\\']).to_string()
}
