use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::git::{self, sanitize_branch_name, GitError};

/// Default worktree base, relative to the repository root.
pub const DEFAULT_WORKTREE_DIR: &str = ".vibetree/worktrees";

/// Directory holding all task worktrees of a repository.
pub fn worktree_base(repo_path: &Path, base_override: Option<&str>) -> PathBuf {
    match base_override.map(str::trim) {
        Some(base) if !base.is_empty() => PathBuf::from(base),
        _ => repo_path.join(DEFAULT_WORKTREE_DIR),
    }
}

/// `<worktreeBase>/<taskId>`
pub fn task_worktree_path(repo_path: &Path, task_id: &str, base_override: Option<&str>) -> PathBuf {
    worktree_base(repo_path, base_override).join(task_id)
}

/// Where a git operation runs: the repository itself, or one task's worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCheckout {
    pub repo_path: PathBuf,
    pub task_id: Option<String>,
    pub worktree_base: Option<String>,
}

impl TaskCheckout {
    pub fn repo(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            task_id: None,
            worktree_base: None,
        }
    }

    pub fn task(
        repo_path: impl Into<PathBuf>,
        task_id: impl Into<String>,
        worktree_base: Option<String>,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            task_id: Some(task_id.into()),
            worktree_base,
        }
    }

    pub fn worktree_path(&self) -> Option<PathBuf> {
        self.task_id.as_deref().map(|id| {
            task_worktree_path(&self.repo_path, id, self.worktree_base.as_deref())
        })
    }

    /// Effective working directory. A task checkout requires its worktree on disk.
    pub fn working_dir(&self) -> Result<PathBuf, GitError> {
        let dir = self
            .worktree_path()
            .unwrap_or_else(|| self.repo_path.clone());
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(GitError::MissingDirectory(dir))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeOutcome {
    pub path: PathBuf,
    /// Set when nothing had to be created.
    pub message: Option<String>,
}

/// Create the worktree for a task on `branch`, creating the branch if needed.
/// Idempotent: an existing worktree directory is reported, not recreated.
pub async fn create_worktree(
    repo_path: &Path,
    task_id: &str,
    branch: &str,
    copy_files: Option<&str>,
    base_override: Option<&str>,
) -> Result<WorktreeOutcome, GitError> {
    let branch = sanitize_branch_name(branch)?;
    let wt_path = task_worktree_path(repo_path, task_id, base_override);

    if wt_path.exists() {
        return Ok(WorktreeOutcome {
            path: wt_path,
            message: Some("Worktree already exists".to_string()),
        });
    }

    let branch_exists = git::run("git", repo_path, &["rev-parse", "--verify", branch])
        .await?
        .success;
    let wt_arg = wt_path.to_string_lossy().into_owned();
    let args: Vec<&str> = if branch_exists {
        vec!["worktree", "add", wt_arg.as_str(), branch]
    } else {
        vec!["worktree", "add", "-b", branch, wt_arg.as_str()]
    };
    git::git(repo_path, &args).await?;
    info!(task_id, path = %wt_path.display(), branch, "worktree created");

    if let Some(list) = copy_files {
        copy_into_worktree(repo_path, &wt_path, list).await;
    }

    Ok(WorktreeOutcome {
        path: wt_path,
        message: None,
    })
}

/// Copy each newline-separated entry (absolute or repo-relative) into the
/// worktree root by basename. Missing entries and directories are skipped.
async fn copy_into_worktree(repo_path: &Path, wt_path: &Path, list: &str) {
    for entry in list.lines().map(str::trim).filter(|e| !e.is_empty()) {
        let src = if Path::new(entry).is_absolute() {
            PathBuf::from(entry)
        } else {
            repo_path.join(entry)
        };
        let Some(name) = src.file_name() else {
            warn!(entry, "copy skipped (no file name)");
            continue;
        };
        match tokio::fs::metadata(&src).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                warn!(path = %src.display(), "copy skipped (not a file)");
                continue;
            }
            Err(_) => {
                warn!(path = %src.display(), "copy skipped (not found)");
                continue;
            }
        }
        let dest = wt_path.join(name);
        match tokio::fs::copy(&src, &dest).await {
            Ok(_) => info!(file = %name.to_string_lossy(), "copied into worktree"),
            Err(e) => warn!(path = %src.display(), error = %e, "copy into worktree failed"),
        }
    }
}

/// Remove a task's worktree (no-op when absent), then best-effort delete its branch.
pub async fn remove_worktree(
    repo_path: &Path,
    task_id: &str,
    branch: Option<&str>,
    base_override: Option<&str>,
) -> Result<(), GitError> {
    let wt_path = task_worktree_path(repo_path, task_id, base_override);
    if wt_path.exists() {
        let wt_arg = wt_path.to_string_lossy().into_owned();
        git::git(repo_path, &["worktree", "remove", "--force", wt_arg.as_str()]).await?;
        info!(task_id, path = %wt_path.display(), "worktree removed");
    }

    if let Some(branch) = branch {
        match sanitize_branch_name(branch) {
            Ok(branch) => match git::git(repo_path, &["branch", "-D", branch]).await {
                Ok(_) => info!(branch, "branch deleted"),
                Err(e) => warn!(branch, error = %e, "failed to delete branch"),
            },
            Err(e) => warn!(error = %e, "not deleting branch"),
        }
    }
    Ok(())
}
