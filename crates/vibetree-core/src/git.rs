//! `git` / `gh` operations against a repository or a task worktree.
//!
//! Everything runs through [`tokio::process::Command`] with an argv array,
//! never a shell. Branch names are checked by [`sanitize_branch_name`]
//! before any subprocess is spawned.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::worktree::TaskCheckout;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("invalid branch name: {0:?}")]
    InvalidBranch(String),
    #[error("directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("HEAD is detached, no branch to push")]
    DetachedHead,
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },
    /// The remote has commits the local branch lacks.
    #[error("push rejected: {0}")]
    PushRejected(String),
    #[error("push failed: {0}")]
    PushFailed(String),
}

#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args...` in `dir` and capture its output without judging the exit status.
pub(crate) async fn run(program: &str, dir: &Path, args: &[&str]) -> Result<CommandOutput, GitError> {
    debug!(program, ?args, dir = %dir.display(), "running");
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| GitError::Spawn {
            program: program.to_string(),
            source,
        })?;
    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a program and return its trimmed stdout, failing on a non-zero exit.
pub(crate) async fn checked(program: &str, dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let out = run(program, dir, args).await?;
    if out.success {
        Ok(out.stdout.trim().to_string())
    } else {
        let message = if out.stderr.trim().is_empty() {
            out.stdout.trim().to_string()
        } else {
            out.stderr.trim().to_string()
        };
        Err(GitError::Command {
            command: format!("{program} {}", args.first().copied().unwrap_or_default()),
            message,
        })
    }
}

pub(crate) async fn git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    checked("git", dir, args).await
}

/// Accept only `[A-Za-z0-9/_.-]`, rejecting `..`, a leading `.` or `/`, and the empty name.
pub fn sanitize_branch_name(name: &str) -> Result<&str, GitError> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-');
    if name.is_empty()
        || name.contains("..")
        || name.starts_with('.')
        || name.starts_with('/')
        || !name.chars().all(allowed)
    {
        return Err(GitError::InvalidBranch(name.to_string()));
    }
    Ok(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitStatus {
    pub branch: String,
    pub status: String,
}

pub async fn status(checkout: &TaskCheckout) -> Result<GitStatus, GitError> {
    let dir = checkout.working_dir()?;
    let branch = git(&dir, &["branch", "--show-current"]).await?;
    let status = git(&dir, &["status", "--short"]).await?;
    Ok(GitStatus { branch, status })
}

pub async fn diff(checkout: &TaskCheckout) -> Result<String, GitError> {
    let dir = checkout.working_dir()?;
    git(&dir, &["diff"]).await
}

/// Stage everything and commit. Fails when there is nothing to commit.
pub async fn commit(checkout: &TaskCheckout, message: &str) -> Result<(), GitError> {
    let dir = checkout.working_dir()?;
    git(&dir, &["add", "."]).await?;
    git(&dir, &["commit", "-m", message]).await?;
    Ok(())
}

async fn is_dirty(dir: &Path) -> Result<bool, GitError> {
    Ok(!git(dir, &["status", "--porcelain"]).await?.is_empty())
}

/// `git add .`, then commit only if something is staged. Returns whether a commit was made.
async fn stage_and_commit(dir: &Path, message: &str) -> Result<bool, GitError> {
    git(dir, &["add", "."]).await?;
    if !is_dirty(dir).await? {
        return Ok(false);
    }
    let message = if message.trim().is_empty() {
        "Update"
    } else {
        message
    };
    git(dir, &["commit", "-m", message]).await?;
    Ok(true)
}

async fn current_branch(dir: &Path) -> Result<String, GitError> {
    let branch = git(dir, &["branch", "--show-current"]).await?;
    if branch.is_empty() {
        return Err(GitError::DetachedHead);
    }
    sanitize_branch_name(&branch)?;
    Ok(branch)
}

pub async fn rebase(checkout: &TaskCheckout, base_branch: &str) -> Result<(), GitError> {
    let base = sanitize_branch_name(base_branch)?;
    let dir = checkout.working_dir()?;
    git(&dir, &["rebase", base]).await?;
    info!(task_id = ?checkout.task_id, base, "rebased");
    Ok(())
}

/// Decide between a divergence rejection and any other push failure.
///
/// `--porcelain` marks rejected refs with a leading `!`; older or localized
/// gits are caught by the stderr text.
pub fn classify_push_failure(stdout: &str, stderr: &str) -> GitError {
    let porcelain_rejected = stdout.lines().any(|l| l.starts_with('!'));
    let lower = stderr.to_lowercase();
    let text_rejected = ["rejected", "non-fast-forward", "fetch first"]
        .iter()
        .any(|needle| lower.contains(needle));
    let message = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    if porcelain_rejected || text_rejected {
        GitError::PushRejected(message)
    } else {
        GitError::PushFailed(message)
    }
}

async fn push_current_branch(dir: &Path, force: bool) -> Result<String, GitError> {
    let branch = current_branch(dir).await?;
    let out = {
        let mut args = vec!["push", "--porcelain"];
        if force {
            args.push("--force");
        }
        args.extend(["-u", "origin", branch.as_str()]);
        run("git", dir, &args).await?
    };
    if !out.success {
        return Err(classify_push_failure(&out.stdout, &out.stderr));
    }
    info!(branch = %branch, force, "pushed");
    Ok(branch)
}

async fn push_with(checkout: &TaskCheckout, message: &str, force: bool) -> Result<(), GitError> {
    let dir = checkout.working_dir()?;
    stage_and_commit(&dir, message).await?;
    push_current_branch(&dir, force).await?;
    Ok(())
}

pub async fn push_branch(checkout: &TaskCheckout, commit_message: &str) -> Result<(), GitError> {
    push_with(checkout, commit_message, false).await
}

pub async fn push_branch_force(checkout: &TaskCheckout, commit_message: &str) -> Result<(), GitError> {
    push_with(checkout, commit_message, true).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrRequest {
    pub title: String,
    pub body: Option<String>,
    pub base_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrSummary {
    pub title: String,
    pub body: String,
}

fn last_non_empty_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .map(str::to_string)
}

/// Commit, push and open a pull request. Returns the PR URL printed by `gh`.
pub async fn create_pr(checkout: &TaskCheckout, pr: &PrRequest) -> Result<Option<String>, GitError> {
    let base = sanitize_branch_name(&pr.base_branch)?;
    let dir = checkout.working_dir()?;
    stage_and_commit(&dir, &pr.title).await?;
    let head = push_current_branch(&dir, false).await?;
    let body = pr.body.as_deref().unwrap_or_default();
    let out = checked(
        "gh",
        &dir,
        &[
            "pr", "create", "--base", base, "--head", &head, "--title", &pr.title, "--body", body,
        ],
    )
    .await?;
    let url = last_non_empty_line(&out);
    info!(task_id = ?checkout.task_id, url = ?url, "pull request created");
    Ok(url)
}

pub async fn update_pr(checkout: &TaskCheckout, summary: &PrSummary) -> Result<(), GitError> {
    let dir = checkout.working_dir()?;
    checked(
        "gh",
        &dir,
        &["pr", "edit", "--title", &summary.title, "--body", &summary.body],
    )
    .await?;
    Ok(())
}

fn parse_symbolic_ref(output: &str) -> Option<String> {
    output
        .trim()
        .strip_prefix("refs/remotes/origin/")
        .filter(|b| sanitize_branch_name(b).is_ok())
        .map(str::to_string)
}

fn parse_remote_show(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("HEAD branch:"))
        .map(str::trim)
        .filter(|b| sanitize_branch_name(b).is_ok())
        .map(str::to_string)
}

async fn origin_head(repo_path: &Path) -> Option<String> {
    let out = run("git", repo_path, &["symbolic-ref", "refs/remotes/origin/HEAD"])
        .await
        .ok()?;
    out.success.then(|| parse_symbolic_ref(&out.stdout)).flatten()
}

/// Resolve the remote's default branch, falling back to `main`.
pub async fn get_default_branch(repo_path: &Path) -> String {
    if let Some(branch) = origin_head(repo_path).await {
        return branch;
    }
    if let Ok(out) = run("git", repo_path, &["remote", "set-head", "origin", "--auto"]).await {
        if out.success {
            if let Some(branch) = origin_head(repo_path).await {
                return branch;
            }
        }
    }
    if let Ok(out) = run("git", repo_path, &["remote", "show", "origin"]).await {
        if out.success {
            if let Some(branch) = parse_remote_show(&out.stdout) {
                return branch;
            }
        }
    }
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOutcome {
    pub message: String,
}

/// Bring the local default branch up to date without touching an unrelated checkout.
pub async fn pull_main_branch(repo_path: &Path) -> Result<PullOutcome, GitError> {
    let dir = TaskCheckout::repo(repo_path).working_dir()?;
    let default_branch = get_default_branch(&dir).await;
    git(&dir, &["fetch", "origin"]).await?;
    let current = git(&dir, &["branch", "--show-current"]).await?;
    if current == default_branch {
        git(&dir, &["pull", "origin", &default_branch]).await?;
        info!(branch = %default_branch, "pulled default branch");
        Ok(PullOutcome {
            message: format!("Pulled latest changes into {default_branch}"),
        })
    } else {
        let refspec = format!("{default_branch}:{default_branch}");
        git(&dir, &["fetch", "origin", &refspec]).await?;
        info!(branch = %default_branch, "fast-forwarded local ref");
        Ok(PullOutcome {
            message: format!("Updated local {default_branch} from origin"),
        })
    }
}

/// Best effort: any failure reads as "not merged".
pub async fn check_pr_merge_status(repo_path: &Path, pr_url: &str) -> bool {
    match checked(
        "gh",
        repo_path,
        &["pr", "view", pr_url, "--json", "state", "--jq", ".state"],
    )
    .await
    {
        Ok(state) => state.trim().eq_ignore_ascii_case("merged"),
        Err(e) => {
            warn!(pr_url, error = %e, "merge status check failed");
            false
        }
    }
}

/// Uncommitted changes, or at least one commit ahead of `base_branch`.
pub async fn has_changes_for_pr(checkout: &TaskCheckout, base_branch: &str) -> Result<bool, GitError> {
    let base = sanitize_branch_name(base_branch)?;
    let dir = checkout.working_dir()?;
    if is_dirty(&dir).await? {
        return Ok(true);
    }
    let range = format!("{base}..HEAD");
    let ahead = git(&dir, &["rev-list", "--count", &range]).await?;
    Ok(ahead.parse::<u64>().unwrap_or(0) > 0)
}

/// `git diff <base>...HEAD`: what the branch changed since it forked.
pub async fn branch_diff(checkout: &TaskCheckout, base_branch: &str) -> Result<String, GitError> {
    let base = sanitize_branch_name(base_branch)?;
    let dir = checkout.working_dir()?;
    let range = format!("{base}...HEAD");
    git(&dir, &["diff", &range]).await
}
