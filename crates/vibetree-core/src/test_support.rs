use std::path::{Path, PathBuf};
use std::process::Command;

/// Run git in `dir`, panic on failure, return trimmed stdout.
pub(crate) fn git_output(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Create a throwaway git repo with one empty commit. The repo is removed
/// when the returned `TempDir` is dropped.
pub(crate) fn make_temp_repo() -> (tempfile::TempDir, PathBuf) {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let repo = tmp.path().join("testrepo");
    std::fs::create_dir(&repo).expect("create repo dir");
    git_output(&repo, &["init"]);
    // No global git config in CI.
    git_output(&repo, &["config", "user.email", "test@test"]);
    git_output(&repo, &["config", "user.name", "test"]);
    git_output(&repo, &["commit", "--allow-empty", "-m", "init"]);
    (tmp, repo)
}
