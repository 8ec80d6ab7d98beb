//! Desktop helpers run on the daemon's host: file manager, folder picker,
//! AI CLI detection and VS Code.

use std::collections::BTreeMap;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::info;

/// AI CLIs offered in the tool picker.
pub const KNOWN_AI_TOOLS: [&str; 3] = ["claude", "codex", "gemini"];

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Failed(String),
}

/// Common install locations searched before `PATH`.
fn search_dirs() -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"]
        .iter()
        .map(PathBuf::from)
        .collect();
    if let Some(home) = dirs::home_dir() {
        found.push(home.join(".local/bin"));
        found.push(home.join("bin"));
    }
    if let Some(path) = env::var_os("PATH") {
        found.extend(env::split_paths(&path));
    }
    found
}

fn find_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let file_name = if cfg!(windows) {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    };
    dirs.iter()
        .map(|d| d.join(&file_name))
        .find(|candidate| candidate.is_file())
}

pub fn find_binary(binary: &str) -> Option<PathBuf> {
    find_in_dirs(binary, &search_dirs())
}

pub fn detect_ai_tools() -> BTreeMap<String, bool> {
    let dirs = search_dirs();
    KNOWN_AI_TOOLS
        .iter()
        .map(|tool| (tool.to_string(), find_in_dirs(tool, &dirs).is_some()))
        .collect()
}

pub fn vscode_installed() -> bool {
    find_binary("code").is_some()
}

async fn run_checked(program: &str, args: &[&str]) -> Result<String, HostError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| HostError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(HostError::Failed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Reveal a directory in the platform file manager.
pub async fn open_directory(path: &Path) -> Result<(), HostError> {
    let target = path.to_string_lossy().into_owned();
    let target = target.as_str();
    if cfg!(target_os = "macos") {
        run_checked("open", &[target]).await?;
    } else if cfg!(windows) {
        run_checked("cmd", &["/c", "start", "", target]).await?;
    } else {
        run_checked("xdg-open", &[target]).await?;
    }
    Ok(())
}

/// Native folder dialog. `None` when the user cancels.
pub async fn pick_folder() -> Result<Option<String>, HostError> {
    let picked = if cfg!(target_os = "macos") {
        run_checked(
            "osascript",
            &[
                "-e",
                "POSIX path of (choose folder with prompt \"Select a Git Repository\")",
            ],
        )
        .await?
    } else if cfg!(windows) {
        run_checked(
            "powershell",
            &[
                "-Command",
                "Add-Type -AssemblyName System.Windows.Forms; $f = New-Object System.Windows.Forms.FolderBrowserDialog; $f.ShowDialog() | Out-Null; $f.SelectedPath",
            ],
        )
        .await?
    } else {
        return Err(HostError::Unsupported("directory picker"));
    };
    Ok(Some(picked).filter(|p| !p.is_empty()))
}

/// Launch VS Code on `path` without waiting for it.
pub fn open_in_vscode(path: &Path) -> Result<(), HostError> {
    let (program, mut args): (&str, Vec<&std::ffi::OsStr>) = if cfg!(windows) {
        ("cmd", vec!["/c".as_ref(), "code".as_ref()])
    } else {
        ("code", Vec::new())
    };
    args.push(path.as_os_str());
    Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| HostError::Spawn {
            program: program.to_string(),
            source,
        })?;
    info!(path = %path.display(), "opened VS Code");
    Ok(())
}
