//! Path helpers and file I/O for the daemon configuration.

use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Output chunks kept per terminal for reconnect replay.
pub const DEFAULT_BUFFER_CHUNKS: usize = 1000;

/// Delay before the AI command is typed into a fresh shell.
pub const DEFAULT_AI_SETTLE_DELAY_MS: u64 = 800;

pub const DEFAULT_AI_TOOL: &str = "claude";

/// Base data directory: `~/.local/share/vibetree/`
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("vibetree"))
}

/// Path to the config file: `~/.config/vibetree/config.toml`
pub fn config_path() -> Option<PathBuf> {
    let config_dir = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| {
            env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })?;
    Some(config_dir.join("vibetree").join("config.toml"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Active repository.
    #[serde(default)]
    pub repo_path: String,
    #[serde(default = "default_ai_tool")]
    pub ai_tool: String,
    /// Default copy-files list for repositories without their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_files: Option<String>,
    #[serde(default)]
    pub terminal: TerminalSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: usize,
    #[serde(default = "default_settle_delay")]
    pub ai_settle_delay_ms: u64,
}

fn default_ai_tool() -> String {
    DEFAULT_AI_TOOL.to_string()
}

fn default_buffer_chunks() -> usize {
    DEFAULT_BUFFER_CHUNKS
}

fn default_settle_delay() -> u64 {
    DEFAULT_AI_SETTLE_DELAY_MS
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            shell: None,
            buffer_chunks: DEFAULT_BUFFER_CHUNKS,
            ai_settle_delay_ms: DEFAULT_AI_SETTLE_DELAY_MS,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            repo_path: String::new(),
            ai_tool: default_ai_tool(),
            copy_files: None,
            terminal: TerminalSettings::default(),
        }
    }
}

impl AppConfig {
    /// Shell spawned for task terminals: config override, else `zsh` / `powershell.exe`.
    pub fn shell(&self) -> String {
        match self.terminal.shell.as_deref().map(str::trim) {
            Some(shell) if !shell.is_empty() => shell.to_string(),
            _ => default_shell().to_string(),
        }
    }

    /// Apply `REPO_PATH` / `AI_TOOL` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(repo) = env::var("REPO_PATH") {
            if !repo.is_empty() {
                self.repo_path = crate::model::normalize_path(&repo);
            }
        }
        if let Ok(tool) = env::var("AI_TOOL") {
            if !tool.is_empty() {
                self.ai_tool = tool;
            }
        }
        self
    }
}

pub fn default_shell() -> &'static str {
    if cfg!(windows) {
        "powershell.exe"
    } else {
        "zsh"
    }
}

/// Parse config text. Garbled files fall back to defaults.
pub fn parse_config(content: &str) -> AppConfig {
    match toml::from_str::<AppConfig>(content) {
        Ok(mut config) => {
            config.repo_path = crate::model::normalize_path(&config.repo_path);
            if config.terminal.buffer_chunks == 0 {
                config.terminal.buffer_chunks = DEFAULT_BUFFER_CHUNKS;
            }
            config
        }
        Err(e) => {
            tracing::warn!(error = %e, "invalid config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Load the config file with env overrides applied. Returns defaults if the file is missing.
pub fn load_config() -> AppConfig {
    let config = match config_path().map(fs::read_to_string) {
        Some(Ok(content)) => parse_config(&content),
        _ => AppConfig::default(),
    };
    config.with_env_overrides()
}

/// Save the config file, creating parent dirs as needed.
pub fn save_config(config: &AppConfig) -> io::Result<PathBuf> {
    let path = config_path()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "cannot determine config path"))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config).map_err(io::Error::other)?;
    fs::write(&path, content)?;
    Ok(path)
}
