//! IPC protocol message types for daemon <-> client communication.
//!
//! Terminal traffic mirrors the realtime channel of the web UI:
//! `terminal:create` is [`ClientRequest::TerminalCreate`], `terminal:input:<id>` is
//! [`ClientRequest::TerminalInput`], `terminal:resize:<id>` is
//! [`ClientRequest::TerminalResize`]; the daemon answers with
//! [`DaemonEvent::TerminalData`], [`DaemonEvent::TerminalReconnect`] and
//! [`DaemonEvent::TerminalError`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::model::{Repository, RepositoryPatch, Task};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientRequest {
    // Terminal channel
    TerminalCreate {
        cols: u16,
        rows: u16,
        task_id: Option<String>,
        repo_path: String,
    },
    TerminalInput {
        task_id: String,
        data: String,
    },
    TerminalResize {
        task_id: String,
        cols: u16,
        rows: u16,
    },
    // Config
    GetConfig,
    UpdateConfig {
        repo_path: Option<String>,
        ai_tool: Option<String>,
        copy_files: Option<String>,
    },
    // Repositories
    ListRepositories,
    AddRepository {
        path: String,
        copy_files: Option<String>,
    },
    UpdateRepository {
        id: String,
        patch: RepositoryPatch,
    },
    DeleteRepository {
        id: String,
    },
    // Tasks
    ListTasks {
        repo_path: String,
    },
    CreateTask {
        repo_path: String,
        title: String,
        description: Option<String>,
    },
    UpdateTask {
        task_id: String,
        title: Option<String>,
        description: Option<String>,
    },
    DeleteTask {
        repo_path: String,
        task_id: String,
    },
    // Git
    GitStatus {
        repo_path: String,
        task_id: Option<String>,
    },
    GitDiff {
        repo_path: String,
        task_id: Option<String>,
    },
    GitCommit {
        repo_path: String,
        task_id: Option<String>,
        message: String,
    },
    WorktreePath {
        repo_path: String,
        task_id: String,
    },
    Rebase {
        repo_path: String,
        task_id: String,
        base_branch: String,
    },
    Push {
        repo_path: String,
        task_id: String,
        commit_message: String,
    },
    ForcePush {
        repo_path: String,
        task_id: String,
        commit_message: String,
    },
    CreatePr {
        repo_path: String,
        task_id: String,
        title: String,
        body: Option<String>,
        base_branch: String,
    },
    SyncPrWithAi {
        repo_path: String,
        task_id: String,
    },
    DefaultBranch {
        repo_path: String,
    },
    PullMainBranch {
        repo_path: String,
    },
    CheckPrMergeStatus {
        repo_path: String,
        task_id: String,
    },
    HasChangesForPr {
        repo_path: String,
        task_id: String,
    },
    // Host helpers
    OpenDirectory {
        path: String,
    },
    PickFolder,
    DetectAiTools,
    CheckVsCode,
    OpenVsCode {
        path: String,
    },
    // Session
    GetState,
    Subscribe,
    Unsubscribe,
    Ping,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Git,
    /// The remote has diverged; the client may offer a force push.
    PushRejected,
    Io,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonEvent {
    // Terminal channel
    TerminalData {
        task_id: String,
        data: Vec<u8>,
    },
    /// One-shot replay of the buffered backlog sent right after attaching.
    TerminalReconnect {
        task_id: String,
        data: Vec<u8>,
    },
    TerminalError {
        task_id: Option<String>,
        message: String,
    },
    /// Another client took over this terminal.
    TerminalDetached {
        task_id: String,
    },
    TerminalExited {
        task_id: String,
    },
    // Replies
    Config(AppConfig),
    RepositoryList {
        repositories: Vec<Repository>,
    },
    RepositorySaved {
        repository: Repository,
    },
    RepositoryDeleted {
        id: String,
    },
    TaskList {
        tasks: Vec<Task>,
    },
    TaskCreated {
        task: Task,
    },
    TaskUpdated {
        task: Task,
    },
    TaskDeleted {
        task_id: String,
    },
    GitStatus {
        branch: String,
        status: String,
    },
    GitDiff {
        diff: String,
    },
    WorktreePath {
        path: String,
    },
    PrCreated {
        url: Option<String>,
    },
    DefaultBranch {
        branch: String,
    },
    PrMergeStatus {
        merged: bool,
    },
    HasChanges {
        has_changes: bool,
    },
    FolderPicked {
        path: Option<String>,
    },
    AiTools {
        tools: BTreeMap<String, bool>,
    },
    VsCodeStatus {
        installed: bool,
    },
    StateSnapshot(DaemonState),
    /// Generic success reply, optionally with a human-readable message.
    Done {
        message: Option<String>,
    },
    // Broadcasts to subscribed clients
    TaskChanged {
        task: Task,
    },
    TaskRemoved {
        task_id: String,
    },
    TaskProvisioned {
        task_id: String,
        worktree_path: String,
    },
    TaskProvisionFailed {
        task_id: String,
        error: String,
    },
    AiRunFinished {
        task_id: String,
        error: Option<String>,
    },
    Subscribed,
    Unsubscribed,
    Pong,
    Error {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub task_id: String,
    pub attached: bool,
    pub buffered_chunks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub repositories: Vec<Repository>,
    pub tasks: Vec<Task>,
    pub terminals: Vec<TerminalInfo>,
    pub protocol_version: u32,
}
