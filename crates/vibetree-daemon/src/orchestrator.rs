use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vibetree_core::ai::{self, AiError};
use vibetree_core::config::{self, AppConfig};
use vibetree_core::git::{self, GitError, PrRequest};
use vibetree_core::host::{self, HostError};
use vibetree_core::model::{normalize_path, Repository, RepositoryPatch, TaskPatch};
use vibetree_core::protocol::{
    ClientRequest, DaemonEvent, DaemonState, ErrorKind, PROTOCOL_VERSION,
};
use vibetree_core::store::{Store, StoreError};
use vibetree_core::worktree::{self, TaskCheckout};

use crate::session::SessionManager;
use crate::terminal::{OpenRequest, PtySpawner, TerminalManager};
use crate::worker::WorkerMessage;

/// Errors that can be turned into an `Error` reply.
trait ReplyKind: std::fmt::Display {
    fn kind(&self) -> ErrorKind;
}

impl ReplyKind for GitError {
    fn kind(&self) -> ErrorKind {
        match self {
            GitError::InvalidBranch(_) => ErrorKind::Validation,
            GitError::MissingDirectory(_) => ErrorKind::NotFound,
            GitError::PushRejected(_) => ErrorKind::PushRejected,
            GitError::Spawn { .. } => ErrorKind::Io,
            GitError::DetachedHead | GitError::Command { .. } | GitError::PushFailed(_) => {
                ErrorKind::Git
            }
        }
    }
}

impl ReplyKind for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::EmptyPath | StoreError::PathInUse(_) => ErrorKind::Validation,
            StoreError::RepositoryNotFound(_) | StoreError::TaskNotFound(_) => ErrorKind::NotFound,
            StoreError::Io { .. } | StoreError::Encode(_) => ErrorKind::Io,
        }
    }
}

impl ReplyKind for HostError {
    fn kind(&self) -> ErrorKind {
        match self {
            HostError::Unsupported(_) => ErrorKind::Unsupported,
            HostError::Spawn { .. } | HostError::Failed(_) => ErrorKind::Io,
        }
    }
}

#[derive(Debug, Error)]
enum SyncError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Ai(#[from] AiError),
}

impl ReplyKind for SyncError {
    fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Git(e) => e.kind(),
            SyncError::Ai(AiError::InvalidTool(_) | AiError::NotConfigured) => ErrorKind::Validation,
            SyncError::Ai(_) => ErrorKind::Io,
        }
    }
}

fn error_event(e: &impl ReplyKind) -> DaemonEvent {
    DaemonEvent::Error {
        kind: e.kind(),
        message: e.to_string(),
    }
}

fn validation(message: impl Into<String>) -> DaemonEvent {
    DaemonEvent::Error {
        kind: ErrorKind::Validation,
        message: message.into(),
    }
}

fn done(message: impl Into<String>) -> DaemonEvent {
    DaemonEvent::Done {
        message: Some(message.into()),
    }
}

fn reply_or_error<E: ReplyKind>(result: Result<DaemonEvent, E>) -> DaemonEvent {
    result.unwrap_or_else(|e| error_event(&e))
}

/// Daemon state owned by the event loop: records, terminals and connected clients.
pub struct Orchestrator {
    pub store: Store,
    pub config: AppConfig,
    pub terminals: TerminalManager,
    pub sessions: SessionManager,
    pub worker_tx: mpsc::Sender<WorkerMessage>,
    pub worker_rx: mpsc::Receiver<WorkerMessage>,
    /// Tasks whose worktree removal is still running; no terminal may start for them.
    deleting: HashSet<String>,
    save_config: bool,
}

impl Orchestrator {
    pub fn new(config: AppConfig, store: Store, spawner: Box<dyn PtySpawner>) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel(4096);
        let terminals = TerminalManager::new(spawner, worker_tx.clone(), &config);
        Self {
            store,
            config,
            terminals,
            sessions: SessionManager::new(),
            worker_tx,
            worker_rx,
            deleting: HashSet::new(),
            save_config: true,
        }
    }

    /// In-memory store, no config writes, no AI settle delay.
    #[cfg(test)]
    pub fn new_for_test(spawner: Box<dyn PtySpawner>) -> Self {
        let mut config = AppConfig::default();
        config.terminal.shell = Some("sh".into());
        config.terminal.ai_settle_delay_ms = 0;
        let mut orch = Self::new(config, Store::in_memory(), spawner);
        orch.save_config = false;
        orch
    }

    fn reply(&mut self, session_id: usize, event: DaemonEvent) {
        self.sessions.send_to(session_id, event);
    }

    /// Run `fut` off the event loop and send its result to `session_id`.
    fn spawn_reply<F>(&self, session_id: usize, fut: F)
    where
        F: Future<Output = DaemonEvent> + Send + 'static,
    {
        let tx = self.worker_tx.clone();
        tokio::spawn(async move {
            let event = fut.await;
            let _ = tx.send(WorkerMessage::Reply { session_id, event }).await;
        });
    }

    /// Where git runs for a request: the task worktree when a task is named, else the repository.
    fn checkout(&self, repo_path: &str, task_id: Option<&str>) -> TaskCheckout {
        let repo_path = normalize_path(repo_path);
        let base = self
            .store
            .repository_by_path(&repo_path)
            .and_then(|r| r.worktree_path.clone());
        match task_id.filter(|id| !id.is_empty()) {
            Some(id) => TaskCheckout::task(repo_path, id, base),
            None => TaskCheckout::repo(repo_path),
        }
    }

    fn ai_tool_for(&self, repo: Option<&Repository>) -> String {
        repo.and_then(|r| r.ai_tool.clone())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.config.ai_tool.clone())
    }

    pub fn to_daemon_state(&self) -> DaemonState {
        DaemonState {
            repositories: self.store.repositories().to_vec(),
            tasks: self.store.tasks(None),
            terminals: self.terminals.infos(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Spawn terminals for every persisted task whose worktree is still on disk.
    pub fn restore_terminals(&mut self) {
        let mut restored = 0;
        for task in self.store.tasks(None) {
            let Some(repo) = self.store.repository(&task.repository_id).cloned() else {
                continue;
            };
            match self.terminals.ensure_for_task(&task, &repo) {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "terminal restore failed"),
            }
        }
        info!(restored, "terminals restored");
    }

    /// A client went away: stop routing to it and release its terminals.
    pub fn client_disconnected(&mut self, session_id: usize) {
        self.sessions.remove_session(session_id);
        self.terminals.detach_client(session_id);
    }

    pub fn shutdown(&mut self) {
        self.terminals.shutdown_all();
    }

    // ── Requests ──

    pub fn handle_request(&mut self, req: ClientRequest, session_id: usize) {
        match req {
            ClientRequest::TerminalCreate {
                cols,
                rows,
                task_id,
                repo_path,
            } => {
                if let Some(id) = task_id.as_deref().filter(|id| self.deleting.contains(*id)) {
                    self.reply(
                        session_id,
                        DaemonEvent::TerminalError {
                            task_id: Some(id.to_string()),
                            message: "Task is being deleted".to_string(),
                        },
                    );
                    return;
                }
                let task = task_id
                    .as_deref()
                    .and_then(|id| self.store.task(id))
                    .cloned();
                let repo = task
                    .as_ref()
                    .and_then(|t| self.store.repository(&t.repository_id))
                    .or_else(|| self.store.repository_by_path(&repo_path))
                    .cloned();
                // A known task always opens against its own repository.
                let repo_path = match (&task, &repo) {
                    (Some(_), Some(repo)) if !repo_path.trim().is_empty() => repo.path.clone(),
                    _ => repo_path,
                };
                self.terminals.open_for_client(
                    session_id,
                    OpenRequest {
                        cols,
                        rows,
                        task_id,
                        repo_path,
                    },
                    task.as_ref(),
                    repo.as_ref(),
                    &mut self.sessions,
                );
            }
            ClientRequest::TerminalInput { task_id, data } => {
                self.terminals.input(session_id, &task_id, data.as_bytes());
            }
            ClientRequest::TerminalResize {
                task_id,
                cols,
                rows,
            } => {
                self.terminals.resize(session_id, &task_id, cols, rows);
            }

            ClientRequest::GetConfig => {
                let event = DaemonEvent::Config(self.config.clone());
                self.reply(session_id, event);
            }
            ClientRequest::UpdateConfig {
                repo_path,
                ai_tool,
                copy_files,
            } => {
                let event = self.update_config(repo_path, ai_tool, copy_files);
                self.reply(session_id, event);
            }

            ClientRequest::ListRepositories => {
                let repositories = self.store.repositories().to_vec();
                self.reply(session_id, DaemonEvent::RepositoryList { repositories });
            }
            ClientRequest::AddRepository { path, copy_files } => {
                let event = if !Path::new(&path).exists() {
                    validation("Path does not exist")
                } else {
                    reply_or_error(
                        self.store
                            .add_repository(&path, copy_files)
                            .map(|repository| DaemonEvent::RepositorySaved { repository }),
                    )
                };
                self.reply(session_id, event);
            }
            ClientRequest::UpdateRepository { id, patch } => {
                let event = match patch.ai_tool.as_deref().map(str::trim) {
                    Some(tool) if !tool.is_empty() && ai::validate_tool_name(tool).is_err() => {
                        validation(format!("invalid AI tool name: {tool:?}"))
                    }
                    _ => reply_or_error(
                        self.store
                            .update_repository(&id, patch)
                            .map(|repository| DaemonEvent::RepositorySaved { repository }),
                    ),
                };
                self.reply(session_id, event);
            }
            ClientRequest::DeleteRepository { id } => self.delete_repository(session_id, &id),

            ClientRequest::ListTasks { repo_path } => {
                let tasks = match self.store.repository_by_path(&repo_path) {
                    Some(repo) => self.store.tasks(Some(&repo.id)),
                    None => Vec::new(),
                };
                self.reply(session_id, DaemonEvent::TaskList { tasks });
            }
            ClientRequest::CreateTask {
                repo_path,
                title,
                description,
            } => self.create_task(session_id, &repo_path, &title, description.as_deref()),
            ClientRequest::UpdateTask {
                task_id,
                title,
                description,
            } => {
                let patch = TaskPatch {
                    title,
                    description,
                    ..TaskPatch::default()
                };
                match self.store.update_task(&task_id, patch) {
                    Ok(task) => {
                        self.reply(session_id, DaemonEvent::TaskUpdated { task: task.clone() });
                        self.sessions.broadcast(&DaemonEvent::TaskChanged { task });
                    }
                    Err(e) => self.reply(session_id, error_event(&e)),
                }
            }
            ClientRequest::DeleteTask { repo_path, task_id } => {
                self.delete_task(session_id, &repo_path, &task_id)
            }

            ClientRequest::GitStatus { repo_path, task_id } => {
                let checkout = self.checkout(&repo_path, task_id.as_deref());
                self.spawn_reply(session_id, async move {
                    reply_or_error(git::status(&checkout).await.map(|s| DaemonEvent::GitStatus {
                        branch: s.branch,
                        status: s.status,
                    }))
                });
            }
            ClientRequest::GitDiff { repo_path, task_id } => {
                let checkout = self.checkout(&repo_path, task_id.as_deref());
                self.spawn_reply(session_id, async move {
                    reply_or_error(git::diff(&checkout).await.map(|diff| DaemonEvent::GitDiff { diff }))
                });
            }
            ClientRequest::GitCommit {
                repo_path,
                task_id,
                message,
            } => {
                let checkout = self.checkout(&repo_path, task_id.as_deref());
                self.spawn_reply(session_id, async move {
                    reply_or_error(git::commit(&checkout, &message).await.map(|()| done("Committed")))
                });
            }
            ClientRequest::WorktreePath { repo_path, task_id } => {
                let checkout = self.checkout(&repo_path, Some(&task_id));
                let path = checkout
                    .worktree_path()
                    .unwrap_or_else(|| checkout.repo_path.clone());
                self.reply(
                    session_id,
                    DaemonEvent::WorktreePath {
                        path: path.to_string_lossy().into_owned(),
                    },
                );
            }
            ClientRequest::Rebase {
                repo_path,
                task_id,
                base_branch,
            } => {
                let checkout = self.checkout(&repo_path, Some(&task_id));
                self.spawn_reply(session_id, async move {
                    reply_or_error(
                        git::rebase(&checkout, &base_branch)
                            .await
                            .map(|()| done(format!("Rebased onto {base_branch}"))),
                    )
                });
            }
            ClientRequest::Push {
                repo_path,
                task_id,
                commit_message,
            } => {
                let checkout = self.checkout(&repo_path, Some(&task_id));
                self.spawn_reply(session_id, async move {
                    reply_or_error(
                        git::push_branch(&checkout, &commit_message)
                            .await
                            .map(|()| done("Pushed")),
                    )
                });
            }
            ClientRequest::ForcePush {
                repo_path,
                task_id,
                commit_message,
            } => {
                let checkout = self.checkout(&repo_path, Some(&task_id));
                self.spawn_reply(session_id, async move {
                    reply_or_error(
                        git::push_branch_force(&checkout, &commit_message)
                            .await
                            .map(|()| done("Force pushed")),
                    )
                });
            }
            ClientRequest::CreatePr {
                repo_path,
                task_id,
                title,
                body,
                base_branch,
            } => {
                let checkout = self.checkout(&repo_path, Some(&task_id));
                let request = PrRequest {
                    title,
                    body,
                    base_branch,
                };
                let tx = self.worker_tx.clone();
                tokio::spawn(async move {
                    let msg = match git::create_pr(&checkout, &request).await {
                        Ok(url) => WorkerMessage::PrCreated {
                            session_id,
                            task_id,
                            url,
                        },
                        Err(e) => WorkerMessage::Reply {
                            session_id,
                            event: error_event(&e),
                        },
                    };
                    let _ = tx.send(msg).await;
                });
            }
            ClientRequest::SyncPrWithAi { repo_path, task_id } => {
                let repo = self.store.repository_by_path(&repo_path).cloned();
                let tool = self.ai_tool_for(repo.as_ref());
                if tool.trim().is_empty() {
                    self.reply(session_id, validation("AI tool not configured"));
                    return;
                }
                let checkout = self.checkout(&repo_path, Some(&task_id));
                self.spawn_reply(session_id, async move {
                    reply_or_error(sync_pr_with_ai(checkout, tool).await)
                });
            }
            ClientRequest::DefaultBranch { repo_path } => {
                let repo_path = PathBuf::from(normalize_path(&repo_path));
                self.spawn_reply(session_id, async move {
                    DaemonEvent::DefaultBranch {
                        branch: git::get_default_branch(&repo_path).await,
                    }
                });
            }
            ClientRequest::PullMainBranch { repo_path } => {
                let repo_path = PathBuf::from(normalize_path(&repo_path));
                self.spawn_reply(session_id, async move {
                    reply_or_error(
                        git::pull_main_branch(&repo_path)
                            .await
                            .map(|outcome| done(outcome.message)),
                    )
                });
            }
            ClientRequest::CheckPrMergeStatus { repo_path, task_id } => {
                let pr_url = self.store.task(&task_id).and_then(|t| t.pr_url.clone());
                let Some(pr_url) = pr_url else {
                    self.reply(session_id, DaemonEvent::PrMergeStatus { merged: false });
                    return;
                };
                let repo_path = PathBuf::from(normalize_path(&repo_path));
                let tx = self.worker_tx.clone();
                tokio::spawn(async move {
                    let merged = git::check_pr_merge_status(&repo_path, &pr_url).await;
                    let _ = tx
                        .send(WorkerMessage::PrMergeStatus {
                            session_id,
                            task_id,
                            merged,
                        })
                        .await;
                });
            }
            ClientRequest::HasChangesForPr { repo_path, task_id } => {
                let checkout = self.checkout(&repo_path, Some(&task_id));
                self.spawn_reply(session_id, async move {
                    let base = git::get_default_branch(&checkout.repo_path).await;
                    reply_or_error(
                        git::has_changes_for_pr(&checkout, &base)
                            .await
                            .map(|has_changes| DaemonEvent::HasChanges { has_changes }),
                    )
                });
            }

            ClientRequest::OpenDirectory { path } => {
                self.spawn_reply(session_id, async move {
                    reply_or_error(
                        host::open_directory(Path::new(&path))
                            .await
                            .map(|()| DaemonEvent::Done { message: None }),
                    )
                });
            }
            ClientRequest::PickFolder => {
                self.spawn_reply(session_id, async move {
                    reply_or_error(
                        host::pick_folder()
                            .await
                            .map(|path| DaemonEvent::FolderPicked { path }),
                    )
                });
            }
            ClientRequest::DetectAiTools => {
                let tools = host::detect_ai_tools();
                self.reply(session_id, DaemonEvent::AiTools { tools });
            }
            ClientRequest::CheckVsCode => {
                let installed = host::vscode_installed();
                self.reply(session_id, DaemonEvent::VsCodeStatus { installed });
            }
            ClientRequest::OpenVsCode { path } => {
                let event = reply_or_error(
                    host::open_in_vscode(Path::new(&path)).map(|()| DaemonEvent::Done { message: None }),
                );
                self.reply(session_id, event);
            }

            ClientRequest::GetState => {
                let state = self.to_daemon_state();
                self.reply(session_id, DaemonEvent::StateSnapshot(state));
            }
            ClientRequest::Subscribe => {
                self.sessions.set_subscribed(session_id, true);
                self.reply(session_id, DaemonEvent::Subscribed);
            }
            ClientRequest::Unsubscribe => {
                self.sessions.set_subscribed(session_id, false);
                self.reply(session_id, DaemonEvent::Unsubscribed);
            }
            ClientRequest::Ping => self.reply(session_id, DaemonEvent::Pong),
            ClientRequest::Shutdown => {
                info!(session_id, "shutdown requested");
                self.reply(session_id, done("Shutting down"));
            }
        }
    }

    fn update_config(
        &mut self,
        repo_path: Option<String>,
        ai_tool: Option<String>,
        copy_files: Option<String>,
    ) -> DaemonEvent {
        let repo_path = repo_path.filter(|p| !p.trim().is_empty());
        if let Some(path) = &repo_path {
            if !Path::new(path).exists() {
                return validation("Path does not exist");
            }
        }
        let ai_tool = ai_tool.map(|t| t.trim().to_string());
        if let Some(tool) = ai_tool.as_deref().filter(|t| !t.is_empty()) {
            if let Err(e) = ai::validate_tool_name(tool) {
                return validation(e.to_string());
            }
        }

        if let Some(path) = repo_path {
            let normalized = normalize_path(&path);
            if let Err(e) = self.store.add_repository(&normalized, None) {
                return error_event(&e);
            }
            self.config.repo_path = normalized;
        }
        if let Some(tool) = ai_tool {
            self.config.ai_tool = tool;
        }
        if let Some(copy_files) = copy_files {
            self.config.copy_files = Some(copy_files.clone()).filter(|c| !c.trim().is_empty());
            let active = self
                .store
                .repository_by_path(&self.config.repo_path)
                .map(|r| r.id.clone());
            if let Some(id) = active {
                let patch = RepositoryPatch {
                    copy_files: Some(copy_files),
                    ..RepositoryPatch::default()
                };
                if let Err(e) = self.store.update_repository(&id, patch) {
                    return error_event(&e);
                }
            }
        }

        if self.save_config {
            match config::save_config(&self.config) {
                Ok(path) => info!(path = %path.display(), "config saved"),
                Err(e) => {
                    return DaemonEvent::Error {
                        kind: ErrorKind::Io,
                        message: format!("failed to save config: {e}"),
                    }
                }
            }
        }
        DaemonEvent::Config(self.config.clone())
    }

    fn create_task(
        &mut self,
        session_id: usize,
        repo_path: &str,
        title: &str,
        description: Option<&str>,
    ) {
        let repo = match self.store.repository_by_path(repo_path).cloned() {
            Some(repo) => Ok(repo),
            None => self.store.add_repository(repo_path, None),
        };
        let task = repo.and_then(|repo| {
            self.store
                .create_task(&repo.id, title, description.unwrap_or_default())
                .map(|task| (repo, task))
        });
        let (repo, task) = match task {
            Ok(pair) => pair,
            Err(e) => {
                self.reply(session_id, error_event(&e));
                return;
            }
        };
        info!(task_id = %task.id, repo = %repo.path, branch = %task.branch_name, "task created");
        self.reply(session_id, DaemonEvent::TaskCreated { task: task.clone() });
        self.sessions
            .broadcast(&DaemonEvent::TaskChanged { task: task.clone() });

        let copy_files = repo
            .copy_files
            .clone()
            .or_else(|| self.config.copy_files.clone());
        let tx = self.worker_tx.clone();
        tokio::spawn(async move {
            let result = worktree::create_worktree(
                Path::new(&repo.path),
                &task.id,
                &task.branch_name,
                copy_files.as_deref(),
                repo.worktree_path.as_deref(),
            )
            .await
            .map(|outcome| outcome.path.to_string_lossy().into_owned())
            .map_err(|e| e.to_string());
            let _ = tx
                .send(WorkerMessage::WorktreeReady {
                    task_id: task.id,
                    result,
                })
                .await;
        });
    }

    fn delete_task(&mut self, session_id: usize, repo_path: &str, task_id: &str) {
        let Some(task) = self.store.task(task_id).cloned() else {
            self.reply(
                session_id,
                DaemonEvent::Error {
                    kind: ErrorKind::NotFound,
                    message: "Task not found".to_string(),
                },
            );
            return;
        };
        if !self.deleting.insert(task.id.clone()) {
            debug!(task_id, "delete already in progress");
        }
        self.terminals.shutdown_for_task(task_id);

        let (repo_path, base) = match self.store.repository(&task.repository_id) {
            Some(repo) => (repo.path.clone(), repo.worktree_path.clone()),
            None => (normalize_path(repo_path), None),
        };
        let tx = self.worker_tx.clone();
        tokio::spawn(async move {
            let result = worktree::remove_worktree(
                Path::new(&repo_path),
                &task.id,
                Some(&task.branch_name),
                base.as_deref(),
            )
            .await
            .map_err(|e| e.to_string());
            let _ = tx
                .send(WorkerMessage::WorktreeRemoved {
                    session_id,
                    task_id: task.id,
                    result,
                })
                .await;
        });
    }

    fn delete_repository(&mut self, session_id: usize, id: &str) {
        let owned = match self.store.repository(id) {
            Some(_) => self.store.tasks(Some(id)),
            None => {
                let e = StoreError::RepositoryNotFound(id.to_string());
                self.reply(session_id, error_event(&e));
                return;
            }
        };
        for task in &owned {
            self.terminals.shutdown_for_task(&task.id);
        }
        match self.store.delete_repository(id) {
            Ok(removed) => {
                for task in removed {
                    self.sessions
                        .broadcast(&DaemonEvent::TaskRemoved { task_id: task.id });
                }
                self.reply(session_id, DaemonEvent::RepositoryDeleted { id: id.to_string() });
            }
            Err(e) => self.reply(session_id, error_event(&e)),
        }
    }

    // ── Background results ──

    pub fn apply_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::PtyOutput {
                task_id,
                generation,
                data,
            } => {
                self.terminals
                    .handle_output(&task_id, generation, data, &mut self.sessions);
            }
            WorkerMessage::PtyEof {
                task_id,
                generation,
            } => {
                self.terminals
                    .handle_exit(&task_id, generation, &mut self.sessions);
            }
            WorkerMessage::WorktreeReady { task_id, result } => {
                self.apply_worktree_ready(task_id, result)
            }
            WorkerMessage::WorktreeRemoved {
                session_id,
                task_id,
                result,
            } => {
                if let Err(e) = result {
                    warn!(task_id = %task_id, error = %e, "worktree removal failed, deleting task anyway");
                }
                self.deleting.remove(&task_id);
                self.terminals.shutdown_for_task(&task_id);
                match self.store.delete_task(&task_id) {
                    Ok(_) => {
                        info!(task_id = %task_id, "task deleted");
                        self.reply(
                            session_id,
                            DaemonEvent::TaskDeleted {
                                task_id: task_id.clone(),
                            },
                        );
                        self.sessions
                            .broadcast(&DaemonEvent::TaskRemoved { task_id });
                    }
                    Err(e) => self.reply(session_id, error_event(&e)),
                }
            }
            WorkerMessage::AiKickoff { task_id, tool } => {
                let Some(task) = self.store.task(&task_id).cloned() else {
                    return;
                };
                let error = match self.terminals.run_ai(&task, &tool) {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(task_id = %task_id, tool = %tool, error = %e, "AI kickoff skipped");
                        Some(e.to_string())
                    }
                };
                self.sessions
                    .broadcast(&DaemonEvent::AiRunFinished { task_id, error });
            }
            WorkerMessage::PrCreated {
                session_id,
                task_id,
                url,
            } => {
                if let Some(url) = url.clone() {
                    let patch = TaskPatch {
                        pr_url: Some(url),
                        ..TaskPatch::default()
                    };
                    match self.store.update_task(&task_id, patch) {
                        Ok(task) => self.sessions.broadcast(&DaemonEvent::TaskChanged { task }),
                        Err(e) => warn!(task_id = %task_id, error = %e, "failed to record PR url"),
                    }
                }
                self.reply(session_id, DaemonEvent::PrCreated { url });
            }
            WorkerMessage::PrMergeStatus {
                session_id,
                task_id,
                merged,
            } => {
                let changed = self
                    .store
                    .task(&task_id)
                    .is_some_and(|t| t.pr_merged != Some(merged));
                if changed {
                    let patch = TaskPatch {
                        pr_merged: Some(merged),
                        ..TaskPatch::default()
                    };
                    match self.store.update_task(&task_id, patch) {
                        Ok(task) => self.sessions.broadcast(&DaemonEvent::TaskChanged { task }),
                        Err(e) => warn!(task_id = %task_id, error = %e, "failed to record merge status"),
                    }
                }
                self.reply(session_id, DaemonEvent::PrMergeStatus { merged });
            }
            WorkerMessage::Reply { session_id, event } => self.reply(session_id, event),
        }
    }

    fn apply_worktree_ready(&mut self, task_id: String, result: Result<String, String>) {
        let worktree_path = match result {
            Ok(path) => path,
            Err(error) => {
                warn!(task_id = %task_id, error = %error, "worktree creation failed");
                self.sessions
                    .broadcast(&DaemonEvent::TaskProvisionFailed { task_id, error });
                return;
            }
        };
        if self.deleting.contains(&task_id) {
            debug!(task_id = %task_id, "task is being deleted, not starting its terminal");
            return;
        }
        let Some(task) = self.store.task(&task_id).cloned() else {
            debug!(task_id = %task_id, "task deleted before its worktree was ready");
            return;
        };
        let Some(repo) = self.store.repository(&task.repository_id).cloned() else {
            return;
        };
        if let Err(e) = self.terminals.ensure_for_task(&task, &repo) {
            warn!(task_id = %task_id, error = %e, "terminal spawn failed");
            self.sessions.broadcast(&DaemonEvent::TaskProvisionFailed {
                task_id,
                error: e.to_string(),
            });
            return;
        }
        if self.terminals.has_session(&task_id) {
            let tool = self.ai_tool_for(Some(&repo));
            if !tool.trim().is_empty() {
                self.terminals.schedule_ai(&task_id, &tool);
            }
        }
        self.sessions.broadcast(&DaemonEvent::TaskProvisioned {
            task_id,
            worktree_path,
        });
    }
}

/// Regenerate the PR title and body from the branch diff.
async fn sync_pr_with_ai(checkout: TaskCheckout, tool: String) -> Result<DaemonEvent, SyncError> {
    let base = git::get_default_branch(&checkout.repo_path).await;
    let diff = git::branch_diff(&checkout, &base).await?;
    if diff.trim().is_empty() {
        return Ok(done("No changes found"));
    }
    let dir = checkout.working_dir()?;
    let summary = ai::generate_pr_summary(&tool, &diff, &dir).await?;
    git::update_pr(&checkout, &summary).await?;
    info!(task_id = ?checkout.task_id, title = %summary.title, "PR synced from AI summary");
    Ok(done(format!("PR updated: {}", summary.title)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::{Arc, Mutex};

    use crate::terminal::tests::{FakeLog, FakeSpawner};

    fn setup() -> (Orchestrator, Arc<Mutex<FakeLog>>) {
        let (spawner, log) = FakeSpawner::new();
        (Orchestrator::new_for_test(Box::new(spawner)), log)
    }

    fn connect(orch: &mut Orchestrator, id: usize, subscribed: bool) -> mpsc::Receiver<DaemonEvent> {
        let (tx, rx) = mpsc::channel(256);
        orch.sessions.add_session_with_id(id, tx);
        orch.sessions.set_subscribed(id, subscribed);
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<DaemonEvent>) -> Vec<DaemonEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    async fn pump(orch: &mut Orchestrator) {
        let msg = orch.worker_rx.recv().await.expect("worker message");
        orch.apply_message(msg);
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("spawn git");
        assert!(
            out.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    fn temp_repo() -> (tempfile::TempDir, String) {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        git(&repo, &["init"]);
        git(&repo, &["config", "user.email", "test@test"]);
        git(&repo, &["config", "user.name", "test"]);
        git(&repo, &["commit", "--allow-empty", "-m", "init"]);
        (tmp, repo.to_string_lossy().into_owned())
    }

    #[tokio::test]
    async fn ping_and_subscription_replies() {
        let (mut orch, _log) = setup();
        let mut rx = connect(&mut orch, 1, false);
        orch.handle_request(ClientRequest::Ping, 1);
        orch.handle_request(ClientRequest::Subscribe, 1);
        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [DaemonEvent::Pong, DaemonEvent::Subscribed]
        ));
    }

    #[tokio::test]
    async fn create_task_provisions_worktree_terminal_and_ai() {
        let (mut orch, log) = setup();
        let (_tmp, repo_path) = temp_repo();
        let mut rx = connect(&mut orch, 1, true);

        orch.handle_request(
            ClientRequest::CreateTask {
                repo_path: format!("{repo_path}/"),
                title: "Fix login".into(),
                description: Some("the button".into()),
            },
            1,
        );
        let task = match drain(&mut rx).first() {
            Some(DaemonEvent::TaskCreated { task }) => task.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert!(task.branch_name.starts_with("feature/task-"));
        assert_eq!(orch.store.repositories().len(), 1);
        assert_eq!(orch.store.repositories()[0].path, repo_path);

        pump(&mut orch).await;
        let wt = Path::new(&repo_path).join(".vibetree/worktrees").join(&task.id);
        assert!(wt.is_dir());
        assert_eq!(git(&wt, &["branch", "--show-current"]), task.branch_name);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, DaemonEvent::TaskProvisioned { .. })));
        {
            let log = log.lock().unwrap();
            assert_eq!(log.spawned.len(), 1);
            assert_eq!(log.spawned[0].cwd, wt);
        }

        pump(&mut orch).await;
        let writes = log.lock().unwrap().writes.clone();
        assert_eq!(writes.len(), 1);
        let line = String::from_utf8(writes[0].1.clone()).unwrap();
        assert_eq!(line, "claude \"Task: Fix login\\n\\nthe button\"\n");
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [DaemonEvent::AiRunFinished { error: None, .. }]
        ));

        orch.handle_request(ClientRequest::ListTasks { repo_path }, 1);
        match drain(&mut rx).as_slice() {
            [DaemonEvent::TaskList { tasks }] => assert_eq!(tasks[0].id, task.id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn worktree_failure_keeps_task_and_reports() {
        let (mut orch, log) = setup();
        let not_a_repo = tempfile::tempdir().unwrap();
        let mut rx = connect(&mut orch, 1, true);

        orch.handle_request(
            ClientRequest::CreateTask {
                repo_path: not_a_repo.path().to_string_lossy().into_owned(),
                title: String::new(),
                description: None,
            },
            1,
        );
        pump(&mut orch).await;

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, DaemonEvent::TaskProvisionFailed { .. })));
        assert_eq!(orch.store.tasks(None).len(), 1);
        assert_eq!(orch.store.tasks(None)[0].title, "New Task");
        assert!(log.lock().unwrap().spawned.is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_when_worktree_removal_fails() {
        let (mut orch, log) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let repo_path = tmp.path().to_string_lossy().into_owned();
        let repo = orch.store.add_repository(&repo_path, None).unwrap();
        let task = orch.store.create_task(&repo.id, "t", "").unwrap();
        // A plain directory where the worktree should be: `git worktree remove` fails here.
        std::fs::create_dir_all(tmp.path().join(".vibetree/worktrees").join(&task.id)).unwrap();
        assert!(orch.terminals.ensure_for_task(&task, &repo).unwrap());
        let mut rx = connect(&mut orch, 1, true);

        orch.handle_request(
            ClientRequest::DeleteTask {
                repo_path,
                task_id: task.id.clone(),
            },
            1,
        );
        assert!(!orch.terminals.has_session(&task.id));
        assert_eq!(log.lock().unwrap().killed, vec![task.id.clone()]);

        pump(&mut orch).await;
        assert!(orch.store.task(&task.id).is_none());
        let events = drain(&mut rx);
        assert!(matches!(events[0], DaemonEvent::TaskDeleted { .. }));
        assert!(matches!(events[1], DaemonEvent::TaskRemoved { .. }));
    }

    #[tokio::test]
    async fn no_terminal_survives_a_delete_racing_provisioning() {
        let (mut orch, log) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let repo_path = tmp.path().to_string_lossy().into_owned();
        let repo = orch.store.add_repository(&repo_path, None).unwrap();
        let task = orch.store.create_task(&repo.id, "t", "").unwrap();
        let wt = tmp.path().join(".vibetree/worktrees").join(&task.id);
        std::fs::create_dir_all(&wt).unwrap();
        let mut rx = connect(&mut orch, 1, true);

        orch.handle_request(
            ClientRequest::DeleteTask {
                repo_path: repo_path.clone(),
                task_id: task.id.clone(),
            },
            1,
        );

        // Provisioning from the earlier create finishes while removal is running.
        orch.apply_message(WorkerMessage::WorktreeReady {
            task_id: task.id.clone(),
            result: Ok(wt.to_string_lossy().into_owned()),
        });
        assert!(!orch.terminals.has_session(&task.id));
        orch.handle_request(
            ClientRequest::TerminalCreate {
                cols: 80,
                rows: 24,
                task_id: Some(task.id.clone()),
                repo_path,
            },
            1,
        );
        assert!(!orch.terminals.has_session(&task.id));
        assert!(log.lock().unwrap().spawned.is_empty());
        match drain(&mut rx).as_slice() {
            [DaemonEvent::TerminalError { message, .. }] => {
                assert_eq!(message, "Task is being deleted")
            }
            other => panic!("unexpected {other:?}"),
        }

        // Whatever did start before removal completed is torn down with the record.
        assert!(orch.terminals.ensure_for_task(&task, &repo).unwrap());
        pump(&mut orch).await;
        assert!(orch.store.task(&task.id).is_none());
        assert!(!orch.terminals.has_session(&task.id));
        assert_eq!(log.lock().unwrap().killed, vec![task.id.clone()]);
    }

    #[tokio::test]
    async fn delete_unknown_task_is_not_found() {
        let (mut orch, _log) = setup();
        let mut rx = connect(&mut orch, 1, false);
        orch.handle_request(
            ClientRequest::DeleteTask {
                repo_path: "/nowhere".into(),
                task_id: "missing".into(),
            },
            1,
        );
        match drain(&mut rx).as_slice() {
            [DaemonEvent::Error { kind, message }] => {
                assert_eq!(*kind, ErrorKind::NotFound);
                assert_eq!(message, "Task not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_repository_cascades_tasks_and_terminals() {
        let (mut orch, log) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let repo = orch
            .store
            .add_repository(&tmp.path().to_string_lossy(), None)
            .unwrap();
        let a = orch.store.create_task(&repo.id, "a", "").unwrap();
        let b = orch.store.create_task(&repo.id, "b", "").unwrap();
        std::fs::create_dir_all(tmp.path().join(".vibetree/worktrees").join(&a.id)).unwrap();
        orch.terminals.ensure_for_task(&a, &repo).unwrap();
        let mut rx = connect(&mut orch, 1, true);

        orch.handle_request(ClientRequest::DeleteRepository { id: repo.id.clone() }, 1);

        assert!(orch.store.repositories().is_empty());
        assert!(orch.store.tasks(None).is_empty());
        assert_eq!(log.lock().unwrap().killed, vec![a.id.clone()]);
        let events = drain(&mut rx);
        let removed: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                DaemonEvent::TaskRemoved { task_id } => Some(task_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&b.id.as_str()));
        assert!(matches!(events.last(), Some(DaemonEvent::RepositoryDeleted { .. })));
    }

    #[tokio::test]
    async fn second_terminal_client_gets_the_live_output() {
        let (mut orch, log) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let repo = orch
            .store
            .add_repository(&tmp.path().to_string_lossy(), None)
            .unwrap();
        let task = orch.store.create_task(&repo.id, "t", "").unwrap();
        std::fs::create_dir_all(tmp.path().join(".vibetree/worktrees").join(&task.id)).unwrap();
        let mut rx_a = connect(&mut orch, 1, false);
        let mut rx_b = connect(&mut orch, 2, false);

        for client in [1, 2] {
            orch.handle_request(
                ClientRequest::TerminalCreate {
                    cols: 80,
                    rows: 24,
                    task_id: Some(task.id.clone()),
                    repo_path: repo.path.clone(),
                },
                client,
            );
        }
        assert_eq!(log.lock().unwrap().spawned.len(), 1);

        orch.apply_message(WorkerMessage::PtyOutput {
            task_id: task.id.clone(),
            generation: 1,
            data: b"hello".to_vec(),
        });

        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [DaemonEvent::TerminalDetached { .. }]
        ));
        match drain(&mut rx_b).as_slice() {
            [DaemonEvent::TerminalData { data, .. }] => assert_eq!(data, b"hello"),
            other => panic!("unexpected {other:?}"),
        }

        orch.handle_request(
            ClientRequest::TerminalInput {
                task_id: task.id.clone(),
                data: "from-a".into(),
            },
            1,
        );
        assert!(log.lock().unwrap().writes.is_empty());

        orch.client_disconnected(2);
        assert_eq!(orch.terminals.attached_client(&task.id), None);
        assert!(orch.terminals.has_session(&task.id));
    }

    #[tokio::test]
    async fn update_config_validates_and_registers_repo() {
        let (mut orch, _log) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let mut rx = connect(&mut orch, 1, false);

        orch.handle_request(
            ClientRequest::UpdateConfig {
                repo_path: Some("/definitely/not/here".into()),
                ai_tool: None,
                copy_files: None,
            },
            1,
        );
        orch.handle_request(
            ClientRequest::UpdateConfig {
                repo_path: None,
                ai_tool: Some("rm -rf".into()),
                copy_files: None,
            },
            1,
        );
        let path = format!("{}/", tmp.path().display());
        orch.handle_request(
            ClientRequest::UpdateConfig {
                repo_path: Some(path),
                ai_tool: Some("codex".into()),
                copy_files: Some(".env".into()),
            },
            1,
        );

        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            DaemonEvent::Error { kind: ErrorKind::Validation, message } if message == "Path does not exist"
        ));
        assert!(matches!(
            &events[1],
            DaemonEvent::Error {
                kind: ErrorKind::Validation,
                ..
            }
        ));
        let normalized = tmp.path().to_string_lossy().into_owned();
        match &events[2] {
            DaemonEvent::Config(config) => {
                assert_eq!(config.repo_path, normalized);
                assert_eq!(config.ai_tool, "codex");
            }
            other => panic!("unexpected {other:?}"),
        }
        let repo = orch.store.repository_by_path(&normalized).unwrap();
        assert_eq!(repo.copy_files.as_deref(), Some(".env"));
    }

    #[tokio::test]
    async fn merge_status_without_pr_is_false() {
        let (mut orch, _log) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let repo = orch
            .store
            .add_repository(&tmp.path().to_string_lossy(), None)
            .unwrap();
        let task = orch.store.create_task(&repo.id, "t", "").unwrap();
        let mut rx = connect(&mut orch, 1, false);

        for task_id in [task.id.clone(), "missing".to_string()] {
            orch.handle_request(
                ClientRequest::CheckPrMergeStatus {
                    repo_path: repo.path.clone(),
                    task_id,
                },
                1,
            );
        }
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, DaemonEvent::PrMergeStatus { merged: false })));
    }

    #[tokio::test]
    async fn merge_status_change_is_persisted_once() {
        let (mut orch, _log) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let repo = orch
            .store
            .add_repository(&tmp.path().to_string_lossy(), None)
            .unwrap();
        let task = orch.store.create_task(&repo.id, "t", "").unwrap();
        let mut rx = connect(&mut orch, 1, true);

        for _ in 0..2 {
            orch.apply_message(WorkerMessage::PrMergeStatus {
                session_id: 1,
                task_id: task.id.clone(),
                merged: true,
            });
        }
        assert_eq!(orch.store.task(&task.id).unwrap().pr_merged, Some(true));
        let changes = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, DaemonEvent::TaskChanged { .. }))
            .count();
        assert_eq!(changes, 1);
    }

    #[tokio::test]
    async fn created_pr_url_is_recorded() {
        let (mut orch, _log) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let repo = orch
            .store
            .add_repository(&tmp.path().to_string_lossy(), None)
            .unwrap();
        let task = orch.store.create_task(&repo.id, "t", "").unwrap();
        let mut rx = connect(&mut orch, 1, false);

        orch.apply_message(WorkerMessage::PrCreated {
            session_id: 1,
            task_id: task.id.clone(),
            url: Some("https://github.com/o/r/pull/7".into()),
        });
        assert_eq!(
            orch.store.task(&task.id).unwrap().pr_url.as_deref(),
            Some("https://github.com/o/r/pull/7")
        );
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [DaemonEvent::PrCreated { url: Some(_) }]
        ));
    }

    #[tokio::test]
    async fn invalid_base_branch_is_a_validation_error() {
        let (mut orch, _log) = setup();
        let mut rx = connect(&mut orch, 1, false);
        orch.handle_request(
            ClientRequest::Rebase {
                repo_path: "/tmp".into(),
                task_id: "t1".into(),
                base_branch: "main; rm -rf /".into(),
            },
            1,
        );
        pump(&mut orch).await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [DaemonEvent::Error {
                kind: ErrorKind::Validation,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn state_snapshot_lists_terminals() {
        let (mut orch, _log) = setup();
        let tmp = tempfile::tempdir().unwrap();
        let repo = orch
            .store
            .add_repository(&tmp.path().to_string_lossy(), None)
            .unwrap();
        let task = orch.store.create_task(&repo.id, "t", "").unwrap();
        std::fs::create_dir_all(tmp.path().join(".vibetree/worktrees").join(&task.id)).unwrap();
        orch.restore_terminals();
        let mut rx = connect(&mut orch, 1, false);

        orch.handle_request(ClientRequest::GetState, 1);
        match drain(&mut rx).as_slice() {
            [DaemonEvent::StateSnapshot(state)] => {
                assert_eq!(state.tasks.len(), 1);
                assert_eq!(state.terminals.len(), 1);
                assert_eq!(state.terminals[0].task_id, task.id);
                assert!(!state.terminals[0].attached);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
