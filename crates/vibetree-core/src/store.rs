//! Repository registry and task store, persisted as one JSON file per record:
//!
//! ```text
//! <data_dir>/repositories/<id>.json
//! <data_dir>/tasks/<id>.json
//! ```
//!
//! A store opened without a directory keeps everything in memory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{normalize_path, Repository, RepositoryPatch, Task, TaskPatch};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("repository path is empty")]
    EmptyPath,
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("another repository already uses {0}")]
    PathInUse(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct Store {
    dir: Option<PathBuf>,
    repositories: Vec<Repository>,
    tasks: Vec<Task>,
}

/// Default store location: `~/.local/share/vibetree/`
pub fn default_store_dir() -> Option<PathBuf> {
    crate::config::data_dir()
}

fn save_record<T: Serialize>(dir: &Path, id: &str, record: &T) -> Result<(), StoreError> {
    fs::create_dir_all(dir).map_err(|source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(format!("{id}.json"));
    let content = serde_json::to_string_pretty(record)?;
    fs::write(&path, content).map_err(|source| StoreError::Io { path, source })
}

fn delete_record(dir: &Path, id: &str) -> Result<(), StoreError> {
    let path = dir.join(format!("{id}.json"));
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Io { path, source }),
    }
}

fn load_records<T: DeserializeOwned>(dir: &Path) -> Vec<T> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                return None;
            }
            let content = fs::read_to_string(&path).ok()?;
            match serde_json::from_str(&content) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable record");
                    None
                }
            }
        })
        .collect()
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            repositories: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Open (or create) a store rooted at `dir`, loading all existing records.
    pub fn open(dir: PathBuf) -> Self {
        let repositories: Vec<Repository> = load_records(&dir.join("repositories"));
        let tasks: Vec<Task> = load_records(&dir.join("tasks"));
        info!(
            dir = %dir.display(),
            repositories = repositories.len(),
            tasks = tasks.len(),
            "store loaded"
        );
        Self {
            dir: Some(dir),
            repositories,
            tasks,
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn repositories_dir(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join("repositories"))
    }

    fn tasks_dir(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join("tasks"))
    }

    fn persist_repository(&self, repo: &Repository) -> Result<(), StoreError> {
        match self.repositories_dir() {
            Some(dir) => save_record(&dir, &repo.id, repo),
            None => Ok(()),
        }
    }

    fn persist_task(&self, task: &Task) -> Result<(), StoreError> {
        match self.tasks_dir() {
            Some(dir) => save_record(&dir, &task.id, task),
            None => Ok(()),
        }
    }

    // ── Repositories ──

    pub fn repositories(&self) -> &[Repository] {
        &self.repositories
    }

    pub fn repository(&self, id: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.id == id)
    }

    pub fn repository_by_path(&self, raw_path: &str) -> Option<&Repository> {
        let normalized = normalize_path(raw_path);
        self.repositories.iter().find(|r| r.path == normalized)
    }

    /// Register a repository. Adding a known path returns the existing record unchanged.
    pub fn add_repository(
        &mut self,
        raw_path: &str,
        copy_files: Option<String>,
    ) -> Result<Repository, StoreError> {
        let normalized = normalize_path(raw_path);
        if normalized.is_empty() {
            return Err(StoreError::EmptyPath);
        }
        if let Some(existing) = self.repository_by_path(&normalized) {
            return Ok(existing.clone());
        }
        let repo = Repository {
            id: uuid::Uuid::now_v7().to_string(),
            path: normalized,
            copy_files: copy_files.filter(|c| !c.trim().is_empty()),
            worktree_path: None,
            ai_tool: None,
        };
        self.persist_repository(&repo)?;
        info!(repo_id = %repo.id, path = %repo.path, "repository added");
        self.repositories.push(repo.clone());
        Ok(repo)
    }

    pub fn update_repository(
        &mut self,
        id: &str,
        patch: RepositoryPatch,
    ) -> Result<Repository, StoreError> {
        let mut repo = self
            .repository(id)
            .cloned()
            .ok_or_else(|| StoreError::RepositoryNotFound(id.to_string()))?;
        if let Some(path) = patch.path {
            let normalized = normalize_path(&path);
            if normalized.is_empty() {
                return Err(StoreError::EmptyPath);
            }
            if self
                .repositories
                .iter()
                .any(|r| r.id != id && r.path == normalized)
            {
                return Err(StoreError::PathInUse(normalized));
            }
            repo.path = normalized;
        }
        // Empty strings clear optional settings.
        if let Some(copy_files) = patch.copy_files {
            repo.copy_files = Some(copy_files).filter(|c| !c.trim().is_empty());
        }
        if let Some(worktree_path) = patch.worktree_path {
            repo.worktree_path =
                Some(normalize_path(&worktree_path)).filter(|p| !p.is_empty());
        }
        if let Some(ai_tool) = patch.ai_tool {
            repo.ai_tool = Some(ai_tool.trim().to_string()).filter(|t| !t.is_empty());
        }
        self.persist_repository(&repo)?;
        if let Some(slot) = self.repositories.iter_mut().find(|r| r.id == id) {
            *slot = repo.clone();
        }
        Ok(repo)
    }

    /// Delete a repository and every task that belongs to it. Returns the removed tasks.
    pub fn delete_repository(&mut self, id: &str) -> Result<Vec<Task>, StoreError> {
        if self.repository(id).is_none() {
            return Err(StoreError::RepositoryNotFound(id.to_string()));
        }
        let owned: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.repository_id == id)
            .cloned()
            .collect();
        for task in &owned {
            self.delete_task(&task.id)?;
        }
        if let Some(dir) = self.repositories_dir() {
            delete_record(&dir, id)?;
        }
        self.repositories.retain(|r| r.id != id);
        info!(repo_id = id, cascaded_tasks = owned.len(), "repository deleted");
        Ok(owned)
    }

    // ── Tasks ──

    /// Tasks of one repository (or all tasks), newest first.
    pub fn tasks(&self, repository_id: Option<&str>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| repository_id.is_none_or(|id| t.repository_id == id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        tasks
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn create_task(
        &mut self,
        repository_id: &str,
        title: &str,
        description: &str,
    ) -> Result<Task, StoreError> {
        if self.repository(repository_id).is_none() {
            return Err(StoreError::RepositoryNotFound(repository_id.to_string()));
        }
        let task = Task::new(repository_id, title, description);
        self.persist_task(&task)?;
        self.tasks.push(task.clone());
        Ok(task)
    }

    pub fn update_task(&mut self, id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        let mut task = self
            .task(id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(pr_url) = patch.pr_url {
            task.pr_url = Some(pr_url).filter(|u| !u.is_empty());
        }
        if let Some(merged) = patch.pr_merged {
            task.pr_merged = Some(merged);
        }
        self.persist_task(&task)?;
        if let Some(slot) = self.tasks.iter_mut().find(|t| t.id == id) {
            *slot = task.clone();
        }
        Ok(task)
    }

    /// Delete a task record. Returns `false` if no such task existed.
    pub fn delete_task(&mut self, id: &str) -> Result<bool, StoreError> {
        if self.task(id).is_none() {
            return Ok(false);
        }
        if let Some(dir) = self.tasks_dir() {
            delete_record(&dir, id)?;
        }
        self.tasks.retain(|t| t.id != id);
        Ok(true)
    }
}
