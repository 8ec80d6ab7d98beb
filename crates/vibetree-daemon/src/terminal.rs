//! Terminal sessions: one long-lived shell per task, at most one attached
//! client, and a bounded backlog replayed on attach.
//!
//! Everything here runs on the daemon event loop. PTY reader threads only
//! post [`WorkerMessage::PtyOutput`]; buffering and forwarding both happen in
//! [`TerminalManager::handle_output`], so an attach can never interleave with
//! a chunk being recorded.

use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vibetree_core::ai;
use vibetree_core::config::AppConfig;
use vibetree_core::model::{Repository, Task};
use vibetree_core::protocol::{DaemonEvent, TerminalInfo};
use vibetree_core::worktree::task_worktree_path;

use crate::session::{Delivery, SessionManager};
use crate::worker::WorkerMessage;

/// Terminal id used when `terminal:create` carries no task.
pub const DEFAULT_TERMINAL_ID: &str = "default";

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 30;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to spawn shell: {0}")]
    Spawn(String),
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no terminal session for task {0}")]
    NoSession(String),
    #[error("no AI tool configured")]
    NoTool,
    #[error(transparent)]
    Ai(#[from] ai::AiError),
}

/// Bounded FIFO of output chunks; the oldest chunk is evicted first.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: Vec<u8>) {
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// All retained chunks joined in order.
    pub fn snapshot(&self) -> Vec<u8> {
        let total = self.chunks.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// Everything needed to start a shell for one terminal.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: String,
    pub generation: u64,
    pub shell: String,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// A running shell owned by exactly one terminal session.
pub trait PtyProcess: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError>;
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TerminalError>;
    fn kill(&mut self) -> Result<(), TerminalError>;
    /// Collect the exit status of a shell that already exited.
    fn reap(&mut self);
}

/// Starts shells. Output must be posted as [`WorkerMessage::PtyOutput`] tagged with the
/// request's generation, followed by one [`WorkerMessage::PtyEof`].
pub trait PtySpawner: Send {
    fn spawn(
        &mut self,
        req: SpawnRequest,
        tx: mpsc::Sender<WorkerMessage>,
    ) -> Result<Box<dyn PtyProcess>, TerminalError>;
}

struct TerminalSession {
    generation: u64,
    pty: Box<dyn PtyProcess>,
    attached: Option<usize>,
    /// The attached client missed output and gets a full snapshot next.
    lagging: bool,
    buffer: OutputBuffer,
    cwd: PathBuf,
}

/// `access(2)` with `R_OK | X_OK`.
pub fn is_accessible(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let Ok(c_path) = CString::new(dir.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::X_OK) == 0 }
}

fn dims(cols: u16, rows: u16) -> (u16, u16) {
    (
        if cols == 0 { DEFAULT_COLS } else { cols },
        if rows == 0 { DEFAULT_ROWS } else { rows },
    )
}

/// `terminal:create` as received from a client.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub cols: u16,
    pub rows: u16,
    pub task_id: Option<String>,
    pub repo_path: String,
}

pub struct TerminalManager {
    sessions: HashMap<String, TerminalSession>,
    spawner: Box<dyn PtySpawner>,
    worker_tx: mpsc::Sender<WorkerMessage>,
    shell: String,
    buffer_chunks: usize,
    settle_delay: Duration,
    kickoffs: HashMap<String, JoinHandle<()>>,
    next_generation: u64,
}

impl TerminalManager {
    pub fn new(
        spawner: Box<dyn PtySpawner>,
        worker_tx: mpsc::Sender<WorkerMessage>,
        config: &AppConfig,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            spawner,
            worker_tx,
            shell: config.shell(),
            buffer_chunks: config.terminal.buffer_chunks,
            settle_delay: Duration::from_millis(config.terminal.ai_settle_delay_ms),
            kickoffs: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn has_session(&self, task_id: &str) -> bool {
        self.sessions.contains_key(task_id)
    }

    pub fn attached_client(&self, task_id: &str) -> Option<usize> {
        self.sessions.get(task_id).and_then(|s| s.attached)
    }

    pub fn infos(&self) -> Vec<TerminalInfo> {
        let mut infos: Vec<TerminalInfo> = self
            .sessions
            .iter()
            .map(|(task_id, s)| TerminalInfo {
                task_id: task_id.clone(),
                attached: s.attached.is_some(),
                buffered_chunks: s.buffer.len(),
            })
            .collect();
        infos.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        infos
    }

    fn spawn_session(
        &mut self,
        term_id: &str,
        cwd: PathBuf,
        env: Vec<(String, String)>,
        cols: u16,
        rows: u16,
    ) -> Result<(), TerminalError> {
        let generation = self.next_generation;
        self.next_generation += 1;
        let (cols, rows) = dims(cols, rows);
        let req = SpawnRequest {
            task_id: term_id.to_string(),
            generation,
            shell: self.shell.clone(),
            cwd: cwd.clone(),
            env,
            cols,
            rows,
        };
        let pty = self.spawner.spawn(req, self.worker_tx.clone())?;
        info!(task_id = term_id, cwd = %cwd.display(), shell = %self.shell, "terminal spawned");
        self.sessions.insert(
            term_id.to_string(),
            TerminalSession {
                generation,
                pty,
                attached: None,
                lagging: false,
                buffer: OutputBuffer::new(self.buffer_chunks),
                cwd,
            },
        );
        Ok(())
    }

    /// Spawn the task's shell in its worktree unless a session already exists.
    /// A worktree that is not there yet is not an error. Returns whether a shell was spawned.
    pub fn ensure_for_task(&mut self, task: &Task, repo: &Repository) -> Result<bool, TerminalError> {
        if self.sessions.contains_key(&task.id) {
            return Ok(false);
        }
        let dir = task_worktree_path(Path::new(&repo.path), &task.id, repo.worktree_path.as_deref());
        if !is_accessible(&dir) {
            debug!(task_id = %task.id, dir = %dir.display(), "worktree not ready, no terminal");
            return Ok(false);
        }
        let env = task
            .shell_env()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.spawn_session(&task.id, dir, env, DEFAULT_COLS, DEFAULT_ROWS)?;
        Ok(true)
    }

    /// Handle `terminal:create` from `client`: attach to the running session or start one.
    /// Failures are reported to that client only.
    pub fn open_for_client(
        &mut self,
        client: usize,
        req: OpenRequest,
        task: Option<&Task>,
        repo: Option<&Repository>,
        sessions: &mut SessionManager,
    ) {
        if req.repo_path.trim().is_empty() {
            sessions.send_to(
                client,
                DaemonEvent::TerminalError {
                    task_id: req.task_id,
                    message: "Repository path not provided".to_string(),
                },
            );
            return;
        }
        let term_id = req
            .task_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_TERMINAL_ID.to_string());

        if !self.sessions.contains_key(&term_id) {
            let repo_path = PathBuf::from(&req.repo_path);
            let mut cwd = repo_path.clone();
            let mut env = Vec::new();
            if let Some(task) = task.filter(|t| t.id == term_id) {
                env = task
                    .shell_env()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect();
                let base = repo.and_then(|r| r.worktree_path.as_deref());
                let wt = task_worktree_path(&repo_path, &task.id, base);
                if wt.exists() {
                    cwd = wt;
                }
            }
            if !cwd.exists() {
                warn!(dir = %cwd.display(), "working dir missing, using home");
                cwd = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
            }
            if !is_accessible(&cwd) {
                sessions.send_to(
                    client,
                    DaemonEvent::TerminalError {
                        task_id: Some(term_id),
                        message: format!("Directory not accessible: {}", cwd.display()),
                    },
                );
                return;
            }
            if let Err(e) = self.spawn_session(&term_id, cwd, env, req.cols, req.rows) {
                warn!(task_id = %term_id, error = %e, "terminal spawn failed");
                sessions.send_to(
                    client,
                    DaemonEvent::TerminalError {
                        task_id: Some(term_id),
                        message: e.to_string(),
                    },
                );
                return;
            }
        }
        self.attach(&term_id, client, req.cols, req.rows, sessions);
    }

    /// Make `client` the only attached client, apply its size and replay the backlog once.
    fn attach(
        &mut self,
        term_id: &str,
        client: usize,
        cols: u16,
        rows: u16,
        sessions: &mut SessionManager,
    ) {
        let Some(session) = self.sessions.get_mut(term_id) else {
            return;
        };
        if let Some(previous) = session.attached.filter(|&p| p != client) {
            debug!(task_id = term_id, previous, client, "detaching previous client");
            sessions.send_to(
                previous,
                DaemonEvent::TerminalDetached {
                    task_id: term_id.to_string(),
                },
            );
        }
        session.attached = Some(client);
        session.lagging = false;

        let (cols, rows) = dims(cols, rows);
        if let Err(e) = session.pty.resize(cols, rows) {
            warn!(task_id = term_id, error = %e, "resize on attach failed");
        }

        if !session.buffer.is_empty() {
            debug!(
                task_id = term_id,
                chunks = session.buffer.len(),
                cwd = %session.cwd.display(),
                "replaying backlog"
            );
            let delivery = sessions.deliver_to(
                client,
                DaemonEvent::TerminalReconnect {
                    task_id: term_id.to_string(),
                    data: session.buffer.snapshot(),
                },
            );
            session.lagging = delivery == Delivery::Dropped;
        }
    }

    /// Keystrokes from a client; ignored unless that client is attached.
    pub fn input(&mut self, client: usize, task_id: &str, data: &[u8]) {
        let Some(session) = self.sessions.get_mut(task_id) else {
            return;
        };
        if session.attached != Some(client) {
            debug!(task_id, client, "input from detached client ignored");
            return;
        }
        if let Err(e) = session.pty.write(data) {
            warn!(task_id, error = %e, "PTY write failed");
        }
    }

    pub fn resize(&mut self, client: usize, task_id: &str, cols: u16, rows: u16) {
        let Some(session) = self.sessions.get_mut(task_id) else {
            return;
        };
        if session.attached != Some(client) {
            return;
        }
        let (cols, rows) = dims(cols, rows);
        if let Err(e) = session.pty.resize(cols, rows) {
            warn!(task_id, error = %e, "PTY resize failed");
        }
    }

    /// Record a PTY chunk and forward it to the attached client.
    pub fn handle_output(
        &mut self,
        task_id: &str,
        generation: u64,
        data: Vec<u8>,
        sessions: &mut SessionManager,
    ) {
        let Some(session) = self.sessions.get_mut(task_id) else {
            return;
        };
        if session.generation != generation {
            return;
        }
        session.buffer.push(data.clone());
        let Some(client) = session.attached else {
            return;
        };
        let event = if session.lagging {
            DaemonEvent::TerminalReconnect {
                task_id: task_id.to_string(),
                data: session.buffer.snapshot(),
            }
        } else {
            DaemonEvent::TerminalData {
                task_id: task_id.to_string(),
                data,
            }
        };
        match sessions.deliver_to(client, event) {
            Delivery::Sent => session.lagging = false,
            Delivery::Dropped => {
                debug!(task_id, client, "client fell behind, resyncing on next chunk");
                session.lagging = true;
            }
            Delivery::Gone => {
                session.attached = None;
                session.lagging = false;
            }
        }
    }

    /// The shell exited by itself: drop the session so the next request starts a fresh one.
    pub fn handle_exit(&mut self, task_id: &str, generation: u64, sessions: &mut SessionManager) {
        let matches = self
            .sessions
            .get(task_id)
            .is_some_and(|s| s.generation == generation);
        if !matches {
            return;
        }
        self.abort_kickoff(task_id);
        if let Some(mut session) = self.sessions.remove(task_id) {
            session.pty.reap();
            info!(task_id, "terminal exited");
            if let Some(client) = session.attached {
                sessions.send_to(
                    client,
                    DaemonEvent::TerminalExited {
                        task_id: task_id.to_string(),
                    },
                );
            }
        }
    }

    /// A client went away. Its terminals keep running.
    pub fn detach_client(&mut self, client: usize) {
        for session in self.sessions.values_mut() {
            if session.attached == Some(client) {
                session.attached = None;
            }
        }
    }

    /// Type the AI command into the task shell after the settle delay.
    /// Completion is reported through [`WorkerMessage::AiKickoff`].
    pub fn schedule_ai(&mut self, task_id: &str, tool: &str) {
        let tx = self.worker_tx.clone();
        let delay = self.settle_delay;
        let kickoff_task = task_id.to_string();
        let tool = tool.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(WorkerMessage::AiKickoff {
                    task_id: kickoff_task,
                    tool,
                })
                .await;
        });
        if let Some(previous) = self.kickoffs.insert(task_id.to_string(), handle) {
            previous.abort();
        }
    }

    fn abort_kickoff(&mut self, task_id: &str) {
        if let Some(handle) = self.kickoffs.remove(task_id) {
            handle.abort();
        }
    }

    /// Write `<tool> "<prompt>"` into the task's shell.
    pub fn run_ai(&mut self, task: &Task, tool: &str) -> Result<(), TerminalError> {
        self.kickoffs.remove(&task.id);
        let session = self
            .sessions
            .get_mut(&task.id)
            .ok_or_else(|| TerminalError::NoSession(task.id.clone()))?;
        if tool.trim().is_empty() {
            return Err(TerminalError::NoTool);
        }
        let line = ai::ai_command_line(tool.trim(), task)?;
        session.pty.write(line.as_bytes())?;
        info!(task_id = %task.id, tool, "AI command started");
        Ok(())
    }

    /// Kill the task's shell and forget the session. Unknown tasks are a no-op.
    pub fn shutdown_for_task(&mut self, task_id: &str) -> bool {
        self.abort_kickoff(task_id);
        let Some(mut session) = self.sessions.remove(task_id) else {
            return false;
        };
        if let Err(e) = session.pty.kill() {
            warn!(task_id, error = %e, "failed to kill PTY");
        }
        info!(task_id, "terminal shut down");
        true
    }

    pub fn shutdown_all(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.shutdown_for_task(&id);
        }
        for (_, handle) in self.kickoffs.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub(crate) struct FakeLog {
        pub spawned: Vec<SpawnRequest>,
        pub writes: Vec<(String, Vec<u8>)>,
        pub resizes: Vec<(String, u16, u16)>,
        pub killed: Vec<String>,
        pub reaped: Vec<String>,
    }

    struct FakePty {
        task_id: String,
        log: Arc<Mutex<FakeLog>>,
    }

    impl PtyProcess for FakePty {
        fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
            self.log
                .lock()
                .unwrap()
                .writes
                .push((self.task_id.clone(), data.to_vec()));
            Ok(())
        }

        fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TerminalError> {
            self.log
                .lock()
                .unwrap()
                .resizes
                .push((self.task_id.clone(), cols, rows));
            Ok(())
        }

        fn kill(&mut self) -> Result<(), TerminalError> {
            self.log.lock().unwrap().killed.push(self.task_id.clone());
            Ok(())
        }

        fn reap(&mut self) {
            self.log.lock().unwrap().reaped.push(self.task_id.clone());
        }
    }

    /// Counts spawns instead of starting shells.
    pub(crate) struct FakeSpawner {
        pub log: Arc<Mutex<FakeLog>>,
        pub fail: bool,
    }

    impl FakeSpawner {
        pub(crate) fn new() -> (Self, Arc<Mutex<FakeLog>>) {
            let log = Arc::new(Mutex::new(FakeLog::default()));
            (
                Self {
                    log: log.clone(),
                    fail: false,
                },
                log,
            )
        }
    }

    impl PtySpawner for FakeSpawner {
        fn spawn(
            &mut self,
            req: SpawnRequest,
            _tx: mpsc::Sender<WorkerMessage>,
        ) -> Result<Box<dyn PtyProcess>, TerminalError> {
            if self.fail {
                return Err(TerminalError::Spawn("no such shell".into()));
            }
            let task_id = req.task_id.clone();
            self.log.lock().unwrap().spawned.push(req);
            Ok(Box::new(FakePty {
                task_id,
                log: self.log.clone(),
            }))
        }
    }

    fn test_config(buffer_chunks: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.terminal.shell = Some("sh".into());
        config.terminal.buffer_chunks = buffer_chunks;
        config.terminal.ai_settle_delay_ms = 0;
        config
    }

    fn manager(
        buffer_chunks: usize,
    ) -> (
        TerminalManager,
        Arc<Mutex<FakeLog>>,
        mpsc::Receiver<WorkerMessage>,
    ) {
        let (spawner, log) = FakeSpawner::new();
        let (tx, rx) = mpsc::channel(64);
        let tm = TerminalManager::new(Box::new(spawner), tx, &test_config(buffer_chunks));
        (tm, log, rx)
    }

    fn client(sessions: &mut SessionManager, id: usize) -> mpsc::Receiver<DaemonEvent> {
        let (tx, rx) = mpsc::channel(64);
        sessions.add_session_with_id(id, tx);
        rx
    }

    fn open(task_id: &str, repo_path: &Path) -> OpenRequest {
        OpenRequest {
            cols: 120,
            rows: 40,
            task_id: Some(task_id.to_string()),
            repo_path: repo_path.to_string_lossy().into_owned(),
        }
    }

    fn generation_of(tm: &TerminalManager, task_id: &str) -> u64 {
        tm.sessions[task_id].generation
    }

    fn drain(rx: &mut mpsc::Receiver<DaemonEvent>) -> Vec<DaemonEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn repo_with_worktree(task: &Task) -> (tempfile::TempDir, Repository) {
        let tmp = tempfile::tempdir().unwrap();
        let wt = tmp.path().join(".vibetree/worktrees").join(&task.id);
        std::fs::create_dir_all(&wt).unwrap();
        let repo = Repository {
            id: task.repository_id.clone(),
            path: tmp.path().to_string_lossy().into_owned(),
            copy_files: None,
            worktree_path: None,
            ai_tool: None,
        };
        (tmp, repo)
    }

    #[test]
    fn buffer_evicts_oldest_chunks() {
        let mut buf = OutputBuffer::new(3);
        for chunk in ["a", "b", "c", "d", "e"] {
            buf.push(chunk.as_bytes().to_vec());
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.snapshot(), b"cde");
    }

    #[test]
    fn zero_capacity_buffer_keeps_latest_chunk() {
        let mut buf = OutputBuffer::new(0);
        buf.push(b"x".to_vec());
        buf.push(b"y".to_vec());
        assert_eq!(buf.snapshot(), b"y");
    }

    #[tokio::test]
    async fn ensure_spawns_exactly_once() {
        let (mut tm, log, _rx) = manager(10);
        let task = Task::new("r1", "Fix bug", "details");
        let (_tmp, repo) = repo_with_worktree(&task);

        assert!(tm.ensure_for_task(&task, &repo).unwrap());
        for _ in 0..5 {
            assert!(!tm.ensure_for_task(&task, &repo).unwrap());
        }

        let log = log.lock().unwrap();
        assert_eq!(log.spawned.len(), 1);
        let req = &log.spawned[0];
        assert_eq!(req.cwd, Path::new(&repo.path).join(".vibetree/worktrees").join(&task.id));
        assert_eq!(req.shell, "sh");
        assert!(req.env.contains(&("TASK_TITLE".to_string(), "Fix bug".to_string())));
        assert!(req.env.contains(&("TASK_DESCRIPTION".to_string(), "details".to_string())));
    }

    #[tokio::test]
    async fn ensure_without_worktree_is_benign() {
        let (mut tm, log, _rx) = manager(10);
        let task = Task::new("r1", "t", "");
        let tmp = tempfile::tempdir().unwrap();
        let repo = Repository {
            id: "r1".into(),
            path: tmp.path().to_string_lossy().into_owned(),
            copy_files: None,
            worktree_path: None,
            ai_tool: None,
        };
        assert!(!tm.ensure_for_task(&task, &repo).unwrap());
        assert!(!tm.has_session(&task.id));
        assert!(log.lock().unwrap().spawned.is_empty());
    }

    #[tokio::test]
    async fn reconnect_replays_backlog_once_then_streams_live() {
        let (mut tm, _log, _rx) = manager(10);
        let mut sessions = SessionManager::new();
        let task = Task::new("r1", "t", "");
        let (_tmp, repo) = repo_with_worktree(&task);
        tm.ensure_for_task(&task, &repo).unwrap();
        let gen = generation_of(&tm, &task.id);

        for chunk in ["a", "b", "c"] {
            tm.handle_output(&task.id, gen, chunk.as_bytes().to_vec(), &mut sessions);
        }

        let mut rx = client(&mut sessions, 7);
        tm.open_for_client(7, open(&task.id, Path::new(&repo.path)), Some(&task), Some(&repo), &mut sessions);
        tm.handle_output(&task.id, gen, b"d".to_vec(), &mut sessions);
        tm.handle_output(&task.id, gen, b"e".to_vec(), &mut sessions);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        match &events[0] {
            DaemonEvent::TerminalReconnect { data, .. } => assert_eq!(data, b"abc"),
            other => panic!("expected reconnect, got {other:?}"),
        }
        match (&events[1], &events[2]) {
            (
                DaemonEvent::TerminalData { data: d1, .. },
                DaemonEvent::TerminalData { data: d2, .. },
            ) => {
                assert_eq!(d1, b"d");
                assert_eq!(d2, b"e");
            }
            other => panic!("expected live data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnect_after_overflow_gets_retained_tail() {
        let (mut tm, _log, _rx) = manager(2);
        let mut sessions = SessionManager::new();
        let task = Task::new("r1", "t", "");
        let (_tmp, repo) = repo_with_worktree(&task);
        tm.ensure_for_task(&task, &repo).unwrap();
        let gen = generation_of(&tm, &task.id);
        for chunk in ["1", "2", "3", "4"] {
            tm.handle_output(&task.id, gen, chunk.as_bytes().to_vec(), &mut sessions);
        }

        let mut rx = client(&mut sessions, 1);
        tm.open_for_client(1, open(&task.id, Path::new(&repo.path)), Some(&task), Some(&repo), &mut sessions);
        match drain(&mut rx).as_slice() {
            [DaemonEvent::TerminalReconnect { data, .. }] => assert_eq!(data, b"34"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_client_is_resynced_with_a_snapshot() {
        let (mut tm, _log, _rx) = manager(10);
        let mut sessions = SessionManager::new();
        let task = Task::new("r1", "t", "");
        let (_tmp, repo) = repo_with_worktree(&task);
        let (tx, mut rx) = mpsc::channel(1);
        sessions.add_session_with_id(1, tx);
        tm.open_for_client(1, open(&task.id, Path::new(&repo.path)), Some(&task), Some(&repo), &mut sessions);
        let gen = generation_of(&tm, &task.id);

        tm.handle_output(&task.id, gen, b"a".to_vec(), &mut sessions);
        tm.handle_output(&task.id, gen, b"b".to_vec(), &mut sessions);
        match drain(&mut rx).as_slice() {
            [DaemonEvent::TerminalData { data, .. }] => assert_eq!(data, b"a"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tm.attached_client(&task.id), Some(1));

        tm.handle_output(&task.id, gen, b"c".to_vec(), &mut sessions);
        match drain(&mut rx).as_slice() {
            [DaemonEvent::TerminalReconnect { data, .. }] => assert_eq!(data, b"abc"),
            other => panic!("unexpected {other:?}"),
        }

        tm.handle_output(&task.id, gen, b"d".to_vec(), &mut sessions);
        match drain(&mut rx).as_slice() {
            [DaemonEvent::TerminalData { data, .. }] => assert_eq!(data, b"d"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_client_takes_over_the_terminal() {
        let (mut tm, log, _rx) = manager(10);
        let mut sessions = SessionManager::new();
        let task = Task::new("r1", "t", "");
        let (_tmp, repo) = repo_with_worktree(&task);
        let mut rx_a = client(&mut sessions, 1);
        let mut rx_b = client(&mut sessions, 2);

        tm.open_for_client(1, open(&task.id, Path::new(&repo.path)), Some(&task), Some(&repo), &mut sessions);
        tm.open_for_client(2, open(&task.id, Path::new(&repo.path)), Some(&task), Some(&repo), &mut sessions);
        assert_eq!(log.lock().unwrap().spawned.len(), 1);
        assert_eq!(tm.attached_client(&task.id), Some(2));

        let gen = generation_of(&tm, &task.id);
        tm.handle_output(&task.id, gen, b"live".to_vec(), &mut sessions);

        let a = drain(&mut rx_a);
        assert!(matches!(a.as_slice(), [DaemonEvent::TerminalDetached { .. }]));
        let b = drain(&mut rx_b);
        assert!(matches!(b.as_slice(), [DaemonEvent::TerminalData { .. }]));

        tm.input(1, &task.id, b"ignored");
        tm.input(2, &task.id, b"ls\n");
        let log = log.lock().unwrap();
        assert_eq!(log.writes, vec![(task.id.clone(), b"ls\n".to_vec())]);
    }

    #[tokio::test]
    async fn attach_applies_size_with_defaults() {
        let (mut tm, log, _rx) = manager(10);
        let mut sessions = SessionManager::new();
        let task = Task::new("r1", "t", "");
        let (_tmp, repo) = repo_with_worktree(&task);
        let _rx_c = client(&mut sessions, 1);
        let mut req = open(&task.id, Path::new(&repo.path));
        req.cols = 0;
        req.rows = 0;
        tm.open_for_client(1, req, Some(&task), Some(&repo), &mut sessions);
        tm.resize(1, &task.id, 100, 0);
        let log = log.lock().unwrap();
        assert_eq!(
            log.resizes,
            vec![(task.id.clone(), 80, 30), (task.id.clone(), 100, 30)]
        );
    }

    #[tokio::test]
    async fn missing_repo_path_is_reported_to_the_client() {
        let (mut tm, log, _rx) = manager(10);
        let mut sessions = SessionManager::new();
        let mut rx = client(&mut sessions, 1);
        tm.open_for_client(
            1,
            OpenRequest {
                cols: 80,
                rows: 30,
                task_id: None,
                repo_path: String::new(),
            },
            None,
            None,
            &mut sessions,
        );
        match drain(&mut rx).as_slice() {
            [DaemonEvent::TerminalError { message, .. }] => {
                assert_eq!(message, "Repository path not provided")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(log.lock().unwrap().spawned.is_empty());
    }

    #[tokio::test]
    async fn default_terminal_runs_in_repo_without_task_env() {
        let (mut tm, log, _rx) = manager(10);
        let mut sessions = SessionManager::new();
        let tmp = tempfile::tempdir().unwrap();
        let _rx_c = client(&mut sessions, 1);
        tm.open_for_client(
            1,
            OpenRequest {
                cols: 80,
                rows: 30,
                task_id: None,
                repo_path: tmp.path().to_string_lossy().into_owned(),
            },
            None,
            None,
            &mut sessions,
        );
        assert!(tm.has_session(DEFAULT_TERMINAL_ID));
        let log = log.lock().unwrap();
        assert_eq!(log.spawned[0].cwd, tmp.path());
        assert!(log.spawned[0].env.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_only_reaches_requesting_client() {
        let (mut spawner, _log) = FakeSpawner::new();
        spawner.fail = true;
        let (tx, _rx) = mpsc::channel(8);
        let mut tm = TerminalManager::new(Box::new(spawner), tx, &test_config(10));
        let mut sessions = SessionManager::new();
        let tmp = tempfile::tempdir().unwrap();
        let mut rx_a = client(&mut sessions, 1);
        let mut rx_b = client(&mut sessions, 2);
        sessions.set_subscribed(2, true);

        tm.open_for_client(1, open("t1", tmp.path()), None, None, &mut sessions);
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [DaemonEvent::TerminalError { .. }]
        ));
        assert!(drain(&mut rx_b).is_empty());
        assert!(!tm.has_session("t1"));
    }

    #[tokio::test]
    async fn stale_output_after_shutdown_is_dropped() {
        let (mut tm, log, _rx) = manager(10);
        let mut sessions = SessionManager::new();
        let task = Task::new("r1", "t", "");
        let (_tmp, repo) = repo_with_worktree(&task);
        tm.ensure_for_task(&task, &repo).unwrap();
        let old_gen = generation_of(&tm, &task.id);

        assert!(tm.shutdown_for_task(&task.id));
        assert!(!tm.shutdown_for_task(&task.id));
        assert_eq!(log.lock().unwrap().killed, vec![task.id.clone()]);

        tm.ensure_for_task(&task, &repo).unwrap();
        tm.handle_output(&task.id, old_gen, b"stale".to_vec(), &mut sessions);
        assert_eq!(tm.infos()[0].buffered_chunks, 0);
    }

    #[tokio::test]
    async fn pty_exit_removes_session_and_notifies_client() {
        let (mut tm, _log, _rx) = manager(10);
        let mut sessions = SessionManager::new();
        let task = Task::new("r1", "t", "");
        let (_tmp, repo) = repo_with_worktree(&task);
        let mut rx = client(&mut sessions, 3);
        tm.open_for_client(3, open(&task.id, Path::new(&repo.path)), Some(&task), Some(&repo), &mut sessions);
        let gen = generation_of(&tm, &task.id);

        tm.handle_exit(&task.id, gen, &mut sessions);
        assert!(!tm.has_session(&task.id));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [DaemonEvent::TerminalExited { .. }]
        ));
    }

    #[tokio::test]
    async fn exited_shell_is_reaped_not_killed() {
        let (mut tm, log, _rx) = manager(10);
        let mut sessions = SessionManager::new();
        let task = Task::new("r1", "t", "");
        let (_tmp, repo) = repo_with_worktree(&task);
        tm.ensure_for_task(&task, &repo).unwrap();
        let gen = generation_of(&tm, &task.id);

        tm.handle_exit(&task.id, gen + 1, &mut sessions);
        assert!(log.lock().unwrap().reaped.is_empty());

        tm.handle_exit(&task.id, gen, &mut sessions);
        let log = log.lock().unwrap();
        assert_eq!(log.reaped, vec![task.id.clone()]);
        assert!(log.killed.is_empty());
    }

    #[tokio::test]
    async fn run_ai_writes_escaped_command() {
        let (mut tm, log, _rx) = manager(10);
        let task = Task::new("r1", "Fix \"it\"", "");
        let (_tmp, repo) = repo_with_worktree(&task);
        tm.ensure_for_task(&task, &repo).unwrap();

        tm.run_ai(&task, "claude").unwrap();
        assert!(matches!(
            tm.run_ai(&task, "claude; rm -rf /"),
            Err(TerminalError::Ai(_))
        ));
        assert!(matches!(tm.run_ai(&task, ""), Err(TerminalError::NoTool)));

        let log = log.lock().unwrap();
        assert_eq!(
            log.writes,
            vec![(task.id.clone(), b"claude \"Task: Fix \\\"it\\\"\"\n".to_vec())]
        );
    }

    #[tokio::test]
    async fn run_ai_without_session_is_reported() {
        let (mut tm, _log, _rx) = manager(10);
        let task = Task::new("r1", "t", "");
        assert!(matches!(
            tm.run_ai(&task, "claude"),
            Err(TerminalError::NoSession(_))
        ));
    }

    #[tokio::test]
    async fn scheduled_kickoff_posts_back_to_the_loop() {
        let (mut tm, _log, mut rx) = manager(10);
        tm.schedule_ai("t1", "codex");
        match rx.recv().await {
            Some(WorkerMessage::AiKickoff { task_id, tool }) => {
                assert_eq!(task_id, "t1");
                assert_eq!(tool, "codex");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_aborts_pending_kickoff() {
        let (spawner, _log) = FakeSpawner::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut config = test_config(10);
        config.terminal.ai_settle_delay_ms = 50;
        let mut tm = TerminalManager::new(Box::new(spawner), tx, &config);

        tm.schedule_ai("t1", "claude");
        tm.shutdown_for_task("t1");
        let waited = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(waited.is_err(), "kickoff should have been aborted");
    }

    #[tokio::test]
    async fn disconnect_clears_attachment_but_keeps_pty() {
        let (mut tm, log, _rx) = manager(10);
        let mut sessions = SessionManager::new();
        let task = Task::new("r1", "t", "");
        let (_tmp, repo) = repo_with_worktree(&task);
        let _rx_c = client(&mut sessions, 5);
        tm.open_for_client(5, open(&task.id, Path::new(&repo.path)), Some(&task), Some(&repo), &mut sessions);

        tm.detach_client(5);
        assert_eq!(tm.attached_client(&task.id), None);
        assert!(tm.has_session(&task.id));
        assert!(log.lock().unwrap().killed.is_empty());
    }
}
