use vibetree_core::protocol::DaemonEvent;

/// Messages posted back to the event loop by PTY threads and background tasks.
#[derive(Debug)]
pub enum WorkerMessage {
    /// A chunk read from a task PTY. `generation` identifies the session that produced it.
    PtyOutput {
        task_id: String,
        generation: u64,
        data: Vec<u8>,
    },
    /// The PTY reached EOF: the shell exited.
    PtyEof { task_id: String, generation: u64 },
    WorktreeReady {
        task_id: String,
        result: Result<String, String>,
    },
    WorktreeRemoved {
        session_id: usize,
        task_id: String,
        result: Result<(), String>,
    },
    /// The AI settle delay elapsed for a task.
    AiKickoff { task_id: String, tool: String },
    PrCreated {
        session_id: usize,
        task_id: String,
        url: Option<String>,
    },
    PrMergeStatus {
        session_id: usize,
        task_id: String,
        merged: bool,
    },
    /// A finished background request whose reply needs no state change.
    Reply { session_id: usize, event: DaemonEvent },
}

/// Input to a PTY writer thread.
#[derive(Debug)]
pub enum WorkerInput {
    SendBytes(Vec<u8>),
    Kill,
}
