use std::io::{Read, Write};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::terminal::{PtyProcess, PtySpawner, SpawnRequest, TerminalError};
use crate::worker::{WorkerInput, WorkerMessage};

const READ_CHUNK: usize = 4096;

/// Spawns shells on real pseudo-terminals.
pub struct NativePtySpawner;

pub struct NativePty {
    input_tx: mpsc::UnboundedSender<WorkerInput>,
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

fn spawn_err(what: &str, e: impl std::fmt::Display) -> TerminalError {
    TerminalError::Spawn(format!("{what}: {e}"))
}

impl PtySpawner for NativePtySpawner {
    fn spawn(
        &mut self,
        req: SpawnRequest,
        tx: mpsc::Sender<WorkerMessage>,
    ) -> Result<Box<dyn PtyProcess>, TerminalError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: req.rows,
                cols: req.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_err("failed to open PTY", e))?;

        let mut cmd = CommandBuilder::new(&req.shell);
        cmd.cwd(&req.cwd);
        cmd.env("TERM", "xterm-color");
        for (key, value) in &req.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_err(&format!("failed to spawn {}", req.shell), e))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_err("failed to clone PTY reader", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_err("failed to take PTY writer", e))?;

        let SpawnRequest {
            task_id,
            generation,
            ..
        } = req;

        std::thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let msg = WorkerMessage::PtyOutput {
                            task_id: task_id.clone(),
                            generation,
                            data: buf[..n].to_vec(),
                        };
                        if tx.blocking_send(msg).is_err() {
                            return;
                        }
                    }
                }
            }
            debug!(task_id = %task_id, generation, "PTY reader reached EOF");
            let _ = tx.blocking_send(WorkerMessage::PtyEof {
                task_id,
                generation,
            });
        });

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<WorkerInput>();
        std::thread::spawn(move || {
            let mut writer = writer;
            while let Some(input) = input_rx.blocking_recv() {
                match input {
                    WorkerInput::SendBytes(bytes) => {
                        if writer.write_all(&bytes).is_err() {
                            break;
                        }
                        let _ = writer.flush();
                    }
                    WorkerInput::Kill => break,
                }
            }
        });

        Ok(Box::new(NativePty {
            input_tx,
            master: pair.master,
            child: Some(child),
        }))
    }
}

impl PtyProcess for NativePty {
    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        self.input_tx
            .send(WorkerInput::SendBytes(data.to_vec()))
            .map_err(|_| {
                TerminalError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "PTY writer closed",
                ))
            })
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Io(std::io::Error::other(e.to_string())))
    }

    fn kill(&mut self) -> Result<(), TerminalError> {
        let _ = self.input_tx.send(WorkerInput::Kill);
        if let Some(child) = self.child.as_mut() {
            child.kill()?;
        }
        Ok(())
    }

    fn reap(&mut self) {
        let _ = self.input_tx.send(WorkerInput::Kill);
        let Some(mut child) = self.child.take() else {
            return;
        };
        std::thread::spawn(move || match child.wait() {
            Ok(status) => debug!(exit_code = status.exit_code(), "shell reaped"),
            Err(e) => warn!(error = %e, "failed to reap shell"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell_request(cwd: &std::path::Path) -> SpawnRequest {
        SpawnRequest {
            task_id: "t1".into(),
            generation: 3,
            shell: "/bin/sh".into(),
            cwd: cwd.to_path_buf(),
            env: vec![("TASK_TITLE".into(), "hello-from-env".into())],
            cols: 80,
            rows: 30,
        }
    }

    async fn collect_until(
        rx: &mut mpsc::Receiver<WorkerMessage>,
        needle: &str,
    ) -> (String, bool) {
        let mut out = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let msg = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(msg)) => msg,
                _ => return (out, false),
            };
            match msg {
                WorkerMessage::PtyOutput {
                    generation, data, ..
                } => {
                    assert_eq!(generation, 3);
                    out.push_str(&String::from_utf8_lossy(&data));
                    if out.contains(needle) {
                        return (out, true);
                    }
                }
                WorkerMessage::PtyEof { .. } => return (out, false),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn shell_sees_task_env_and_echoes_input() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(256);
        let mut pty = NativePtySpawner.spawn(shell_request(tmp.path()), tx).unwrap();

        pty.write(b"echo \"$TASK_TITLE\"\n").unwrap();
        let (out, found) = collect_until(&mut rx, "hello-from-env\r\n").await;
        assert!(found, "output was {out:?}");

        pty.resize(100, 40).unwrap();
        pty.kill().unwrap();
    }

    #[tokio::test]
    async fn exit_posts_eof() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(256);
        let mut pty = NativePtySpawner.spawn(shell_request(tmp.path()), tx).unwrap();
        pty.write(b"exit\n").unwrap();

        let got_eof = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(msg) = rx.recv().await {
                if matches!(msg, WorkerMessage::PtyEof { generation: 3, .. }) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(got_eof);
    }

    fn shell_pid(output: &str) -> Option<u32> {
        output.match_indices("pid:").find_map(|(i, _)| {
            let digits: String = output[i + 4..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            digits.parse().ok()
        })
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn exited_shell_does_not_linger_as_zombie() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(256);
        let mut pty = NativePtySpawner.spawn(shell_request(tmp.path()), tx).unwrap();
        pty.write(b"echo \"pid:$$\"; exit\n").unwrap();

        let mut out = String::new();
        let got_eof = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(msg) = rx.recv().await {
                match msg {
                    WorkerMessage::PtyOutput { data, .. } => {
                        out.push_str(&String::from_utf8_lossy(&data))
                    }
                    WorkerMessage::PtyEof { .. } => return true,
                    _ => {}
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(got_eof);
        let pid = shell_pid(&out).unwrap_or_else(|| panic!("no pid in {out:?}"));

        pty.reap();
        drop(pty);

        let proc_dir = std::path::PathBuf::from(format!("/proc/{pid}"));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while proc_dir.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!proc_dir.exists(), "shell {pid} was never reaped");
    }
}
