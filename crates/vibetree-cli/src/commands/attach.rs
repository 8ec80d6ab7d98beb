//! `vibetree attach`: bridge the local terminal to a task's shell.
//!
//! The local tty goes into raw mode; keystrokes become `TerminalInput`,
//! size changes become `TerminalResize`, and shell output is written
//! straight to stdout. Ctrl-] detaches and leaves the shell running.

use std::io;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use vibetree_core::protocol::{ClientRequest, DaemonEvent};

use super::{resolve_repo, take_repo_flag};
use crate::daemon_client::{self, Connection};

const USAGE: &str = "Usage: vibetree attach <task-id> [--repo <path>]
  Attach to the task's terminal. Press Ctrl-] to detach.";

const CLEAR_SCREEN: &[u8] = b"\x1b[H\x1b[2J";

enum Outcome {
    Detached,
    TakenOver,
    Exited,
}

pub fn cmd_attach(args: &[String]) -> i32 {
    let (repo_flag, args) = match take_repo_flag(args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    let [task_id] = args.as_slice() else {
        eprintln!("{USAGE}");
        return 1;
    };
    let Some(repo_path) = resolve_repo(repo_flag) else {
        eprintln!("Cannot determine repository path. Pass --repo <path>.");
        return 1;
    };

    match daemon_client::block_on(attach(repo_path, task_id.clone())) {
        Ok(Outcome::Detached) => {
            eprintln!("Detached from {task_id}.");
            0
        }
        Ok(Outcome::TakenOver) => {
            eprintln!("Detached: another client took over this terminal.");
            0
        }
        Ok(Outcome::Exited) => {
            eprintln!("Shell exited.");
            0
        }
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}

async fn attach(repo_path: String, task_id: String) -> Result<Outcome, String> {
    let (mut events, mut requests) = Connection::connect().await?.into_split();

    // 0x0 lets the daemon pick its default size.
    let (cols, rows) = terminal::size().unwrap_or((0, 0));
    requests
        .send(&ClientRequest::TerminalCreate {
            cols,
            rows,
            task_id: Some(task_id.clone()),
            repo_path,
        })
        .await?;

    // Frame reads are not cancel-safe, so they get their own task.
    let (daemon_tx, mut daemon_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let event = events.next().await;
            let failed = event.is_err();
            if daemon_tx.send(event).is_err() || failed {
                break;
            }
        }
    });

    let (key_tx, mut key_rx) = mpsc::unbounded_channel::<Event>();
    std::thread::spawn(move || {
        while !key_tx.is_closed() {
            if event::poll(Duration::from_millis(50)).unwrap_or(false) {
                if let Ok(ev) = event::read() {
                    if key_tx.send(ev).is_err() {
                        break;
                    }
                }
            }
        }
    });

    terminal::enable_raw_mode().map_err(|e| format!("Cannot enter raw mode: {e}"))?;
    let result = pump(&task_id, &mut requests, &mut key_rx, &mut daemon_rx).await;
    if let Err(e) = terminal::disable_raw_mode() {
        eprintln!("Failed to restore terminal: {e}");
    }
    result
}

async fn pump(
    task_id: &str,
    requests: &mut daemon_client::RequestWriter,
    key_rx: &mut mpsc::UnboundedReceiver<Event>,
    daemon_rx: &mut mpsc::UnboundedReceiver<Result<DaemonEvent, String>>,
) -> Result<Outcome, String> {
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            Some(ev) = key_rx.recv() => match ev {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    if is_detach_key(&key) {
                        return Ok(Outcome::Detached);
                    }
                    if let Some(data) = key_input(&key) {
                        requests
                            .send(&ClientRequest::TerminalInput {
                                task_id: task_id.to_string(),
                                data,
                            })
                            .await?;
                    }
                }
                Event::Resize(cols, rows) => {
                    requests
                        .send(&ClientRequest::TerminalResize {
                            task_id: task_id.to_string(),
                            cols,
                            rows,
                        })
                        .await?;
                }
                _ => {}
            },
            event = daemon_rx.recv() => match event {
                Some(Ok(DaemonEvent::TerminalData { data, .. })) => {
                    write_output(&mut stdout, &data)
                        .await
                        .map_err(|e| format!("Write error: {e}"))?;
                }
                // A backlog replay redraws from a clean screen.
                Some(Ok(DaemonEvent::TerminalReconnect { data, .. })) => {
                    let mut replay = CLEAR_SCREEN.to_vec();
                    replay.extend_from_slice(&data);
                    write_output(&mut stdout, &replay)
                        .await
                        .map_err(|e| format!("Write error: {e}"))?;
                }
                Some(Ok(DaemonEvent::TerminalDetached { .. })) => return Ok(Outcome::TakenOver),
                Some(Ok(DaemonEvent::TerminalExited { .. })) => return Ok(Outcome::Exited),
                Some(Ok(DaemonEvent::TerminalError { message, .. }))
                | Some(Ok(DaemonEvent::Error { message, .. })) => return Err(message),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => return Err("Connection to daemon closed".to_string()),
            },
        }
    }
}

async fn write_output(stdout: &mut tokio::io::Stdout, data: &[u8]) -> io::Result<()> {
    stdout.write_all(data).await?;
    stdout.flush().await
}

fn is_detach_key(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char(']')
}

/// Encode a key press as the byte sequence an xterm would send.
fn key_input(key: &KeyEvent) -> Option<String> {
    let seq: String = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            let c = c.to_ascii_lowercase();
            if !c.is_ascii_lowercase() {
                return None;
            }
            char::from(c as u8 - b'a' + 1).to_string()
        }
        KeyCode::Char(c) => c.to_string(),
        KeyCode::Enter => "\r".into(),
        KeyCode::Backspace => "\x7f".into(),
        KeyCode::Tab => "\t".into(),
        KeyCode::BackTab => "\x1b[Z".into(),
        KeyCode::Esc => "\x1b".into(),
        KeyCode::Up => "\x1b[A".into(),
        KeyCode::Down => "\x1b[B".into(),
        KeyCode::Right => "\x1b[C".into(),
        KeyCode::Left => "\x1b[D".into(),
        KeyCode::Home => "\x1b[H".into(),
        KeyCode::End => "\x1b[F".into(),
        KeyCode::Insert => "\x1b[2~".into(),
        KeyCode::Delete => "\x1b[3~".into(),
        KeyCode::PageUp => "\x1b[5~".into(),
        KeyCode::PageDown => "\x1b[6~".into(),
        KeyCode::F(n @ 1..=4) => format!("\x1bO{}", char::from(b'P' + n - 1)),
        KeyCode::F(n) => {
            let code = match n {
                5 => 15,
                6..=10 => n + 11,
                11 | 12 => n + 12,
                _ => return None,
            };
            format!("\x1b[{code}~")
        }
        _ => return None,
    };
    if key.modifiers.contains(KeyModifiers::ALT) && key.code != KeyCode::Esc {
        Some(format!("\x1b{seq}"))
    } else {
        Some(seq)
    }
}
