mod ipc_server;
mod orchestrator;
mod pty_worker;
mod session;
mod terminal;
mod worker;

use std::fs;
use std::io;
use std::path::Path;
use std::process;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vibetree_core::config;
use vibetree_core::ipc::{daemon_pid_path, daemon_socket_path};
use vibetree_core::protocol::ClientRequest;
use vibetree_core::store::{default_store_dir, Store};

use crate::ipc_server::{ServerChannels, ServerCommand};
use crate::orchestrator::Orchestrator;
use crate::pty_worker::NativePtySpawner;

fn init_tracing() {
    let filter = EnvFilter::try_from_env("VIBETREE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Refuse to start next to a live daemon; clear leftovers of a dead one.
fn check_pid_file(pid_path: &Path, socket_path: &Path) -> Result<(), String> {
    let Ok(content) = fs::read_to_string(pid_path) else {
        return Ok(());
    };
    if let Ok(pid) = content.trim().parse::<libc::pid_t>() {
        let alive = unsafe { libc::kill(pid, 0) == 0 };
        if alive {
            return Err(format!("daemon already running (PID {pid})"));
        }
    }
    info!(path = %pid_path.display(), "removing stale PID file");
    let _ = fs::remove_file(pid_path);
    let _ = fs::remove_file(socket_path);
    Ok(())
}

fn write_pid_file(pid_path: &Path) -> Result<(), String> {
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
    }
    fs::write(pid_path, process::id().to_string())
        .map_err(|e| format!("failed to write PID file: {e}"))
}

fn cleanup_files(pid_path: &Path, socket_path: &Path) {
    let _ = fs::remove_file(pid_path);
    let _ = fs::remove_file(socket_path);
}

#[tokio::main]
async fn main() {
    init_tracing();

    let pid_path = daemon_pid_path();
    let socket_path = daemon_socket_path();

    if let Err(e) = check_pid_file(&pid_path, &socket_path).and_then(|()| write_pid_file(&pid_path)) {
        error!("{e}");
        process::exit(1);
    }
    let _ = fs::remove_file(&socket_path);

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "failed to install signal handlers");
            cleanup_files(&pid_path, &socket_path);
            process::exit(1);
        }
    };

    let config = config::load_config();
    let store = match default_store_dir() {
        Some(dir) => Store::open(dir),
        None => Store::in_memory(),
    };
    let mut orch = Orchestrator::new(config, store, Box::new(NativePtySpawner));
    orch.restore_terminals();

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ServerCommand>();
    let (register_tx, mut register_rx) = mpsc::unbounded_channel();
    let (unregister_tx, mut unregister_rx) = mpsc::unbounded_channel::<usize>();

    let server_socket = socket_path.clone();
    let server_handle = tokio::spawn(async move {
        let channels = ServerChannels {
            cmd_tx,
            register_tx,
            unregister_tx,
        };
        if let Err(e) = ipc_server::run_server(server_socket, channels).await {
            error!(error = %e, "IPC server stopped");
        }
    });

    info!(pid = process::id(), socket = %socket_path.display(), "vibetreed started");

    loop {
        tokio::select! {
            Some(msg) = orch.worker_rx.recv() => orch.apply_message(msg),
            Some(cmd) = cmd_rx.recv() => {
                let is_shutdown = matches!(cmd.request, ClientRequest::Shutdown);
                orch.handle_request(cmd.request, cmd.session_id);
                if is_shutdown {
                    break;
                }
            }
            Some((session_id, event_tx)) = register_rx.recv() => {
                orch.sessions.add_session_with_id(session_id, event_tx);
            }
            Some(session_id) = unregister_rx.recv() => orch.client_disconnected(session_id),
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break;
            }
        }
    }

    info!("shutting down, killing terminals");
    orch.shutdown();
    // Let the shutdown reply reach the client before the server goes away.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    server_handle.abort();
    cleanup_files(&pid_path, &socket_path);
    info!("vibetreed stopped");
}
