use std::io;
use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vibetree_core::ipc::{self, MAX_FRAME_SIZE};
use vibetree_core::protocol::{ClientRequest, DaemonEvent};

use crate::session::CLIENT_QUEUE_DEPTH;

/// A request from one client, forwarded to the event loop.
pub struct ServerCommand {
    pub session_id: usize,
    pub request: ClientRequest,
}

/// Channels connecting client handlers to the event loop.
#[derive(Clone)]
pub struct ServerChannels {
    pub cmd_tx: mpsc::UnboundedSender<ServerCommand>,
    pub register_tx: mpsc::UnboundedSender<(usize, mpsc::Sender<DaemonEvent>)>,
    pub unregister_tx: mpsc::UnboundedSender<usize>,
}

async fn read_frame_async(reader: &mut (impl AsyncReadExt + Unpin)) -> io::Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len}"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn write_frame_async(
    writer: &mut (impl AsyncWriteExt + Unpin),
    payload: &[u8],
) -> io::Result<()> {
    writer.write_all(&ipc::encode_frame(payload)).await?;
    writer.flush().await
}

/// Accept clients on `socket_path` until the listener fails.
pub async fn run_server(socket_path: PathBuf, channels: ServerChannels) -> io::Result<()> {
    let listener = UnixListener::bind(&socket_path)?;
    info!(socket = %socket_path.display(), "IPC server listening");

    let mut next_session_id: usize = 1;
    loop {
        let (stream, _addr) = listener.accept().await?;
        let session_id = next_session_id;
        next_session_id += 1;
        let channels = channels.clone();
        tokio::spawn(handle_client(stream, session_id, channels));
    }
}

async fn handle_client(stream: UnixStream, session_id: usize, channels: ServerChannels) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(CLIENT_QUEUE_DEPTH);
    if channels.register_tx.send((session_id, event_tx)).is_err() {
        return;
    }
    debug!(session_id, "client connected");

    let write_loop = async {
        while let Some(event) = event_rx.recv().await {
            let payload = match ipc::encode_event(&event) {
                Ok(p) => p,
                Err(e) => {
                    warn!(session_id, error = %e, "failed to encode event");
                    continue;
                }
            };
            if write_frame_async(&mut writer, &payload).await.is_err() {
                break;
            }
        }
    };

    let read_loop = async {
        loop {
            let Ok(payload) = read_frame_async(&mut reader).await else {
                break;
            };
            if ipc::is_binary_frame(&payload) {
                continue;
            }
            let request: ClientRequest = match serde_json::from_slice(&payload) {
                Ok(r) => r,
                Err(e) => {
                    warn!(session_id, error = %e, "invalid request from client");
                    continue;
                }
            };
            let is_shutdown = matches!(request, ClientRequest::Shutdown);
            if channels
                .cmd_tx
                .send(ServerCommand {
                    session_id,
                    request,
                })
                .is_err()
                || is_shutdown
            {
                break;
            }
        }
    };

    tokio::select! {
        _ = write_loop => {},
        _ = read_loop => {},
    }

    debug!(session_id, "client disconnected");
    let _ = channels.unregister_tx.send(session_id);
}
