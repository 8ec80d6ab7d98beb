//! Async IPC client for the CLI.
//!
//! One-shot commands connect, send one request, read the first JSON reply and
//! disconnect. `attach` keeps a [`Connection`] open and streams terminal frames.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use vibetree_core::ipc::{self, MAX_FRAME_SIZE};
use vibetree_core::protocol::{ClientRequest, DaemonEvent};

const CONNECT_ERROR: &str = "Failed to connect to daemon. Is it running? Start with: vibetreed";

/// Run `fut` on a fresh runtime.
pub fn block_on<T>(fut: impl Future<Output = Result<T, String>>) -> Result<T, String> {
    let rt = tokio::runtime::Runtime::new().map_err(|e| format!("Runtime error: {e}"))?;
    rt.block_on(fut)
}

async fn write_request(
    writer: &mut (impl AsyncWrite + Unpin),
    req: &ClientRequest,
) -> Result<(), String> {
    let json = serde_json::to_vec(req).map_err(|e| format!("Serialize error: {e}"))?;
    writer
        .write_all(&ipc::encode_frame(&json))
        .await
        .map_err(|e| format!("Write error: {e}"))?;
    writer.flush().await.map_err(|e| format!("Flush error: {e}"))
}

async fn read_event(reader: &mut (impl AsyncRead + Unpin)) -> Result<DaemonEvent, String> {
    let len = reader
        .read_u32()
        .await
        .map_err(|e| format!("Read error: {e}"))? as usize;
    if len > MAX_FRAME_SIZE {
        return Err("Response frame too large".to_string());
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| format!("Read error: {e}"))?;
    ipc::decode_event(&payload).map_err(|e| format!("Decode error: {e}"))
}

/// Send one request and wait for the first reply that is not terminal output.
pub async fn request(req: ClientRequest) -> Result<DaemonEvent, String> {
    let mut stream = UnixStream::connect(ipc::daemon_socket_path())
        .await
        .map_err(|_| CONNECT_ERROR.to_string())?;
    write_request(&mut stream, &req).await?;
    loop {
        match read_event(&mut stream).await? {
            DaemonEvent::TerminalData { .. } | DaemonEvent::TerminalReconnect { .. } => continue,
            event => return Ok(event),
        }
    }
}

/// Long-lived connection split into halves so input and output can run concurrently.
pub struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub async fn connect() -> Result<Self, String> {
        let stream = UnixStream::connect(ipc::daemon_socket_path())
            .await
            .map_err(|_| CONNECT_ERROR.to_string())?;
        let (reader, writer) = stream.into_split();
        Ok(Self { reader, writer })
    }

    pub fn into_split(self) -> (EventReader, RequestWriter) {
        (
            EventReader {
                reader: self.reader,
            },
            RequestWriter {
                writer: self.writer,
            },
        )
    }
}

pub struct EventReader {
    reader: OwnedReadHalf,
}

impl EventReader {
    pub async fn next(&mut self) -> Result<DaemonEvent, String> {
        read_event(&mut self.reader).await
    }
}

pub struct RequestWriter {
    writer: OwnedWriteHalf,
}

impl RequestWriter {
    pub async fn send(&mut self, req: &ClientRequest) -> Result<(), String> {
        write_request(&mut self.writer, req).await
    }
}
