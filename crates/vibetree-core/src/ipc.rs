//! Wire framing and socket path resolution for IPC.
//!
//! Every message is a length-delimited frame (4-byte big-endian length +
//! payload). Payloads are JSON, except terminal output which is sent as a
//! binary terminal frame:
//!
//! ```text
//! [0x01 marker][kind: u8][task id length: u16 BE][task id][raw bytes]
//! ```

use std::io::{self, Read};
use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::DaemonEvent;

/// Default daemon socket path: `~/.local/share/vibetree/daemon.sock`
pub fn daemon_socket_path() -> PathBuf {
    crate::config::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp/vibetree"))
        .join("daemon.sock")
}

/// Default daemon PID file path: `~/.local/share/vibetree/daemon.pid`
pub fn daemon_pid_path() -> PathBuf {
    crate::config::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp/vibetree"))
        .join("daemon.pid")
}

/// Maximum frame payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Marker byte that distinguishes binary terminal frames from JSON frames.
pub const TERMINAL_FRAME_MARKER: u8 = 0x01;

const KIND_DATA: u8 = 0;
const KIND_RECONNECT: u8 = 1;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("Malformed terminal frame: {0}")]
    Malformed(&'static str),
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode: 4-byte big-endian length + payload.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode one frame from a reader. Returns payload bytes.
pub fn decode_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Check if a decoded frame payload is a binary terminal frame.
pub fn is_binary_frame(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == TERMINAL_FRAME_MARKER
}

fn encode_terminal_frame(kind: u8, task_id: &str, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let id = task_id.as_bytes();
    let id_len = u16::try_from(id.len()).map_err(|_| FrameError::Malformed("task id too long"))?;
    let mut payload = Vec::with_capacity(4 + id.len() + data.len());
    payload.push(TERMINAL_FRAME_MARKER);
    payload.push(kind);
    payload.extend_from_slice(&id_len.to_be_bytes());
    payload.extend_from_slice(id);
    payload.extend_from_slice(data);
    Ok(payload)
}

fn decode_terminal_frame(payload: &[u8]) -> Result<DaemonEvent, FrameError> {
    // marker + kind + 2-byte id length
    if payload.len() < 4 {
        return Err(FrameError::Malformed("terminal frame too short"));
    }
    let kind = payload[1];
    let id_len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
    let id_end = 4 + id_len;
    if payload.len() < id_end {
        return Err(FrameError::Malformed("task id truncated"));
    }
    let task_id = std::str::from_utf8(&payload[4..id_end])
        .map_err(|_| FrameError::Malformed("task id is not UTF-8"))?
        .to_string();
    let data = payload[id_end..].to_vec();
    match kind {
        KIND_DATA => Ok(DaemonEvent::TerminalData { task_id, data }),
        KIND_RECONNECT => Ok(DaemonEvent::TerminalReconnect { task_id, data }),
        _ => Err(FrameError::Malformed("unknown terminal frame kind")),
    }
}

/// Serialize an event into a frame payload: terminal output as a binary frame, the rest as JSON.
pub fn encode_event(event: &DaemonEvent) -> Result<Vec<u8>, FrameError> {
    match event {
        DaemonEvent::TerminalData { task_id, data } => {
            encode_terminal_frame(KIND_DATA, task_id, data)
        }
        DaemonEvent::TerminalReconnect { task_id, data } => {
            encode_terminal_frame(KIND_RECONNECT, task_id, data)
        }
        other => Ok(serde_json::to_vec(other)?),
    }
}

/// Inverse of [`encode_event`].
pub fn decode_event(payload: &[u8]) -> Result<DaemonEvent, FrameError> {
    if is_binary_frame(payload) {
        decode_terminal_frame(payload)
    } else {
        Ok(serde_json::from_slice(payload)?)
    }
}
