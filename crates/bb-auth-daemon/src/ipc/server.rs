//! Unix-socket listener and per-connection tasks.
//!
//! One reader task and one writer task run per connection. The reader
//! decodes lines, performs the strict JSON validation (top-level object
//! with a string `type`), answers framing errors itself, and forwards
//! valid messages to the agent. The writer drains the connection's send
//! queue; flattened frames are wiped after the write completes.
//!
//! An oversize line disconnects the client; every other per-message error
//! leaves the connection open.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use bb_auth_core::wire::error_reply;

use super::codec::{FramingError, LineCodec};
use super::{ClientId, OutboundFrame, encode_frame};
use crate::agent::{AgentEvent, AgentHandle};

/// Listener for the broker socket.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Binds the broker socket at `path` with user-only permissions,
    /// removing any stale socket file first.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the path cannot be prepared
    /// or bound; listen failure at startup is fatal for the daemon.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        info!("listening on {}", path.display());
        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    /// The bound socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept loop. Runs until the task is dropped.
    pub async fn run(self, agent: AgentHandle) {
        let mut next_id: u64 = 0;

        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    next_id += 1;
                    let id = ClientId(next_id);
                    spawn_connection(id, stream, agent.clone());
                }
                Err(e) => {
                    error!("accept failed: {e}");
                }
            }
        }
    }
}

/// Wires up the reader/writer tasks for one accepted connection.
fn spawn_connection(id: ClientId, stream: UnixStream, agent: AgentHandle) {
    let peer_pid = peer_pid(&stream);
    debug!("{id} connected (peer pid {peer_pid:?})");

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<OutboundFrame>();

    agent.send(AgentEvent::ClientConnected {
        id,
        peer_pid,
        tx: tx.clone(),
    });

    tokio::spawn(write_loop(id, write_half, rx));
    tokio::spawn(read_loop(id, read_half, tx, agent));
}

/// Reads the peer process id via `SO_PEERCRED`.
fn peer_pid(stream: &UnixStream) -> Option<i32> {
    stream.peer_cred().ok().and_then(|cred| cred.pid())
}

async fn write_loop(
    id: ClientId,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame.0).await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
        // `frame` drops here; the flattened buffer is zeroized.
    }
    debug!("{id} writer finished");
}

async fn read_loop(
    id: ClientId,
    read_half: OwnedReadHalf,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    agent: AgentHandle,
) {
    let mut framed = FramedRead::new(read_half, LineCodec::new());

    while let Some(next) = framed.next().await {
        match next {
            Ok(line) => handle_line(id, &line, &tx, &agent),
            Err(FramingError::LineTooLong { size, max }) => {
                warn!("{id} exceeded line cap ({size} > {max}), disconnecting");
                break;
            }
            Err(FramingError::Io(e)) => {
                debug!("{id} read error: {e}");
                break;
            }
        }
    }

    agent.send(AgentEvent::ClientDisconnected(id));
    debug!("{id} disconnected");
}

/// Validates one decoded line and forwards it to the agent.
///
/// Framing-level failures are answered directly on this connection; only
/// well-formed messages reach the agent loop.
fn handle_line(
    id: ClientId,
    line: &[u8],
    tx: &mpsc::UnboundedSender<OutboundFrame>,
    agent: &AgentHandle,
) {
    let value: Value = match serde_json::from_slice(line) {
        Ok(value) => value,
        Err(_) => {
            let _ = tx.send(encode_frame(&error_reply("Invalid JSON")));
            return;
        }
    };

    if !value.is_object() {
        let _ = tx.send(encode_frame(&error_reply("Invalid JSON")));
        return;
    }

    let has_type = value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| !t.is_empty());
    if !has_type {
        let _ = tx.send(encode_frame(&error_reply("Missing type field")));
        return;
    }

    agent.send(AgentEvent::Message {
        client: id,
        msg: value,
    });
}
