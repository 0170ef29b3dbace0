//! The gated endpoint: a WebSocket upgraded into a raw byte stream and handed
//! to either a PTY-attached command (`/run`) or the local sshd (`/sshd`).

pub mod exec;
pub mod pty;
pub mod sshd;

use std::io;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::config::{BridgeMode, Config};
use crate::state::AgentState;
use exec::ExecBridge;
use sshd::{ShellBridge, SshdError};

/// Which process sits behind the gated endpoint. Chosen once at startup.
#[derive(Debug)]
pub enum ProcessBridge {
    Exec(ExecBridge),
    Shell(ShellBridge),
}

impl ProcessBridge {
    /// Build the bridge for `config.agent.mode`. Shell mode launches sshd
    /// here, so a broken sshd setup fails startup rather than the first
    /// session.
    pub async fn start(config: &Config) -> Result<Self, SshdError> {
        match config.agent.mode {
            BridgeMode::Exec => Ok(Self::Exec(ExecBridge::new(
                config.exec.terminal_rows,
                config.exec.terminal_cols,
            ))),
            BridgeMode::Shell => ShellBridge::start(&config.sshd).await.map(Self::Shell),
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Self::Exec(_) => "/run",
            Self::Shell(_) => "/sshd",
        }
    }

    pub async fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        match self {
            Self::Exec(bridge) => bridge.serve(stream).await,
            Self::Shell(bridge) => bridge.serve(stream).await,
        }
    }
}

/// Handler for the gated path. Sits behind [`crate::gate::guard`].
pub async fn upgrade(State(state): State<AgentState>, ws: WebSocketUpgrade) -> Response {
    let bridge = Arc::clone(&state.bridge);
    ws.on_upgrade(move |socket| {
        let bridge_id = Uuid::new_v4();
        async move {
            info!("bridge opened");
            bridge.serve(ws_stream(socket)).await;
            info!("bridge closed");
        }
        .instrument(info_span!("bridge", %bridge_id))
    })
}

/// View a WebSocket as a plain byte stream.
///
/// Binary and text frames both carry payload bytes; a close frame is EOF.
/// Writes go out as binary frames, and shutdown sends a close frame.
pub fn ws_stream(socket: WebSocket) -> impl AsyncRead + AsyncWrite + Send + 'static {
    let (sink, stream) = socket.split();

    let incoming = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(bytes)) => Some(Ok(bytes)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(_) => None,
                Err(e) => Some(Err(io::Error::other(e))),
            })
        });

    let outgoing = sink
        .sink_map_err(io::Error::other)
        .with(|bytes: Bytes| future::ready(Ok::<_, io::Error>(Message::Binary(bytes))));

    tokio::io::join(
        StreamReader::new(incoming),
        SinkWriter::new(CopyToBytes::new(outgoing)),
    )
}

/// Copy `a` ⇄ `b` until both directions finish. Each side's writer is shut
/// down once its source hits EOF, so a close on one end propagates.
///
/// Returns the byte counts for `a → b` and `b → a`.
pub async fn splice<A, B>(a: A, b: B) -> (io::Result<u64>, io::Result<u64>)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let forward = async {
        let copied = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        copied
    };
    let backward = async {
        let copied = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        copied
    };
    tokio::join!(forward, backward)
}
