//! Container-exec bridge: terminates one framed channel per connection and
//! attaches a process inside a container.
//!
//! `/term?pod&name&user&role&cmd` upgrades to a `webtty` channel. With `pod`
//! present, `name` is resolved through the runtime's name filter. Interactive
//! execs pump base64 DATA frames; file-transfer execs pump raw record bodies.

pub mod exec;

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::Query;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{Error, Result};
use crate::proto::{self, InputFrame, OutputFrame, WinSize};

use exec::{ExecHandle, ExecIo, RecordSplitter};

type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

pub async fn serve(addr: &str) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/term", get(term_handler))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "exec bridge listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TermQuery {
    #[serde(default)]
    pod: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    cmd: String,
}

async fn term_handler(Query(query): Query<TermQuery>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.protocols([proto::SUBPROTOCOL])
        .on_upgrade(move |socket| handle_term(socket, query))
}

async fn handle_term(mut socket: WebSocket, query: TermQuery) {
    if query.name.is_empty() {
        return;
    }
    let role = if query.role.is_empty() {
        "root"
    } else {
        query.role.as_str()
    };
    let cmd = if query.cmd.is_empty() {
        "bash"
    } else {
        query.cmd.as_str()
    };
    let sftp = cmd.contains("sftp");

    tracing::info!(
        user = %query.user,
        pod = %query.pod,
        name = %query.name,
        cmd = %cmd,
        "exec session"
    );

    let docker = match Docker::connect_with_unix_defaults() {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(error = %e, "container runtime unreachable");
            return;
        }
    };

    let container = if query.pod.is_empty() {
        query.name.clone()
    } else {
        match exec::resolve_container(&docker, &query.name, &query.pod).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::warn!(pod = %query.pod, name = %query.name, "no matching container");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "container lookup failed");
                return;
            }
        }
    };

    let (handle, io) = match exec::attach(&docker, &container, role, cmd, !sftp).await {
        Ok(attached) => attached,
        Err(e) => {
            tracing::warn!(container = %container, error = %e, "exec attach failed");
            return;
        }
    };

    if !sftp {
        // The gateway sends a wake frame right after dialling; consume it so
        // it never reaches the shell.
        match socket.recv().await {
            Some(Ok(_)) => {}
            _ => {
                handle.kill_if_running().await;
                return;
            }
        }
    }

    let (sink, stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    if sftp {
        run_sftp_pumps(sink.clone(), stream, io).await;
    } else {
        run_tty_pumps(sink.clone(), stream, handle.clone(), io).await;
    }

    handle.kill_if_running().await;

    let mut sink = sink.lock().await;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "\n".into(),
        })))
        .await;
}

async fn next_frame(stream: &mut SplitStream<WebSocket>) -> Result<Bytes> {
    loop {
        let msg = stream
            .next()
            .await
            .ok_or_else(|| Error::closed("channel"))?
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        match msg {
            Message::Text(text) => return Ok(Bytes::copy_from_slice(text.as_bytes())),
            Message::Binary(data) => return Ok(data),
            Message::Close(_) => return Err(Error::closed("channel")),
            Message::Ping(_) | Message::Pong(_) => continue,
        }
    }
}

async fn send_frame(sink: &WsSink, msg: Message) -> Result<()> {
    sink.lock()
        .await
        .send(msg)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))
}

/// Interactive pump pair: base64 DATA frames out, tag-dispatched frames in.
/// The first error cancels both directions.
async fn run_tty_pumps(
    sink: WsSink,
    mut stream: SplitStream<WebSocket>,
    handle: ExecHandle,
    io: ExecIo,
) {
    let cancel = CancellationToken::new();
    let ExecIo {
        mut output,
        mut input,
    } = io;

    let out_task = tokio::spawn({
        let sink = sink.clone();
        let cancel = cancel.clone();
        async move {
            let result: Result<()> = async {
                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        chunk = output.next() => chunk,
                    };
                    let chunk = chunk
                        .ok_or_else(|| Error::closed("container"))?
                        .map_err(|e| Error::Client(e.to_string()))?;
                    let bytes = chunk.into_bytes();
                    for part in bytes.chunks(1024) {
                        let mut frame = String::with_capacity(1 + part.len() * 4 / 3 + 4);
                        frame.push(proto::OUTPUT as char);
                        frame.push_str(&BASE64.encode(part));
                        send_frame(&sink, Message::Text(frame.into())).await?;
                    }
                }
            }
            .await;
            cancel.cancel();
            result
        }
    });

    let in_task = tokio::spawn({
        let sink = sink.clone();
        let cancel = cancel.clone();
        async move {
            let mut last_size: Option<WinSize> = None;
            let result: Result<()> = async {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        frame = next_frame(&mut stream) => frame?,
                    };
                    match InputFrame::decode(&frame)? {
                        InputFrame::Data(payload) => {
                            if !payload.is_empty() {
                                input.write_all(&payload).await?;
                                input.flush().await?;
                            }
                        }
                        InputFrame::Ping => {
                            let pong = OutputFrame::Pong.encode();
                            send_frame(&sink, Message::Binary(pong)).await?;
                        }
                        InputFrame::Resize(win) => {
                            // Apply only when the window actually changed.
                            if last_size != Some(win) {
                                last_size = Some(win);
                                if let Err(e) = handle.resize(win).await {
                                    tracing::warn!(error = %e, "exec resize failed");
                                }
                            }
                        }
                    }
                }
            }
            .await;
            cancel.cancel();
            result
        }
    });

    let (out_res, in_res) = tokio::join!(out_task, in_task);
    for res in [out_res, in_res] {
        match res {
            Ok(Err(e)) => tracing::debug!(error = %e, "tty pump ended"),
            Err(e) => tracing::warn!(error = %e, "tty pump panicked"),
            Ok(Ok(())) => {}
        }
    }
}

/// File-transfer pump pair: container records are re-emitted one body per
/// message; inbound messages are written to the container verbatim.
async fn run_sftp_pumps(sink: WsSink, mut stream: SplitStream<WebSocket>, io: ExecIo) {
    let cancel = CancellationToken::new();
    let ExecIo {
        mut output,
        mut input,
    } = io;

    let out_task = tokio::spawn({
        let sink = sink.clone();
        let cancel = cancel.clone();
        async move {
            let mut splitter = RecordSplitter::new();
            let result: Result<()> = async {
                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        chunk = output.next() => chunk,
                    };
                    let chunk = chunk
                        .ok_or_else(|| Error::closed("container"))?
                        .map_err(|e| Error::Client(e.to_string()))?;
                    for body in splitter.push(&chunk.into_bytes())? {
                        send_frame(&sink, Message::Binary(body)).await?;
                    }
                }
            }
            .await;
            cancel.cancel();
            result
        }
    });

    let in_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result: Result<()> = async {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        frame = next_frame(&mut stream) => frame?,
                    };
                    input.write_all(&frame).await?;
                    input.flush().await?;
                }
            }
            .await;
            cancel.cancel();
            result
        }
    });

    let (out_res, in_res) = tokio::join!(out_task, in_task);
    for res in [out_res, in_res] {
        match res {
            Ok(Err(e)) => tracing::debug!(error = %e, "sftp pump ended"),
            Err(e) => tracing::warn!(error = %e, "sftp pump panicked"),
            Ok(Ok(())) => {}
        }
    }
}
