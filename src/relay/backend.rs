//! Backend I/O adapter: a live tunnel to a container-exec bridge.
//!
//! Dials `ws://<node>:<port>/term` and speaks the one-byte-tag framing.
//! Frames on this hop ride in binary WebSocket messages; the bridge accepts
//! either text or binary.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};
use crate::proto::{self, InputFrame, WinSize};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and what to attach on the backend node.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub user: String,
    pub role: String,
    pub pod: String,
    pub container: String,
    pub node_host: String,
    pub node_port: u16,
    pub cmd: String,
}

pub struct Backend {
    target: BackendTarget,
    sftp: bool,
    connected: AtomicBool,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
}

impl Backend {
    pub fn new(target: BackendTarget) -> Self {
        let sftp = target.cmd.contains("sftp");
        Self {
            target,
            sftp,
            connected: AtomicBool::new(false),
            sink: Mutex::new(None),
            stream: Mutex::new(None),
        }
    }

    pub fn is_tty(&self) -> bool {
        !self.sftp
    }

    pub fn running(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn kind(&self) -> &'static str {
        "docker"
    }

    /// Open the framed channel to the exec bridge.
    pub async fn dial(&self) -> Result<()> {
        let mut url = url::Url::parse(&format!(
            "ws://{}:{}/term",
            self.target.node_host, self.target.node_port
        ))
        .map_err(|e| Error::Dial(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("pod", &self.target.pod)
            .append_pair("name", &self.target.container)
            .append_pair("user", &self.target.user)
            .append_pair("role", &self.target.role)
            .append_pair("cmd", &self.target.cmd);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Dial(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(proto::SUBPROTOCOL),
        );

        let (ws, _resp) = connect_async(request)
            .await
            .map_err(|e| Error::Dial(e.to_string()))?;
        tracing::info!(url = %url, "dialled backend");

        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(InputFrame::Ping.encode()).await
    }

    pub async fn resize(&self, win: WinSize) -> Result<()> {
        self.send(InputFrame::Resize(win).encode()).await
    }

    /// Send user data as one DATA frame.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.send(InputFrame::Data(Bytes::copy_from_slice(data)).encode())
            .await
    }

    /// Forward an already-framed message verbatim.
    pub async fn write_webtty(&self, frame: &[u8]) -> Result<()> {
        self.send(Bytes::copy_from_slice(frame)).await
    }

    /// Read one framed message.
    pub async fn read(&self) -> Result<Bytes> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| Error::closed("backend"))?;
        loop {
            let msg = stream
                .next()
                .await
                .ok_or_else(|| Error::closed("backend"))?
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            match msg {
                Message::Text(text) => return Ok(Bytes::copy_from_slice(text.as_bytes())),
                Message::Binary(data) => return Ok(data),
                Message::Close(_) => return Err(Error::closed("backend")),
                _ => continue,
            }
        }
    }

    /// Idempotent teardown of the tunnel.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        if let Some(mut s) = sink.take() {
            let _ = s.send(Message::Close(None)).await;
        }
        self.stream.lock().await.take();
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or_else(|| Error::closed("backend"))?;
        sink.send(Message::Binary(frame))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(cmd: &str) -> BackendTarget {
        BackendTarget {
            user: "ada".into(),
            role: "root".into(),
            pod: "p1".into(),
            container: "c0".into(),
            node_host: "localhost".into(),
            node_port: 2356,
            cmd: cmd.into(),
        }
    }

    #[test]
    fn sftp_derived_from_command() {
        assert!(Backend::new(target("bash")).is_tty());
        assert!(!Backend::new(target("/usr/lib/ssh/sftp-server")).is_tty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let backend = Backend::new(target("bash"));
        backend.close().await;
        backend.close().await;
        assert!(!backend.running());
        assert!(backend.read().await.is_err());
        assert!(backend.ping().await.is_err());
    }
}
