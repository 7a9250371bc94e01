//! User-facing I/O adapter: one uniform surface over an SSH channel and a
//! browser WebSocket.
//!
//! The two variants are a closed set; dispatch happens only at the sites
//! where the wire formats genuinely differ (tag wrapping and base64).

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{Error, Result};
use crate::proto::{InputFrame, OUTPUT};
use crate::relay::session::Session;

/// Byte stream handed in by the SSH front door.
pub trait RawIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawIo for T {}

pub enum UserIo {
    Ssh(SshIo),
    Ws(WsIo),
}

impl UserIo {
    pub fn kind(&self) -> &'static str {
        match self {
            UserIo::Ssh(_) => "ssh",
            UserIo::Ws(_) => "ws",
        }
    }

    /// Next chunk of user input bytes.
    ///
    /// The browser variant consumes control frames (RESIZE, PING) out of
    /// band and only ever returns DATA payloads.
    pub async fn read(&self, sess: &Session) -> Result<Bytes> {
        match self {
            UserIo::Ssh(io) => io.read().await,
            UserIo::Ws(io) => io.read(sess).await,
        }
    }

    /// Write terminal data to the user.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        match self {
            UserIo::Ssh(io) => io.write(data).await,
            UserIo::Ws(io) => io.write(data).await,
        }
    }

    /// Forward an already-tagged frame unchanged (browser) or strip the tag
    /// and write the remainder raw (SSH).
    pub async fn write_webtty(&self, frame: &[u8]) -> Result<()> {
        match self {
            UserIo::Ssh(io) => io.write(frame.get(1..).unwrap_or_default()).await,
            UserIo::Ws(io) => io.write_webtty(frame).await,
        }
    }

    pub async fn close(&self) {
        match self {
            UserIo::Ssh(io) => io.close().await,
            UserIo::Ws(io) => io.close().await,
        }
    }
}

// ── SSH ──────────────────────────────────────────────────────

pub struct SshIo {
    reader: Mutex<ReadHalf<Box<dyn RawIo>>>,
    writer: Mutex<WriteHalf<Box<dyn RawIo>>>,
}

impl SshIo {
    pub fn new(stream: impl RawIo + 'static) -> Self {
        let (reader, writer) = tokio::io::split(Box::new(stream) as Box<dyn RawIo>);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    async fn read(&self) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        let mut buf = [0u8; 1024];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::closed("user channel"));
        }
        Ok(Bytes::copy_from_slice(&buf[..n]))
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

// ── Browser WebSocket ────────────────────────────────────────

pub struct WsIo {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
}

impl WsIo {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    async fn read(&self, sess: &Session) -> Result<Bytes> {
        let mut stream = self.stream.lock().await;
        loop {
            let msg = stream
                .next()
                .await
                .ok_or_else(|| Error::closed("browser channel"))?
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;

            let raw: Bytes = match msg {
                Message::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
                Message::Binary(data) => data,
                Message::Close(_) => return Err(Error::closed("browser channel")),
                Message::Ping(_) | Message::Pong(_) => continue,
            };

            match InputFrame::decode(&raw)? {
                InputFrame::Resize(win) => {
                    sess.post_winch(win);
                }
                InputFrame::Ping => {
                    sess.forward_ping().await;
                }
                InputFrame::Data(payload) => return Ok(payload),
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut framed = String::with_capacity(1 + data.len() * 4 / 3 + 4);
        framed.push(OUTPUT as char);
        framed.push_str(&BASE64.encode(data));
        self.send(Message::Text(framed.into())).await
    }

    async fn write_webtty(&self, frame: &[u8]) -> Result<()> {
        // The browser side is a text channel; fall back to a binary message
        // for payloads that are not valid UTF-8.
        let msg = match std::str::from_utf8(frame) {
            Ok(text) => Message::Text(text.to_string().into()),
            Err(_) => Message::Binary(Bytes::copy_from_slice(frame)),
        };
        self.send(msg).await
    }

    async fn send(&self, msg: Message) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(msg)
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}
