//! Minimal line editor for the relay menu.
//!
//! Runs over the user I/O surface in raw mode: echoes printable input,
//! handles backspace / kill-line / interrupt / EOF, tab-completes against a
//! prefix tree, and redraws on window-width changes. Arrow keys and other
//! CSI sequences are swallowed. Type-ahead beyond a line terminator is kept
//! for the next read.

use std::collections::VecDeque;

use crate::error::Result;
use crate::relay::session::Session;

const ERASE_CHAR: &[u8] = b"\x08 \x08";
const ERASE_LINE: &[u8] = b"\r\x1b[K";

/// What a `read_line` call ended with.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    /// Ctrl-C; carries the buffer content at the time of the interrupt.
    Interrupt(String),
    Eof,
}

/// Static command tree used for completion and the `help` rendering.
pub struct Completer {
    items: Vec<Node>,
}

struct Node {
    word: &'static str,
    children: Vec<&'static str>,
}

impl Completer {
    /// The relay menu command tree.
    pub fn menu() -> Self {
        Self {
            items: vec![
                Node { word: "help", children: vec![] },
                Node { word: "list", children: vec!["pod"] },
                Node { word: "exit", children: vec![] },
            ],
        }
    }

    /// Full-line replacements for the current input.
    pub fn candidates(&self, line: &str) -> Vec<String> {
        let line = line.trim_start();
        match line.split_once(char::is_whitespace) {
            None => self
                .items
                .iter()
                .filter(|n| n.word.starts_with(line))
                .map(|n| n.word.to_string())
                .collect(),
            Some((first, rest)) => {
                let rest = rest.trim_start();
                self.items
                    .iter()
                    .find(|n| n.word == first)
                    .map(|n| {
                        n.children
                            .iter()
                            .filter(|c| c.starts_with(rest))
                            .map(|c| format!("{first} {c}"))
                            .collect()
                    })
                    .unwrap_or_default()
            }
        }
    }

    /// Render the command tree, one word per line, children indented.
    pub fn tree(&self, indent: &str) -> String {
        let mut out = String::new();
        for node in &self.items {
            out.push_str(indent);
            out.push_str(node.word);
            out.push_str("\r\n");
            for child in &node.children {
                out.push_str(indent);
                out.push_str(indent);
                out.push_str(child);
                out.push_str("\r\n");
            }
        }
        out
    }
}

/// Escape-sequence skipping state.
#[derive(Clone, Copy, PartialEq)]
enum Esc {
    None,
    Started,
    Csi,
}

pub struct Editor {
    prompt: String,
    completer: Completer,
    /// Bytes read from the user but not yet consumed by a line.
    pending: VecDeque<u8>,
}

impl Editor {
    pub fn new(completer: Completer) -> Self {
        Self {
            prompt: String::new(),
            completer,
            pending: VecDeque::new(),
        }
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = prompt.into();
    }

    pub fn completer(&self) -> &Completer {
        &self.completer
    }

    /// Next input byte, refilling from the user surface. Window changes are
    /// observed between bytes and redraw the current line.
    async fn next_byte(
        &mut self,
        sess: &Session,
        winch: &mut tokio::sync::watch::Receiver<crate::proto::WinSize>,
        buf: &[u8],
    ) -> Result<u8> {
        loop {
            if let Some(b) = self.pending.pop_front() {
                return Ok(b);
            }
            tokio::select! {
                changed = winch.changed() => {
                    if changed.is_ok() {
                        winch.borrow_and_update();
                        self.redraw(sess, buf).await?;
                    }
                    // A dropped sender stops winch delivery; keep reading.
                    if changed.is_err() {
                        let chunk = sess.uio().read(sess).await?;
                        self.pending.extend(chunk.iter().copied());
                    }
                }
                chunk = sess.uio().read(sess) => {
                    self.pending.extend(chunk?.iter().copied());
                }
            }
        }
    }

    /// Read one line of input, driving echo, editing, and completion.
    pub async fn read_line(&mut self, sess: &Session) -> Result<ReadOutcome> {
        let uio = sess.uio();
        uio.write(format!("\r{}", self.prompt).as_bytes()).await?;

        let mut buf: Vec<u8> = Vec::new();
        let mut esc = Esc::None;
        let mut winch = sess.winch_subscribe();

        loop {
            let b = self.next_byte(sess, &mut winch, &buf).await?;
            match esc {
                Esc::Started => {
                    esc = if b == b'[' { Esc::Csi } else { Esc::None };
                    continue;
                }
                Esc::Csi => {
                    if (0x40..=0x7e).contains(&b) {
                        esc = Esc::None;
                    }
                    continue;
                }
                Esc::None => {}
            }
            match b {
                b'\r' | b'\n' => {
                    uio.write(b"\r\n").await?;
                    return Ok(ReadOutcome::Line(String::from_utf8_lossy(&buf).into_owned()));
                }
                0x03 => {
                    uio.write(b"^C\r\n").await?;
                    return Ok(ReadOutcome::Interrupt(
                        String::from_utf8_lossy(&buf).into_owned(),
                    ));
                }
                0x04 => {
                    if buf.is_empty() {
                        uio.write(b"\r\n").await?;
                        return Ok(ReadOutcome::Eof);
                    }
                }
                0x09 => {
                    self.complete(sess, &mut buf).await?;
                }
                0x7f | 0x08 => {
                    if buf.pop().is_some() {
                        uio.write(ERASE_CHAR).await?;
                    }
                }
                0x15 => {
                    buf.clear();
                    self.redraw(sess, &buf).await?;
                }
                0x1b => esc = Esc::Started,
                _ if b >= 0x20 => {
                    buf.push(b);
                    uio.write(&[b]).await?;
                }
                _ => {}
            }
        }
    }

    /// Prompt for a secret; echoes a mask character per byte.
    /// Returns `None` on interrupt or EOF.
    pub async fn read_password(&mut self, sess: &Session, prompt: &str) -> Result<Option<String>> {
        let uio = sess.uio();
        uio.write(format!("\r{prompt}").as_bytes()).await?;

        let mut buf: Vec<u8> = Vec::new();
        let mut winch = sess.winch_subscribe();
        loop {
            let b = self.next_byte(sess, &mut winch, &[]).await?;
            match b {
                b'\r' | b'\n' => {
                    uio.write(b"\r\n").await?;
                    return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
                }
                0x03 | 0x04 => {
                    uio.write(b"\r\n").await?;
                    return Ok(None);
                }
                0x7f | 0x08 => {
                    if buf.pop().is_some() {
                        uio.write(ERASE_CHAR).await?;
                    }
                }
                _ if b >= 0x20 => {
                    buf.push(b);
                    uio.write(b"*").await?;
                }
                _ => {}
            }
        }
    }

    async fn complete(&self, sess: &Session, buf: &mut Vec<u8>) -> Result<()> {
        let line = String::from_utf8_lossy(buf).into_owned();
        let candidates = self.completer.candidates(&line);
        let uio = sess.uio();
        match candidates.len() {
            0 => uio.write(b"\x07").await,
            1 => {
                *buf = candidates[0].clone().into_bytes();
                self.redraw(sess, buf).await
            }
            _ => {
                let mut listing = String::from("\r\n");
                for c in &candidates {
                    listing.push_str(c);
                    listing.push_str("    ");
                }
                listing.push_str("\r\n");
                uio.write(listing.as_bytes()).await?;
                self.redraw(sess, buf).await
            }
        }
    }

    /// Re-render the prompt and the tail of the buffer that fits the width.
    async fn redraw(&self, sess: &Session, buf: &[u8]) -> Result<()> {
        let width = sess.window().columns.max(8) as usize;
        let avail = width.saturating_sub(visible_len(&self.prompt) + 1);
        let shown = &buf[buf.len().saturating_sub(avail)..];

        let mut out = Vec::with_capacity(ERASE_LINE.len() + self.prompt.len() + shown.len());
        out.extend_from_slice(ERASE_LINE);
        out.extend_from_slice(self.prompt.as_bytes());
        out.extend_from_slice(shown);
        sess.uio().write(&out).await
    }
}

/// Display width of a prompt, ignoring SGR escape sequences.
fn visible_len(s: &str) -> usize {
    let mut len = 0usize;
    let mut esc = Esc::None;
    for b in s.bytes() {
        match esc {
            Esc::Started => esc = if b == b'[' { Esc::Csi } else { Esc::None },
            Esc::Csi => {
                if (0x40..=0x7e).contains(&b) {
                    esc = Esc::None;
                }
            }
            Esc::None => {
                if b == 0x1b {
                    esc = Esc::Started;
                } else if b < 0x80 || b >= 0xc0 {
                    // count code points, not continuation bytes
                    len += 1;
                }
            }
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::config::Config;
    use crate::proto::WinSize;
    use crate::relay::session::{Session, User};
    use crate::relay::user_io::{SshIo, UserIo};

    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[test]
    fn menu_candidates() {
        let c = Completer::menu();
        assert_eq!(c.candidates(""), vec!["help", "list", "exit"]);
        assert_eq!(c.candidates("he"), vec!["help"]);
        assert_eq!(c.candidates("list p"), vec!["list pod"]);
        assert!(c.candidates("nope").is_empty());
        assert!(c.candidates("goto x").is_empty());
    }

    #[test]
    fn tree_rendering() {
        let tree = Completer::menu().tree("    ");
        assert_eq!(tree, "    help\r\n    list\r\n        pod\r\n    exit\r\n");
    }

    #[test]
    fn visible_len_ignores_sgr() {
        assert_eq!(visible_len("plain"), 5);
        assert_eq!(visible_len("\x1b[1;35mada\x1b[0m"), 3);
        assert_eq!(visible_len("\x1b[1;33m\u{27a4}\x1b[0m "), 2);
    }

    fn session_over_duplex() -> (DuplexStream, Arc<Session>) {
        let cfg = Config {
            api_base: String::new(),
            api_secret: String::new(),
            backend_port: 1,
            host_key_path: "./conf/server.id_rsa".into(),
            sftp_node: "localhost".into(),
            sftp_cmd: "/usr/lib/ssh/sftp-server".into(),
        };
        let api = ApiClient::new("", "").unwrap();
        let (client, server) = tokio::io::duplex(1024);
        let sess = Session::new(
            User { id: None, name: "t".into() },
            UserIo::Ssh(SshIo::new(server)),
            api,
            cfg,
            WinSize::new(80, 24),
        );
        (client, sess)
    }

    #[tokio::test]
    async fn editing_completion_and_interrupt() {
        let (mut client, sess) = session_over_duplex();

        let mut task = tokio::spawn({
            let sess = sess.clone();
            async move {
                let mut editor = Editor::new(Completer::menu());
                editor.set_prompt("> ");
                let a = editor.read_line(&sess).await.unwrap();
                let b = editor.read_line(&sess).await.unwrap();
                let c = editor.read_line(&sess).await.unwrap();
                (a, b, c)
            }
        });

        // Backspace editing, tab completion, and an interrupt on an empty
        // line, written in one burst to exercise type-ahead buffering.
        client.write_all(b"exot\x7f\x7fit\rhe\t\r\x03").await.unwrap();

        // Drain echoes so the editor is never blocked on a full pipe.
        let mut sink = vec![0u8; 1024];
        let (a, b, c) = loop {
            tokio::select! {
                n = client.read(&mut sink) => {
                    assert!(n.unwrap() > 0);
                }
                joined = &mut task => {
                    break joined.unwrap();
                }
            }
        };

        assert_eq!(a, ReadOutcome::Line("exit".into()));
        assert_eq!(b, ReadOutcome::Line("help".into()));
        assert_eq!(c, ReadOutcome::Interrupt(String::new()));
    }

    #[tokio::test]
    async fn eof_on_ctrl_d() {
        let (mut client, sess) = session_over_duplex();
        let task = tokio::spawn({
            let sess = sess.clone();
            async move {
                let mut editor = Editor::new(Completer::menu());
                editor.read_line(&sess).await.unwrap()
            }
        });
        client.write_all(b"\x04").await.unwrap();
        assert_eq!(task.await.unwrap(), ReadOutcome::Eof);
    }
}
