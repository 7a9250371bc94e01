//! Session engine: mode state machine, relay menu, and the pumps that
//! couple the user surface to a backend tunnel.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::api::{ApiClient, ContainerGroup};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::proto::{OutputFrame, WinSize};
use crate::relay::backend::{Backend, BackendTarget};
use crate::relay::editor::{Completer, Editor, ReadOutcome};
use crate::relay::user_io::UserIo;

const BOLD_MAGENTA: &str = "\x1b[1;35m";
const BOLD_BLUE: &str = "\x1b[1;34m";
const BOLD_YELLOW: &str = "\x1b[1;33m";
const BOLD_GREEN: &str = "\x1b[1;32m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

const CLEAR: &str = "\x1b[H\x1b[J";

fn paint(color: &str, text: &str) -> String {
    format!("{color}{text}{RESET}")
}

fn default_prompt(user: &str) -> String {
    format!(
        "{}@{} {} ",
        paint(BOLD_MAGENTA, user),
        paint(BOLD_BLUE, "gangway"),
        paint(BOLD_YELLOW, "\u{27a4}")
    )
}

/// The authenticated user behind a session.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Init = 0,
    Relay = 1,
    Tty = 2,
    RelayTty = 3,
    Sftp = 4,
}

impl Mode {
    fn from_u8(v: u8) -> Mode {
        match v {
            1 => Mode::Relay,
            2 => Mode::Tty,
            3 => Mode::RelayTty,
            4 => Mode::Sftp,
            _ => Mode::Init,
        }
    }
}

/// One connected user: the user surface, an optional backend tunnel, and the
/// window bookkeeping shared by both.
pub struct Session {
    user: User,
    cfg: Config,
    api: ApiClient,
    uio: UserIo,
    mode: AtomicU8,
    win: std::sync::Mutex<WinSize>,
    winch_tx: watch::Sender<WinSize>,
    /// Guards installation and disposal of the backend tunnel.
    bio: Mutex<Option<Arc<Backend>>>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(user: User, uio: UserIo, api: ApiClient, cfg: Config, win: WinSize) -> Arc<Self> {
        let (winch_tx, _) = watch::channel(win);
        Arc::new(Self {
            user,
            cfg,
            api,
            uio,
            mode: AtomicU8::new(Mode::Init as u8),
            win: std::sync::Mutex::new(win),
            winch_tx,
            bio: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn uio(&self) -> &UserIo {
        &self.uio
    }

    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    fn set_mode(&self, mode: Mode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    pub fn window(&self) -> WinSize {
        *self.win.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Publish a window change. The slot keeps only the most recent value
    /// and never blocks the producer.
    pub fn post_winch(&self, win: WinSize) {
        *self.win.lock().unwrap_or_else(|p| p.into_inner()) = win;
        self.winch_tx.send_replace(win);
    }

    pub fn winch_subscribe(&self) -> watch::Receiver<WinSize> {
        self.winch_tx.subscribe()
    }

    /// Forward one PING to the current backend, if it is the
    /// container-exec kind. No queueing, no PONG relayed upstream.
    pub async fn forward_ping(&self) {
        let slot = self.bio.lock().await;
        if let Some(bio) = slot.as_ref() {
            if bio.kind() == "docker" && bio.running() {
                let _ = bio.ping().await;
            }
        }
    }

    async fn resize_bio(&self, win: WinSize) {
        let slot = self.bio.lock().await;
        if let Some(bio) = slot.as_ref() {
            let _ = bio.resize(win).await;
        }
    }

    async fn install_bio(&self, bio: Arc<Backend>) {
        let mut slot = self.bio.lock().await;
        if let Some(old) = slot.take() {
            old.close().await;
        }
        *slot = Some(bio);
    }

    /// Close and detach the backend tunnel. Safe to call repeatedly.
    pub async fn close_bio(&self) {
        let mut slot = self.bio.lock().await;
        if let Some(bio) = slot.take() {
            bio.close().await;
        }
    }

    /// Final teardown of the user side.
    pub async fn close_uio(&self) {
        self.cancel.cancel();
        self.uio.close().await;
    }

    // ── Relay menu ───────────────────────────────────────────

    pub async fn relay(self: Arc<Self>) {
        if let Err(e) = self.clone().relay_menu().await {
            tracing::debug!(user = %self.user.name, error = %e, "relay session ended");
        }
        self.close_bio().await;
        self.close_uio().await;
    }

    async fn relay_menu(self: Arc<Self>) -> Result<()> {
        self.set_mode(Mode::Relay);
        let mut editor = Editor::new(Completer::menu());
        editor.set_prompt(default_prompt(&self.user.name));

        self.uio
            .write(
                format!(
                    "\r\nwelcome, {}!\r\n\r\n",
                    paint(BOLD_MAGENTA, &self.user.name)
                )
                .as_bytes(),
            )
            .await?;
        self.uio
            .write(paint(GREEN, "# type `help` to get started!\r\n").as_bytes())
            .await?;

        let mut groups = self.fetch_inventory().await;

        loop {
            let line = match editor.read_line(&self).await? {
                ReadOutcome::Line(line) => line,
                ReadOutcome::Interrupt(current) => {
                    if current.is_empty() {
                        break;
                    }
                    continue;
                }
                ReadOutcome::Eof => break,
            };
            let line = line.trim().to_string();

            if !groups.is_empty() {
                if let Some(selection) = parse_selection(&line) {
                    match resolve_selection(&groups, selection) {
                        Ok((group, container)) => {
                            self.set_mode(Mode::RelayTty);
                            let target = BackendTarget {
                                user: self.user.name.clone(),
                                role: "root".into(),
                                pod: group.pod.clone(),
                                container: container.to_string(),
                                node_host: group.node.clone(),
                                node_port: self.cfg.backend_port,
                                cmd: "bash".into(),
                            };
                            self.clone().enter_tty(target).await;
                        }
                        Err(_) => {
                            self.uio.write(b"invalid id\r\n").await?;
                        }
                    }
                    continue;
                }
            }

            match line.as_str() {
                "help" => {
                    self.uio.write(b"\rcommands:\r\n").await?;
                    self.uio
                        .write(editor.completer().tree("    ").as_bytes())
                        .await?;
                    self.uio.write(b"\r\n").await?;
                }
                "list" | "list pod" => {
                    self.uio.write(b"\r").await?;
                    groups = self.fetch_inventory().await;
                    self.uio.write(render_inventory(&groups).as_bytes()).await?;
                }
                "login" => {
                    if let Some(password) = editor
                        .read_password(&self, "please enter your password: ")
                        .await?
                    {
                        self.uio
                            .write(format!("you enter:{password:?}\r\n").as_bytes())
                            .await?;
                    }
                }
                "clear" => {
                    self.uio.write(CLEAR.as_bytes()).await?;
                }
                "exit" => {
                    self.uio.write(b"\r").await?;
                    break;
                }
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(4)).await;
                }
                "" => {}
                _ if line.starts_with("goto ") => {
                    let name = line["goto ".len()..].trim().to_string();
                    if name.is_empty() {
                        self.uio.write(b"invalid id\r\n").await?;
                        continue;
                    }
                    self.set_mode(Mode::RelayTty);
                    let target = BackendTarget {
                        user: self.user.name.clone(),
                        role: "root".into(),
                        pod: String::new(),
                        container: name,
                        node_host: "localhost".into(),
                        node_port: self.cfg.backend_port,
                        cmd: "bash".into(),
                    };
                    self.clone().enter_tty(target).await;
                }
                _ if line.starts_with("setprompt ") => {
                    editor.set_prompt(line["setprompt ".len()..].to_string());
                }
                _ => {
                    self.uio
                        .write(format!("\r>>>> {line:?}\n").as_bytes())
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn fetch_inventory(&self) -> Vec<ContainerGroup> {
        match self.api.user_pods(&self.user.name).await {
            Ok(groups) => groups,
            Err(e) => {
                tracing::warn!(user = %self.user.name, error = %e, "inventory fetch failed");
                Vec::new()
            }
        }
    }

    // ── TTY / SFTP pass-through ──────────────────────────────

    /// Direct TTY entry from a front door that already names its target.
    pub async fn tty(self: Arc<Self>, target: BackendTarget) {
        self.set_mode(Mode::Tty);
        self.clone().enter_tty(target).await;
        self.close_uio().await;
    }

    /// File-transfer pass-through for the `sftp` subsystem.
    pub async fn sftp(self: Arc<Self>) {
        self.set_mode(Mode::Sftp);
        let target = BackendTarget {
            user: "root".into(),
            role: "root".into(),
            pod: self.user.name.clone(),
            container: "data".into(),
            node_host: self.cfg.sftp_node.clone(),
            node_port: self.cfg.backend_port,
            cmd: self.cfg.sftp_cmd.clone(),
        };
        let bio = Arc::new(Backend::new(target));
        if let Err(e) = bio.dial().await {
            let _ = self
                .uio
                .write(format!("error:{}", dial_text(&e)).as_bytes())
                .await;
            self.close_uio().await;
            return;
        }
        self.install_bio(bio.clone()).await;
        self.run_pumps(bio).await;
        self.close_uio().await;
    }

    /// Dial the target, announce, wake the remote shell, and run both pumps
    /// until either side closes. Always leaves the session back in Relay.
    async fn enter_tty(self: Arc<Self>, target: BackendTarget) {
        let announce = if target.pod.is_empty() {
            format!("{}@{}", target.container, target.node_host)
        } else {
            format!("{}:{}@{}", target.pod, target.container, target.node_host)
        };

        let bio = Arc::new(Backend::new(target));
        if let Err(e) = bio.dial().await {
            let _ = self
                .uio
                .write(format!("\rlogin error: {}\r\n", dial_text(&e)).as_bytes())
                .await;
            bio.close().await;
            self.set_mode(Mode::Relay);
            return;
        }
        let _ = self
            .uio
            .write(format!("\rlogin to {announce}\r\n").as_bytes())
            .await;

        self.install_bio(bio.clone()).await;

        // Wake the remote shell; the bridge consumes this first frame.
        let _ = bio.write(b"\n").await;

        let winch_sess = self.clone();
        let winch_task = tokio::spawn(async move {
            let mut rx = winch_sess.winch_subscribe();
            while rx.changed().await.is_ok() {
                let win = *rx.borrow_and_update();
                winch_sess.resize_bio(win).await;
            }
        });

        self.run_pumps(bio).await;

        winch_task.abort();
        self.set_mode(Mode::Relay);
    }

    /// Run both pumps; the first to finish wins and the backend is closed
    /// exactly once. The losing pump is cancelled by dropping it.
    async fn run_pumps(&self, bio: Arc<Backend>) {
        let up = self.pump_user_to_backend(bio.clone());
        let down = self.pump_backend_to_user(bio.clone());
        tokio::pin!(up);
        tokio::pin!(down);

        let first: Result<()> = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::closed("session")),
            r = &mut up => r,
            r = &mut down => r,
        };
        if let Err(e) = first {
            tracing::debug!(user = %self.user.name, error = %e, "pump finished");
        }
        self.close_bio().await;
    }

    /// user surface -> backend tunnel.
    async fn pump_user_to_backend(&self, bio: Arc<Backend>) -> Result<()> {
        loop {
            let data = self.uio.read(self).await?;
            if self.mode() == Mode::Sftp {
                // Preserve the caller's framing; a non-sftp backend on a
                // file-transfer session gets nothing.
                if self.uio.kind() == "ws" || !bio.is_tty() {
                    bio.write_webtty(&data).await?;
                }
            } else {
                bio.write(&data).await?;
            }
        }
    }

    /// backend tunnel -> user surface.
    async fn pump_backend_to_user(&self, bio: Arc<Backend>) -> Result<()> {
        let mut sized = false;
        loop {
            let frame = bio.read().await?;

            // The exec is attached once the first frame arrives; only then
            // may the initial window be applied.
            if !sized {
                sized = true;
                if bio.is_tty() {
                    let _ = bio.resize(self.window()).await;
                }
            }

            if self.mode() == Mode::Sftp {
                match self.uio.kind() {
                    "ws" => self.uio.write_webtty(&frame).await?,
                    _ => self.uio.write(&frame).await?,
                }
                continue;
            }

            match self.uio.kind() {
                "ws" => self.uio.write_webtty(&frame).await?,
                _ => match OutputFrame::decode(&frame)? {
                    OutputFrame::Data(payload) => {
                        let raw = BASE64
                            .decode(&payload)
                            .map_err(|e| Error::Protocol(format!("bad data payload: {e}")))?;
                        self.uio.write(&raw).await?;
                    }
                    // Pong and UI preferences mean nothing on a raw tty.
                    _ => {}
                },
            }
        }
    }
}

fn dial_text(e: &Error) -> String {
    match e {
        Error::Dial(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// Parse a `g` or `g.c` menu selection. Anything non-numeric is `None` so it
/// falls through to the plain command grammar.
fn parse_selection(line: &str) -> Option<(usize, usize)> {
    let s = line.trim();
    if s.is_empty() {
        return None;
    }
    let (group, container) = match s.split_once('.') {
        None => (s, None),
        Some((g, c)) => (g, Some(c)),
    };
    if group.is_empty() || !group.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let g: usize = group.parse().ok()?;
    let c = match container {
        None => 0,
        Some(c) if !c.is_empty() && c.bytes().all(|b| b.is_ascii_digit()) => c.parse().ok()?,
        Some(_) => return None,
    };
    Some((g, c))
}

/// Validate a selection: groups are 1-based, containers 0-based.
fn resolve_selection(
    groups: &[ContainerGroup],
    (g, c): (usize, usize),
) -> Result<(&ContainerGroup, &str)> {
    if g < 1 || g > groups.len() {
        return Err(Error::InvalidInput);
    }
    let group = &groups[g - 1];
    let container = group.containers.get(c).ok_or(Error::InvalidInput)?;
    Ok((group, container))
}

fn render_inventory(groups: &[ContainerGroup]) -> String {
    let mut out = String::new();
    for (i, group) in groups.iter().enumerate() {
        if group.containers.is_empty() {
            continue;
        }
        let g = (i + 1).to_string();
        out.push_str(&format!(
            "\r{}) {}@{} \u{1f433}\n",
            paint(BOLD_GREEN, &g),
            paint(BOLD_MAGENTA, &group.pod),
            paint(BOLD_BLUE, &group.node),
        ));
        for (c, name) in group.containers.iter().enumerate() {
            out.push_str(&format!(
                "\r    {}.{}) {}\n",
                paint(BOLD_GREEN, &g),
                paint(BOLD_GREEN, &c.to_string()),
                paint(RED, name),
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::sign::FormData;
    use crate::proto;
    use crate::relay::user_io::SshIo;

    use axum::extract::ws::{Message, WebSocketUpgrade};
    use axum::extract::{RawQuery, State};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    const SECRET: &str = "testsecret";

    fn group(pod: &str, node: &str, containers: &[&str]) -> ContainerGroup {
        ContainerGroup {
            pod: pod.into(),
            node: node.into(),
            containers: containers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn selection_parsing() {
        assert_eq!(parse_selection("1"), Some((1, 0)));
        assert_eq!(parse_selection(" 2.3 "), Some((2, 3)));
        assert_eq!(parse_selection("10.0"), Some((10, 0)));
        assert_eq!(parse_selection(""), None);
        assert_eq!(parse_selection("1."), None);
        assert_eq!(parse_selection(".1"), None);
        assert_eq!(parse_selection("1.2.3"), None);
        assert_eq!(parse_selection("1a"), None);
        assert_eq!(parse_selection("goto"), None);
    }

    #[test]
    fn selection_bounds() {
        let groups = vec![group("p1", "n1", &["c0", "c1"])];
        assert!(resolve_selection(&groups, (1, 0)).is_ok());
        assert!(resolve_selection(&groups, (1, 1)).is_ok());
        assert!(resolve_selection(&groups, (0, 0)).is_err());
        assert!(resolve_selection(&groups, (2, 0)).is_err());
        assert!(resolve_selection(&groups, (1, 2)).is_err());
    }

    // ── In-process front-to-back menu scenario ───────────────

    async fn spawn_http(router: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    async fn pods_handler(RawQuery(query): RawQuery) -> impl IntoResponse {
        let form = FormData::from_query(query.as_deref().unwrap_or(""));
        if !form.check(SECRET) {
            return (axum::http::StatusCode::FORBIDDEN, "bad token").into_response();
        }
        axum::Json(serde_json::json!({
            "error": 0,
            "msg": "ok",
            "data": [
                {"pod_name": "p1", "node_name": "127.0.0.1", "container_name": ["c0", "c1"]}
            ]
        }))
        .into_response()
    }

    #[derive(Clone)]
    struct Probe {
        tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
    }

    async fn term_handler(
        State(probe): State<Probe>,
        RawQuery(query): RawQuery,
        ws: WebSocketUpgrade,
    ) -> impl IntoResponse {
        ws.protocols([proto::SUBPROTOCOL])
            .on_upgrade(move |mut socket| async move {
                let wake = match socket.recv().await {
                    Some(Ok(Message::Binary(b))) => b.to_vec(),
                    Some(Ok(Message::Text(t))) => t.as_bytes().to_vec(),
                    _ => Vec::new(),
                };
                let _ = probe.tx.send((query.unwrap_or_default(), wake));
                let hello = format!("1{}", BASE64.encode(b"hello from c1"));
                let _ = socket.send(Message::Text(hello.into())).await;
            })
    }

    async fn read_until(client: &mut DuplexStream, needle: &str, seen: &mut Vec<u8>) {
        let deadline = Duration::from_secs(5);
        loop {
            if String::from_utf8_lossy(seen).contains(needle) {
                return;
            }
            let mut buf = [0u8; 1024];
            let n = tokio::time::timeout(deadline, client.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"))
                .expect("user side read");
            assert!(n > 0, "eof while waiting for {needle:?}");
            seen.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn menu_list_pick_and_recover() {
        let api_addr = spawn_http(Router::new().route("/userinfo/pods", get(pods_handler))).await;

        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();
        let backend_addr = spawn_http(
            Router::new()
                .route("/term", get(term_handler))
                .with_state(Probe { tx: probe_tx }),
        )
        .await;

        let cfg = Config {
            api_base: format!("http://{api_addr}"),
            api_secret: SECRET.into(),
            backend_port: backend_addr.port(),
            host_key_path: "./conf/server.id_rsa".into(),
            sftp_node: "localhost".into(),
            sftp_cmd: "/usr/lib/ssh/sftp-server".into(),
        };
        let api = ApiClient::new(cfg.api_base.clone(), cfg.api_secret.clone()).unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        let sess = Session::new(
            User { id: None, name: "ada".into() },
            UserIo::Ssh(SshIo::new(server)),
            api,
            cfg,
            WinSize::new(80, 24),
        );
        let relay = tokio::spawn(sess.clone().relay());

        let mut seen = Vec::new();
        read_until(&mut client, "welcome", &mut seen).await;
        read_until(&mut client, "\u{27a4}", &mut seen).await;

        // Out-of-range group: inline error, menu stays up.
        client.write_all(b"2\r").await.unwrap();
        read_until(&mut client, "invalid id", &mut seen).await;

        // list renders the fetched inventory.
        client.write_all(b"list\r").await.unwrap();
        read_until(&mut client, "c1", &mut seen).await;

        // Pick group 1, container 1: dial, announce, pass through, recover.
        client.write_all(b"1.1\r").await.unwrap();
        read_until(&mut client, "login to p1:c1@127.0.0.1", &mut seen).await;

        let (query, wake) = probe_rx.recv().await.expect("backend dialled");
        for expect in [
            "pod=p1",
            "name=c1",
            "user=ada",
            "role=root",
            "cmd=bash",
        ] {
            assert!(query.contains(expect), "query {query:?} missing {expect}");
        }
        assert_eq!(wake, b"1\n".to_vec());

        // Backend output reaches the user decoded, then the menu recovers.
        read_until(&mut client, "hello from c1", &mut seen).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while sess.mode() != Mode::Relay {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session returned to the menu");

        client.write_all(b"exit\r").await.unwrap();
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_command_echoes_quoted() {
        // No lookup service: inventory is empty and digits fall through.
        let cfg = Config {
            api_base: "http://127.0.0.1:1".into(),
            api_secret: SECRET.into(),
            backend_port: 1,
            host_key_path: "./conf/server.id_rsa".into(),
            sftp_node: "localhost".into(),
            sftp_cmd: "/usr/lib/ssh/sftp-server".into(),
        };
        let api = ApiClient::new(cfg.api_base.clone(), cfg.api_secret.clone()).unwrap();
        let (mut client, server) = tokio::io::duplex(4096);
        let sess = Session::new(
            User { id: None, name: "ada".into() },
            UserIo::Ssh(SshIo::new(server)),
            api,
            cfg,
            WinSize::new(80, 24),
        );
        let relay = tokio::spawn(sess.clone().relay());

        let mut seen = Vec::new();
        read_until(&mut client, "\u{27a4}", &mut seen).await;

        client.write_all(b"frobnicate\r").await.unwrap();
        read_until(&mut client, ">>>> \"frobnicate\"", &mut seen).await;

        client.write_all(b"help\r").await.unwrap();
        read_until(&mut client, "commands:", &mut seen).await;
        read_until(&mut client, "list", &mut seen).await;

        client.write_all(b"exit\r").await.unwrap();
        relay.await.unwrap();
    }
}
