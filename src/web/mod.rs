//! Browser front door: `/ws` framed sessions, `/key` keypair minting, and a
//! minimal index page.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{ApiClient, FormData};
use crate::config::Config;
use crate::proto::{self, WinSize};
use crate::relay::backend::BackendTarget;
use crate::relay::session::{Session, User};
use crate::relay::user_io::{UserIo, WsIo};

const INDEX_HTML: &str = include_str!("../../assets/index.html");

struct WebState {
    cfg: Config,
    api: ApiClient,
}

pub async fn serve(addr: &str, cfg: Config) -> anyhow::Result<()> {
    let api = ApiClient::new(cfg.api_base.clone(), cfg.api_secret.clone())?;
    let state = Arc::new(WebState { cfg, api });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/key", get(key_handler))
        .route("/", get(index_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "web front door listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ── /ws ──────────────────────────────────────────────────────

/// First message on the channel: a JSON object whose `Arguments` field is a
/// URL-query string, optionally prefixed with `?`.
#[derive(Debug, Deserialize)]
struct InitMessage {
    #[serde(rename = "Arguments", default)]
    arguments: String,
}

async fn ws_handler(State(state): State<Arc<WebState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.protocols([proto::SUBPROTOCOL])
        .on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: Arc<WebState>) {
    let raw = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text.to_string(),
        Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
        _ => return,
    };
    let init: InitMessage = match serde_json::from_str(&raw) {
        Ok(init) => init,
        Err(e) => {
            tracing::debug!(error = %e, "malformed init message");
            return;
        }
    };
    let form = FormData::from_query(init.arguments.trim_start_matches('?'));

    // With a shared secret configured the token must verify; otherwise it
    // only has to be present.
    if state.cfg.api_secret.is_empty() {
        if form.get("token").unwrap_or_default().is_empty() {
            return;
        }
    } else if let Err(e) = form.verify(&state.cfg.api_secret) {
        tracing::warn!(error = %e, "ws session rejected");
        return;
    }

    let user = match form.get("user") {
        Some(user) if !user.is_empty() => user.to_string(),
        _ => return,
    };
    let uid = form.get("uid").and_then(|v| v.parse::<i64>().ok());
    let role = param_or(&form, "role", "root");
    let cmd = param_or(&form, "cmd", "bash");
    let host = param_or(&form, "host", "localhost");
    let pod = form.get("pod").unwrap_or_default().to_string();
    let name = form
        .get("name")
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    tracing::info!(user = %user, name = ?name, "ws session");

    let sess = Session::new(
        User {
            id: uid,
            name: user.clone(),
        },
        UserIo::Ws(WsIo::new(socket)),
        state.api.clone(),
        state.cfg.clone(),
        WinSize::default(),
    );

    match name {
        Some(container) => {
            sess.tty(BackendTarget {
                user,
                role,
                pod,
                container,
                node_host: host,
                node_port: state.cfg.backend_port,
                cmd,
            })
            .await;
        }
        None => sess.relay().await,
    }
}

fn param_or(form: &FormData, key: &str, default: &str) -> String {
    match form.get(key) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => default.to_string(),
    }
}

// ── /key ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct KeyPairResponse {
    #[serde(rename = "PrivateKey")]
    private_key: String,
    #[serde(rename = "PublicKey")]
    public_key: String,
}

async fn key_handler() -> axum::response::Response {
    match tokio::task::spawn_blocking(generate_keypair).await {
        Ok(Ok(pair)) => axum::Json(pair).into_response(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "key generation failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "key generation task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn generate_keypair() -> anyhow::Result<KeyPairResponse> {
    use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
    use russh::keys::ssh_key::{LineEnding, PrivateKey};

    let mut rng = rand::rand_core::UnwrapErr(rand::rngs::SysRng);
    let rsa = RsaKeypair::random(&mut rng, 4096)?;
    let key = PrivateKey::new(KeypairData::Rsa(rsa), "gangway")?;
    Ok(KeyPairResponse {
        private_key: key.to_openssh(LineEnding::LF)?.to_string(),
        public_key: key.public_key().to_openssh()?,
    })
}

// ── / ────────────────────────────────────────────────────────

async fn index_handler(headers: HeaderMap) -> Html<String> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost:9999");
    Html(INDEX_HTML.replace("{{ws_url}}", &format!("ws://{host}/ws")))
}
