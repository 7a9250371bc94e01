//! SSH front door: public-key auth against the key lookup service, then a
//! relay-menu session for PTY clients or file-transfer pass-through for the
//! `sftp` subsystem. Anything else exits with status 1.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PublicKey;
use russh::server::{Auth, Config as SshConfig, Handler, Msg, Server, Session as SshSession};
use russh::{Channel, ChannelId, Pty};

use crate::api::ApiClient;
use crate::config::Config;
use crate::proto::WinSize;
use crate::relay::session::{Session, User};
use crate::relay::user_io::{SshIo, UserIo};

pub async fn serve(ip: &str, cfg: Config) -> anyhow::Result<()> {
    let key = russh::keys::load_secret_key(&cfg.host_key_path, None)?;
    let api = ApiClient::new(cfg.api_base.clone(), cfg.api_secret.clone())?;

    let ssh_config = Arc::new(SshConfig {
        keys: vec![key],
        auth_rejection_time: Duration::from_secs(1),
        inactivity_timeout: None,
        ..Default::default()
    });

    let mut listener = Listener { cfg, api };
    tracing::info!(ip = %ip, "ssh relay listening on port 22");
    listener.run_on_address(ssh_config, (ip, 22)).await?;
    Ok(())
}

#[derive(Clone)]
struct Listener {
    cfg: Config,
    api: ApiClient,
}

impl Server for Listener {
    type Handler = Door;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> Door {
        Door {
            cfg: self.cfg.clone(),
            api: self.api.clone(),
            peer,
            username: String::new(),
            channel: None,
            win: WinSize::default(),
            sess: None,
        }
    }
}

struct Door {
    cfg: Config,
    api: ApiClient,
    peer: Option<SocketAddr>,
    username: String,
    channel: Option<Channel<Msg>>,
    win: WinSize,
    sess: Option<Arc<Session>>,
}

impl Door {
    fn spawn_session(&mut self, channel: Channel<Msg>) -> Arc<Session> {
        let sess = Session::new(
            User {
                id: None,
                name: self.username.clone(),
            },
            UserIo::Ssh(SshIo::new(channel.into_stream())),
            self.api.clone(),
            self.cfg.clone(),
            self.win,
        );
        self.sess = Some(sess.clone());
        sess
    }
}

impl Handler for Door {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        offered: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.username = user.to_string();
        match self.api.user_keys(user).await {
            Ok(keys) => {
                for registered in keys {
                    let Ok(parsed) = PublicKey::from_openssh(&registered.public_key) else {
                        continue;
                    };
                    if parsed.key_data() == offered.key_data() {
                        tracing::info!(
                            user = %user,
                            key = %registered.title,
                            fingerprint = %registered.fingerprint,
                            peer = ?self.peer,
                            "public key accepted"
                        );
                        return Ok(Auth::Accept);
                    }
                }
                tracing::info!(user = %user, peer = ?self.peer, "no matching key");
            }
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "key lookup failed");
            }
        }
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        self.channel = Some(channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.win = WinSize::new(col_width, row_height);
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let win = WinSize::new(col_width, row_height);
        self.win = win;
        if let Some(sess) = &self.sess {
            sess.post_winch(win);
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let Some(ch) = self.channel.take() else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        if self.win == WinSize::default() {
            // Shell without a PTY has nothing to relay into.
            session.channel_success(channel)?;
            session.exit_status_request(channel, 1)?;
            session.close(channel)?;
            return Ok(());
        }
        let sess = self.spawn_session(ch);
        tokio::spawn(sess.relay());
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        // No command execution on the gateway itself.
        tracing::info!(
            user = %self.username,
            command = %String::from_utf8_lossy(data),
            "exec request rejected"
        );
        session.channel_failure(channel)?;
        session.exit_status_request(channel, 1)?;
        session.close(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        if name == "sftp" {
            if let Some(ch) = self.channel.take() {
                let sess = self.spawn_session(ch);
                tokio::spawn(sess.sftp());
                session.channel_success(channel)?;
                return Ok(());
            }
        }
        tracing::info!(user = %self.username, subsystem = %name, "unsupported subsystem");
        session.channel_failure(channel)?;
        session.exit_status_request(channel, 1)?;
        session.close(channel)?;
        Ok(())
    }
}
