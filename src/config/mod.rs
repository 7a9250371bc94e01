//! Process-wide configuration, read once at startup.

use std::env;
use std::path::PathBuf;

/// Default port the container-exec bridge listens on (and is dialled at).
pub const DEFAULT_BACKEND_PORT: u16 = 2356;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the signed lookup service.
    pub api_base: String,
    /// Shared secret for signing and verifying form tokens.
    pub api_secret: String,
    /// Port backend nodes expose the exec bridge on.
    pub backend_port: u16,
    /// SSH host identity key.
    pub host_key_path: PathBuf,
    /// Node host serving file-transfer sessions.
    pub sftp_node: String,
    /// Command attached for file-transfer sessions.
    pub sftp_cmd: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            api_base: env_or("GANGWAY_API_BASE", ""),
            api_secret: env_or("GANGWAY_SECRET", ""),
            backend_port: env::var("GANGWAY_BACKEND_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BACKEND_PORT),
            host_key_path: PathBuf::from(env_or("GANGWAY_HOST_KEY", "./conf/server.id_rsa")),
            sftp_node: env_or("GANGWAY_SFTP_NODE", "localhost"),
            sftp_cmd: env_or("GANGWAY_SFTP_CMD", "/usr/lib/ssh/sftp-server"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
