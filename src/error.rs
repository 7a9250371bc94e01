use thiserror::Error;

/// Gateway-wide error kinds.
///
/// `Dial` and `InvalidInput` are the only kinds ever rendered to the user;
/// everything else is logged server-side and results in a silent close.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend URL unreachable.
    #[error("dial error: {0}")]
    Dial(String),

    /// Missing or mismatched signature token.
    #[error("auth error: {0}")]
    Auth(String),

    /// Malformed frame: bad tag, bad resize JSON, zero-length payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Read/write failure on a user or backend channel.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Upstream lookup returned a non-200 response.
    #[error("upstream error: {0}")]
    Client(String),

    /// Menu command with out-of-range or malformed indices.
    #[error("invalid id")]
    InvalidInput,
}

impl Error {
    /// Channel-closed variant of `Io`, used when a peer hangs up mid-pump.
    pub fn closed(what: &str) -> Self {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("{what} closed"),
        ))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
