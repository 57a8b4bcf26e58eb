use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("host key mismatch for {host}: expected {expected}, observed {observed}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        observed: String,
    },

    #[error("host key for {host} is not pinned and unverified keys are not allowed")]
    HostKeyUnverified { host: String },

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel error: {0}")]
    ChannelError(String),
}

impl RemoteError {
    /// Short stable label, suitable for audit lines and metrics fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthFailure(_) => "auth_failure",
            Self::HostKeyMismatch { .. } => "host_key_mismatch",
            Self::HostKeyUnverified { .. } => "host_key_unverified",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::Transport(_) => "transport",
            Self::ChannelError(_) => "channel_error",
        }
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
