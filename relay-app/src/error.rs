use crate::redact::redact;
use relay_remote::RemoteError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDenial {
    PanicActive,
    RateLimited,
    HostNotWhitelisted(String),
    WrongPin,
}

impl fmt::Display for PolicyDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PanicActive => f.write_str("panic mode is active"),
            Self::RateLimited => f.write_str("rate limited"),
            Self::HostNotWhitelisted(host) => write!(f, "host {host} is not whitelisted"),
            Self::WrongPin => f.write_str("wrong pin"),
        }
    }
}

/// Every way a command can fail. Each variant renders a short chat reply.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("sender is not the owner")]
    AuthDenied,

    #[error("policy denied: {0}")]
    PolicyDenied(PolicyDenial),

    #[error("no active session")]
    NoActiveSession,

    #[error("no session for host {0}")]
    NoSuchSession(String),

    #[error("connect failed: {0}")]
    ConnectFailure(#[from] RemoteError),

    #[error("session is not connected")]
    NotConnected,

    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    #[error("handler fault: {0}")]
    HandlerFault(String),
}

impl GatewayError {
    pub fn usage(text: impl Into<String>) -> Self {
        Self::InvalidUsage(text.into())
    }

    /// Operator-facing rendering. Hosts are redacted and connect failures
    /// collapse to a short reason; the full cause stays in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::AuthDenied => "⛔ Access denied. This relay only answers its owner.".to_string(),
            Self::PolicyDenied(PolicyDenial::PanicActive) => {
                "🚨 Panic mode is active. Use .unpanic to resume.".to_string()
            }
            Self::PolicyDenied(PolicyDenial::RateLimited) => {
                "⏳ Please wait a moment before sending another command.".to_string()
            }
            Self::PolicyDenied(PolicyDenial::HostNotWhitelisted(host)) => {
                format!("❌ Host \"{}\" is not on the whitelist.", redact(host))
            }
            Self::PolicyDenied(PolicyDenial::WrongPin) => "❌ Wrong PIN. Access denied.".to_string(),
            Self::NoActiveSession => "❌ No active session. Use .connect first.".to_string(),
            Self::NoSuchSession(host) => {
                format!("❌ No active session for host: {}", redact(host))
            }
            Self::ConnectFailure(e) => format!("❌ Connection failed: {}", connect_reason(e)),
            Self::NotConnected => "❌ Session is not connected.".to_string(),
            Self::InvalidUsage(text) => format!("❌ {text}"),
            Self::HandlerFault(_) => {
                "❌ Command failed unexpectedly. Details are in the server log.".to_string()
            }
        }
    }
}

fn connect_reason(e: &RemoteError) -> &'static str {
    match e {
        RemoteError::AuthFailure(_) => "authentication rejected",
        RemoteError::HostKeyMismatch { .. } => "host key does not match the pinned fingerprint",
        RemoteError::HostKeyUnverified { .. } => "host fingerprint is not pinned",
        RemoteError::ConnectTimeout(_) => "timed out",
        RemoteError::Transport(_) => "network error",
        RemoteError::ChannelError(_) => "could not open a shell",
    }
}
