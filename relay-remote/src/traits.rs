use crate::error::Result;
use crate::hostkey::{HostKeyCheck, HostKeyVerifier};
use crate::shell::ShellHandle;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub enum AuthMaterial {
    PrivateKeyFile(PathBuf),
    Password(String),
}

impl AuthMaterial {
    pub fn method(&self) -> &'static str {
        match self {
            Self::PrivateKeyFile(_) => "publickey",
            Self::Password(_) => "password",
        }
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateKeyFile(path) => f.debug_tuple("PrivateKeyFile").field(path).finish(),
            Self::Password(_) => f.write_str("Password(********)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub auth: AuthMaterial,
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Establish and authenticate a transport connection to `request.host`.
    async fn connect(
        &self,
        request: &ConnectRequest,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> Result<Box<dyn RemoteConnection>>;
}

#[async_trait]
pub trait RemoteConnection: Send {
    /// How the server's host key was accepted.
    fn host_key(&self) -> &HostKeyCheck;

    /// Open an interactive shell channel, consuming the connection.
    async fn open_shell(self: Box<Self>) -> Result<ShellHandle>;
}
