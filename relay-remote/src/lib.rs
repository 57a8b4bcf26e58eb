//! Remote shell bridge for shellrelay.
//!
//! Connectors open authenticated interactive shells on remote hosts and hand
//! them back as a [`ShellHandle`]: an ordered input sender plus an event stream.

mod error;
mod hostkey;
mod shell;
mod ssh;
mod traits;

pub use error::{RemoteError, Result};
pub use hostkey::{HostKeyCheck, HostKeyFingerprint, HostKeyVerifier, PinnedHostKeyVerifier};
pub use shell::{ShellEndpoint, ShellEvent, ShellHandle, ShellInput};
pub use ssh::Ssh2Connector;
pub use traits::{AuthMaterial, ConnectRequest, RemoteConnection, RemoteConnector};
