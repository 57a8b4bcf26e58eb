//! In-memory collaborators for unit tests.

use crate::config::{RelayConfig, SshAuthMode};
use crate::outbox::Outbox;
use crate::remote_session::{RemoteSession, SessionOptions, SessionTarget};
use crate::state::RelayState;
use anyhow::anyhow;
use async_trait::async_trait;
use relay_channels::{ChannelAdapter, InboundMessage, OutboundMessage};
use relay_remote::{
    AuthMaterial, ConnectRequest, HostKeyCheck, HostKeyFingerprint, HostKeyVerifier,
    PinnedHostKeyVerifier, RemoteConnection, RemoteConnector, RemoteError, ShellEndpoint,
    ShellHandle,
};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub(crate) const OWNER: &str = "628123456789@s.whatsapp.net";
pub(crate) const OWNER_CHAT: &str = "628123456789";
pub(crate) const PIN: &str = "482913";

#[derive(Debug, Clone)]
pub(crate) struct SentMessage {
    pub recipient: String,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone)]
pub(crate) struct SentFile {
    pub recipient: String,
    pub path: PathBuf,
    pub caption: String,
}

#[derive(Default)]
struct Recorded {
    messages: Vec<SentMessage>,
    files: Vec<SentFile>,
}

/// Channel adapter that records every delivery.
#[derive(Clone)]
pub(crate) struct RecordingAdapter {
    channel: String,
    failing: bool,
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingAdapter {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            failing: false,
            recorded: Arc::new(Mutex::new(Recorded::default())),
        }
    }

    /// Every send fails and nothing is recorded.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn outbox(&self) -> Outbox {
        let adapter: Arc<dyn ChannelAdapter> = Arc::new(self.clone());
        Outbox::new(HashMap::from([(self.channel.clone(), adapter)]))
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.recorded.lock().expect("recorded").messages.clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|sent| sent.message.content)
            .collect()
    }

    pub fn files(&self) -> Vec<SentFile> {
        self.recorded.lock().expect("recorded").files.clone()
    }

    pub fn clear(&self) {
        let mut recorded = self.recorded.lock().expect("recorded");
        recorded.messages.clear();
        recorded.files.clear();
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn channel_id(&self) -> &str {
        &self.channel
    }

    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> anyhow::Result<()> {
        if self.failing {
            return Err(anyhow!("recording adapter configured to fail"));
        }
        self.recorded
            .lock()
            .expect("recorded")
            .messages
            .push(SentMessage {
                recipient: recipient_id.to_string(),
                message,
            });
        Ok(())
    }

    async fn send_file(&self, recipient_id: &str, path: &Path, caption: &str) -> anyhow::Result<()> {
        if self.failing {
            return Err(anyhow!("recording adapter configured to fail"));
        }
        self.recorded.lock().expect("recorded").files.push(SentFile {
            recipient: recipient_id.to_string(),
            path: path.to_path_buf(),
            caption: caption.to_string(),
        });
        Ok(())
    }

    fn supports_attachments(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct ConnectorState {
    failures: VecDeque<RemoteError>,
    requests: Vec<ConnectRequest>,
    endpoints: Vec<(String, ShellEndpoint)>,
}

/// Connector whose shells are in-memory [`ShellHandle`] pairs. The host key
/// is the SHA-256 of the host name and goes through the real verifier.
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().expect("connector").failures.push_back(error);
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.state.lock().expect("connector").requests.clone()
    }

    /// The most recently opened shell endpoint for `host`.
    pub fn take_endpoint(&self, host: &str) -> Option<ShellEndpoint> {
        let mut state = self.state.lock().expect("connector");
        let index = state.endpoints.iter().rposition(|(h, _)| h == host)?;
        Some(state.endpoints.remove(index).1)
    }

    pub fn fingerprint(host: &str) -> HostKeyFingerprint {
        HostKeyFingerprint::from_digest(&Sha256::digest(host.as_bytes()))
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(
        &self,
        request: &ConnectRequest,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> relay_remote::Result<Box<dyn RemoteConnection>> {
        let failure = {
            let mut state = self.state.lock().expect("connector");
            state.requests.push(request.clone());
            state.failures.pop_front()
        };
        if let Some(error) = failure {
            return Err(error);
        }
        let host_key = verifier
            .verify(&request.host, &Self::fingerprint(&request.host))
            .into_result(&request.host)?;
        Ok(Box::new(FakeConnection {
            host: request.host.clone(),
            host_key,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeConnection {
    host: String,
    host_key: HostKeyCheck,
    state: Arc<Mutex<ConnectorState>>,
}

#[async_trait]
impl RemoteConnection for FakeConnection {
    fn host_key(&self) -> &HostKeyCheck {
        &self.host_key
    }

    async fn open_shell(self: Box<Self>) -> relay_remote::Result<ShellHandle> {
        let (handle, endpoint) = ShellHandle::pair();
        self.state
            .lock()
            .expect("connector")
            .endpoints
            .push((self.host, endpoint));
        Ok(handle)
    }
}

pub(crate) struct FakeSession {
    pub session: Arc<RemoteSession>,
    pub endpoint: ShellEndpoint,
    _dir: TempDir,
}

impl FakeSession {
    /// Lets the session's reader task catch up with queued events.
    pub async fn settle(&self) {
        settle().await;
    }
}

pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub(crate) async fn open_fake_session(host: &str) -> FakeSession {
    let dir = tempfile::tempdir().expect("tempdir");
    let connector = FakeConnector::default();
    let session = RemoteSession::open(
        SessionTarget {
            host: host.to_string(),
            user: "root".to_string(),
            port: 22,
        },
        &connector,
        Arc::new(PinnedHostKeyVerifier::new(HashMap::new(), true)),
        &SessionOptions {
            connect_timeout: Duration::from_secs(5),
            auth: AuthMaterial::Password("pw".to_string()),
            audit_dir: dir.path().to_path_buf(),
        },
    )
    .await
    .expect("open fake session");
    let endpoint = connector.take_endpoint(host).expect("shell endpoint");
    FakeSession {
        session,
        endpoint,
        _dir: dir,
    }
}

/// Gateway state wired to fakes; the audit directory lives in the returned
/// `TempDir`.
pub(crate) struct TestRelay {
    pub state: Arc<RelayState>,
    pub adapter: RecordingAdapter,
    pub connector: FakeConnector,
    pub dir: TempDir,
}

pub(crate) fn test_config(dir: &Path) -> RelayConfig {
    let mut cfg = RelayConfig::default();
    cfg.owner.identity = OWNER.to_string();
    cfg.owner.pin = PIN.to_string();
    cfg.ssh.auth_mode = SshAuthMode::Password;
    cfg.ssh.password = Some("pw".to_string());
    cfg.ssh.allow_unverified_hostkey = true;
    cfg.audit.log_dir = dir.display().to_string();
    cfg
}

pub(crate) fn test_relay_with(configure: impl FnOnce(&mut RelayConfig)) -> TestRelay {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = test_config(dir.path());
    configure(&mut cfg);
    cfg.validate().expect("valid test config");

    let adapter = RecordingAdapter::new("whatsapp");
    let connector = FakeConnector::default();
    let state = RelayState::from_config(&cfg, adapter.outbox(), Arc::new(connector.clone()))
        .expect("relay state");
    TestRelay {
        state: Arc::new(state),
        adapter,
        connector,
        dir,
    }
}

pub(crate) fn test_relay() -> TestRelay {
    test_relay_with(|_| {})
}
