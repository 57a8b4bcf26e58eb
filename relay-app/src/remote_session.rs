//! One live remote shell: output buffer, idle timer and audit log.
//!
//! Shell output is pumped into the buffer by a reader task. `drain_output`
//! is read-and-clear. Every timer and drain loop hangs off the session's
//! lifetime token, which `close` cancels. At most one stream loop runs per
//! session, and output delivery is serialized through `lock_output`.

use crate::audit::AuditLog;
use crate::error::GatewayError;
use crate::outbox::{Conversation, Outbox};
use chrono::{DateTime, Utc};
use relay_remote::{
    AuthMaterial, ConnectRequest, HostKeyCheck, HostKeyVerifier, RemoteConnector, ShellEvent,
    ShellHandle, ShellInput,
};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Operator,
    IdleTimeout,
    Panic,
    Replaced,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::IdleTimeout => "idle_timeout",
            Self::Panic => "panic",
            Self::Replaced => "replaced",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Send the audit log file to a conversation shortly after close.
#[derive(Clone)]
pub struct LogDelivery {
    pub outbox: Outbox,
    pub conversation: Conversation,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub auth: AuthMaterial,
    pub audit_dir: PathBuf,
}

struct ShellState {
    connected: bool,
    buffer: Vec<u8>,
    input: Option<mpsc::UnboundedSender<ShellInput>>,
}

pub struct RemoteSession {
    target: SessionTarget,
    host_key: HostKeyCheck,
    created_at: DateTime<Utc>,
    started: Instant,
    audit: AuditLog,
    shell: Mutex<ShellState>,
    lifetime: CancellationToken,
    idle: Mutex<Option<CancellationToken>>,
    stream: Mutex<Option<CancellationToken>>,
    output: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("target", &self.target)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .field("log_path", &self.audit.path())
            .finish()
    }
}

impl RemoteSession {
    /// Connect, verify the host key, authenticate and open an interactive
    /// shell. Every step is recorded in the session's audit log.
    #[tracing::instrument(level = "info", skip_all, fields(host = %target.host, port = target.port))]
    pub async fn open(
        target: SessionTarget,
        connector: &dyn RemoteConnector,
        verifier: Arc<dyn HostKeyVerifier>,
        options: &SessionOptions,
    ) -> Result<Arc<Self>, GatewayError> {
        let created_at = Utc::now();
        let audit = AuditLog::create(&options.audit_dir, &target.host, created_at)
            .map_err(|e| GatewayError::HandlerFault(format!("create audit log: {e}")))?;
        audit.record(&format!(
            "Connecting to {}@{}:{} using {} authentication",
            target.user,
            target.host,
            target.port,
            options.auth.method()
        ));

        let request = ConnectRequest {
            host: target.host.clone(),
            user: target.user.clone(),
            port: target.port,
            connect_timeout: options.connect_timeout,
            auth: options.auth.clone(),
        };
        let connection = match connector.connect(&request, verifier).await {
            Ok(connection) => connection,
            Err(e) => {
                audit.record(&format!("SSH ERROR ({}): {e}", e.kind()));
                tracing::warn!(error = %e, kind = e.kind(), "remote connect failed");
                return Err(e.into());
            }
        };

        let host_key = connection.host_key().clone();
        match &host_key {
            HostKeyCheck::Pinned => audit.record("Host key matched pinned fingerprint"),
            HostKeyCheck::AcceptedUnverified { observed } => {
                audit.record(&format!("WARNING: host key not verified ({observed})"));
            }
            _ => {}
        }
        audit.record("SSH connection established");

        let ShellHandle { input, events } = match connection.open_shell().await {
            Ok(handle) => handle,
            Err(e) => {
                audit.record(&format!("SSH ERROR ({}): {e}", e.kind()));
                tracing::warn!(error = %e, kind = e.kind(), "open shell failed");
                return Err(e.into());
            }
        };
        audit.record("Shell session started");

        let session = Arc::new(Self {
            target,
            host_key,
            created_at,
            started: Instant::now(),
            audit,
            shell: Mutex::new(ShellState {
                connected: true,
                buffer: Vec::new(),
                input: Some(input),
            }),
            lifetime: CancellationToken::new(),
            idle: Mutex::new(None),
            stream: Mutex::new(None),
            output: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });
        session.spawn_reader(events);
        tracing::info!(log_path = %session.log_path().display(), "remote session opened");
        Ok(session)
    }

    fn spawn_reader(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<ShellEvent>) {
        let session = Arc::clone(self);
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = lifetime.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Some(ShellEvent::Stdout(bytes)) => session.absorb(&bytes, "OUTPUT"),
                    Some(ShellEvent::Stderr(bytes)) => session.absorb(&bytes, "STDERR"),
                    Some(ShellEvent::Closed) | None => {
                        session.mark_stream_closed();
                        return;
                    }
                }
            }
        });
    }

    fn absorb(&self, bytes: &[u8], tag: &str) {
        self.audit
            .record(&format!("{tag}: {}", String::from_utf8_lossy(bytes)));
        self.lock_shell().buffer.extend_from_slice(bytes);
    }

    fn mark_stream_closed(&self) {
        {
            let mut shell = self.lock_shell();
            shell.connected = false;
            shell.input = None;
        }
        if !self.is_closed() {
            self.audit.record("Shell session closed by remote");
            tracing::info!(host = %self.target.host, "remote shell stream closed");
        }
    }

    fn lock_shell(&self) -> MutexGuard<'_, ShellState> {
        self.shell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub fn host(&self) -> &str {
        &self.target.host
    }

    pub fn host_key(&self) -> &HostKeyCheck {
        &self.host_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn log_path(&self) -> &Path {
        self.audit.path()
    }

    pub fn is_connected(&self) -> bool {
        self.lock_shell().connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token cancelled when the session closes; for loops that outlive a handler.
    pub fn child_token(&self) -> CancellationToken {
        self.lifetime.child_token()
    }

    /// Takes the stream slot for a new drain loop and cancels whichever loop
    /// held it before.
    pub fn claim_stream(&self) -> CancellationToken {
        let token = self.lifetime.child_token();
        let previous = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    pub fn stream_active(&self) -> bool {
        self.stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Held while draining and emitting so paced chunks from two drains
    /// never interleave in chat.
    pub async fn lock_output(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.output.lock().await
    }

    /// Writes `text` followed by a newline.
    pub fn send_input(&self, text: &str) -> Result<(), GatewayError> {
        self.write(format!("{text}\n").into_bytes())?;
        self.audit.record(&format!("COMMAND: {text}"));
        Ok(())
    }

    /// Writes raw bytes (Ctrl-C, bare newline). `label` is what the audit log shows.
    pub fn send_raw(&self, bytes: &[u8], label: &str) -> Result<(), GatewayError> {
        self.write(bytes.to_vec())?;
        self.audit.record(&format!("INPUT: {label}"));
        Ok(())
    }

    fn write(&self, bytes: Vec<u8>) -> Result<(), GatewayError> {
        let mut shell = self.lock_shell();
        if !shell.connected {
            return Err(GatewayError::NotConnected);
        }
        let Some(input) = shell.input.as_ref() else {
            return Err(GatewayError::NotConnected);
        };
        if input.send(ShellInput::Data(bytes)).is_err() {
            shell.connected = false;
            shell.input = None;
            return Err(GatewayError::NotConnected);
        }
        Ok(())
    }

    /// Returns and clears buffered output. A multi-byte character split
    /// across reads stays buffered until it completes.
    pub fn drain_output(&self) -> String {
        let mut shell = self.lock_shell();
        let complete = if shell.connected {
            complete_utf8_prefix(&shell.buffer)
        } else {
            shell.buffer.len()
        };
        let rest = shell.buffer.split_off(complete);
        let drained = std::mem::replace(&mut shell.buffer, rest);
        String::from_utf8_lossy(&drained).into_owned()
    }

    /// Re-arm the idle timer. The previous timer is cancelled; `on_expire`
    /// runs once if `window` elapses without another reset or a close.
    pub fn reset_idle_timer<F, Fut>(self: &Arc<Self>, window: Duration, on_expire: F)
    where
        F: FnOnce(Arc<RemoteSession>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        let token = self.lifetime.child_token();
        let previous = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    tracing::info!(host = %session.target.host, idle_ms = window.as_millis() as u64, "idle window elapsed");
                    on_expire(session).await;
                }
            }
        });
    }

    /// Idempotent. Ends the shell, cancels timers and drain loops, and
    /// optionally schedules delivery of the audit log.
    pub fn close(&self, reason: CloseReason, delivery: Option<LogDelivery>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lifetime.cancel();
        let input = {
            let mut shell = self.lock_shell();
            shell.connected = false;
            shell.input.take()
        };
        if let Some(input) = input {
            let _ = input.send(ShellInput::Close);
        }
        self.audit
            .record(&format!("Connection closed (reason: {})", reason.as_str()));
        tracing::info!(
            host = %self.target.host,
            reason = reason.as_str(),
            uptime_secs = self.uptime().as_secs(),
            "remote session closed"
        );

        if let Some(delivery) = delivery {
            let path = self.audit.path().to_path_buf();
            let caption = format!("Audit log for {}", crate::redact::redact(&self.target.host));
            tokio::spawn(async move {
                tokio::time::sleep(delivery.delay).await;
                delivery
                    .outbox
                    .send_file(&delivery.conversation, &path, &caption)
                    .await;
            });
        }
    }
}

fn complete_utf8_prefix(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeConnector, RecordingAdapter, open_fake_session};
    use relay_remote::{PinnedHostKeyVerifier, RemoteError};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn output_is_buffered_and_drained_once() {
        let fake = open_fake_session("node-1").await;
        fake.endpoint
            .events
            .send(ShellEvent::Stdout(b"hello ".to_vec()))
            .expect("stdout");
        fake.endpoint
            .events
            .send(ShellEvent::Stderr(b"warn".to_vec()))
            .expect("stderr");
        tokio::task::yield_now().await;
        fake.settle().await;

        assert_eq!(fake.session.drain_output(), "hello warn");
        assert_eq!(fake.session.drain_output(), "");

        let log = std::fs::read_to_string(fake.session.log_path()).expect("read log");
        assert!(log.contains("OUTPUT: hello"));
        assert!(log.contains("STDERR: warn"));
    }

    #[tokio::test]
    async fn inputs_reach_the_shell_in_order() {
        let mut fake = open_fake_session("node-1").await;
        fake.session.send_input("uptime").expect("send");
        fake.session.send_raw(&[0x03], "ctrl-c").expect("raw");
        fake.session.send_raw(b"\n", "enter").expect("raw");

        assert_eq!(
            fake.endpoint.inputs.recv().await,
            Some(ShellInput::Data(b"uptime\n".to_vec()))
        );
        assert_eq!(
            fake.endpoint.inputs.recv().await,
            Some(ShellInput::Data(vec![0x03]))
        );
        assert_eq!(
            fake.endpoint.inputs.recv().await,
            Some(ShellInput::Data(b"\n".to_vec()))
        );
    }

    #[tokio::test]
    async fn remote_close_marks_session_disconnected() {
        let fake = open_fake_session("node-1").await;
        assert!(fake.session.is_connected());
        fake.endpoint
            .events
            .send(ShellEvent::Closed)
            .expect("closed");
        fake.settle().await;

        assert!(!fake.session.is_connected());
        assert!(matches!(
            fake.session.send_input("ls"),
            Err(GatewayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn partial_utf8_sequences_wait_for_completion() {
        let fake = open_fake_session("node-1").await;
        let snowman = "☃".as_bytes();
        fake.endpoint
            .events
            .send(ShellEvent::Stdout(vec![b'a', snowman[0]]))
            .expect("stdout");
        fake.settle().await;
        assert_eq!(fake.session.drain_output(), "a");

        fake.endpoint
            .events
            .send(ShellEvent::Stdout(snowman[1..].to_vec()))
            .expect("stdout");
        fake.settle().await;
        assert_eq!(fake.session.drain_output(), "☃");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_the_shell() {
        let mut fake = open_fake_session("node-1").await;
        fake.session.close(CloseReason::Operator, None);
        fake.session.close(CloseReason::Operator, None);

        assert!(fake.session.is_closed());
        assert!(!fake.session.is_connected());
        assert_eq!(fake.endpoint.inputs.recv().await, Some(ShellInput::Close));
        assert!(matches!(
            fake.session.send_input("ls"),
            Err(GatewayError::NotConnected)
        ));

        let log = std::fs::read_to_string(fake.session.log_path()).expect("read log");
        assert_eq!(log.matches("Connection closed").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_delivers_the_audit_log_after_a_delay() {
        let fake = open_fake_session("node-1").await;
        let adapter = RecordingAdapter::new("whatsapp");
        fake.session.close(
            CloseReason::Operator,
            Some(LogDelivery {
                outbox: adapter.outbox(),
                conversation: Conversation::new("whatsapp", "628123"),
                delay: Duration::from_secs(1),
            }),
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(adapter.files().is_empty());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let files = adapter.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, fake.session.log_path());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_rearms_and_fires_once() {
        let fake = open_fake_session("node-1").await;
        let fired = Arc::new(AtomicUsize::new(0));
        let arm = |session: &Arc<RemoteSession>| {
            let fired = fired.clone();
            session.reset_idle_timer(Duration::from_secs(10), move |_| async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        };

        arm(&fake.session);
        tokio::time::sleep(Duration::from_secs(6)).await;
        arm(&fake.session);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn claiming_the_stream_cancels_the_previous_claim() {
        let fake = open_fake_session("node-1").await;
        assert!(!fake.session.stream_active());

        let first = fake.session.claim_stream();
        assert!(fake.session.stream_active());
        let second = fake.session.claim_stream();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        second.cancel();
        assert!(!fake.session.stream_active());

        let third = fake.session.claim_stream();
        fake.session.close(CloseReason::Operator, None);
        assert!(third.is_cancelled());
        assert!(!fake.session.stream_active());
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_the_idle_timer() {
        let fake = open_fake_session("node-1").await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        fake.session
            .reset_idle_timer(Duration::from_secs(10), move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        fake.session.close(CloseReason::Panic, None);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connect_failure_is_audited_and_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let connector = FakeConnector::default();
        connector.fail_next(RemoteError::AuthFailure("denied".to_string()));
        let err = RemoteSession::open(
            SessionTarget {
                host: "node-1".to_string(),
                user: "root".to_string(),
                port: 22,
            },
            &connector,
            Arc::new(PinnedHostKeyVerifier::new(Default::default(), true)),
            &SessionOptions {
                connect_timeout: Duration::from_secs(5),
                auth: AuthMaterial::Password("pw".to_string()),
                audit_dir: dir.path().to_path_buf(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ConnectFailure(RemoteError::AuthFailure(_))
        ));

        let entry = std::fs::read_dir(dir.path())
            .expect("read dir")
            .next()
            .expect("one log file")
            .expect("dir entry");
        let log = std::fs::read_to_string(entry.path()).expect("read log");
        assert!(log.contains("SSH ERROR (auth_failure)"));
    }

    #[tokio::test]
    async fn unpinned_host_fails_closed_without_opt_in() {
        let dir = tempfile::tempdir().expect("tempdir");
        let connector = FakeConnector::default();
        let err = RemoteSession::open(
            SessionTarget {
                host: "node-1".to_string(),
                user: "root".to_string(),
                port: 22,
            },
            &connector,
            Arc::new(PinnedHostKeyVerifier::default()),
            &SessionOptions {
                connect_timeout: Duration::from_secs(5),
                auth: AuthMaterial::Password("pw".to_string()),
                audit_dir: dir.path().to_path_buf(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ConnectFailure(RemoteError::HostKeyUnverified { .. })
        ));
    }
}
