//! Process-wide gateway state shared by the dispatcher, the HTTP surface and
//! shutdown.

use crate::config::RelayConfig;
use crate::confirmation::{ConfirmationBook, ConnectPolicy};
use crate::guard::PolicyGuard;
use crate::outbox::{Conversation, Outbox};
use crate::registry::SessionRegistry;
use crate::remote_session::{CloseReason, LogDelivery, RemoteSession, SessionOptions};
use crate::streaming::StreamSettings;
use chrono::{DateTime, Utc};
use relay_remote::{HostKeyVerifier, PinnedHostKeyVerifier, RemoteConnector};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const IDLE_CLOSED_NOTICE: &str = "⚠️ Session closed automatically after being idle too long.";

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub session_idle: Duration,
    pub delivery_delay: Duration,
    pub installer_load_delay: Duration,
    pub streaming: StreamSettings,
    pub session: SessionOptions,
}

impl RelaySettings {
    pub fn from_config(cfg: &RelayConfig) -> anyhow::Result<Self> {
        Ok(Self {
            session_idle: cfg.session_idle(),
            delivery_delay: Duration::from_millis(cfg.audit.delivery_delay_ms),
            installer_load_delay: Duration::from_millis(cfg.streaming.installer_load_delay_ms),
            streaming: StreamSettings {
                chunk_max_chars: cfg.streaming.chunk_max_chars,
                chunk_pacing: Duration::from_millis(cfg.streaming.chunk_pacing_ms),
                poll_interval: Duration::from_millis(cfg.streaming.poll_interval_ms),
                settle_delay: Duration::from_millis(cfg.streaming.settle_delay_ms),
            },
            session: SessionOptions {
                connect_timeout: cfg.connect_timeout(),
                auth: cfg.auth_material()?,
                audit_dir: cfg.audit_dir()?,
            },
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub panic_mode: bool,
    pub active_sessions: usize,
    pub channels: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

pub struct RelayState {
    pub guard: PolicyGuard,
    pub registry: Arc<SessionRegistry>,
    pub confirmations: ConfirmationBook,
    pub outbox: Outbox,
    pub connector: Arc<dyn RemoteConnector>,
    pub verifier: Arc<dyn HostKeyVerifier>,
    pub settings: RelaySettings,
}

impl RelayState {
    pub fn from_config(
        cfg: &RelayConfig,
        outbox: Outbox,
        connector: Arc<dyn RemoteConnector>,
    ) -> anyhow::Result<Self> {
        let verifier: Arc<dyn HostKeyVerifier> = Arc::new(PinnedHostKeyVerifier::new(
            cfg.ssh.host_fingerprints.clone(),
            cfg.ssh.allow_unverified_hostkey,
        ));
        if cfg.ssh.allow_unverified_hostkey {
            tracing::warn!("allow_unverified_hostkey is enabled; unpinned host keys will be accepted");
        }
        Ok(Self {
            guard: PolicyGuard::new(&cfg.owner.identity, cfg.rate_limit()),
            registry: Arc::new(SessionRegistry::new()),
            confirmations: ConfirmationBook::new(ConnectPolicy {
                pin: cfg.owner.pin.clone(),
                host_whitelist: cfg.policy.host_whitelist.clone(),
                affirmative_token: cfg.policy.affirmative_token.clone(),
            }),
            outbox,
            connector,
            verifier,
            settings: RelaySettings::from_config(cfg)?,
        })
    }

    pub fn log_delivery(&self, to: &Conversation) -> LogDelivery {
        LogDelivery {
            outbox: self.outbox.clone(),
            conversation: to.clone(),
            delay: self.settings.delivery_delay,
        }
    }

    /// Re-arms the session's idle timer. On expiry the session is removed
    /// (unless it was already replaced), closed, and its log delivered.
    pub fn arm_idle_timer(&self, session: &Arc<RemoteSession>, to: &Conversation) {
        let registry = Arc::clone(&self.registry);
        let outbox = self.outbox.clone();
        let delivery = self.log_delivery(to);
        let to = to.clone();
        session.reset_idle_timer(self.settings.session_idle, move |session| async move {
            if !registry.remove_if_same(session.host(), &session) {
                return;
            }
            session.close(CloseReason::IdleTimeout, Some(delivery));
            outbox.send_text(&to, IDLE_CLOSED_NOTICE).await;
        });
    }

    /// Closes every registered session without log delivery and drops all
    /// pending confirmations. Returns the number of sessions closed.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let sessions = self.registry.take_all();
        for session in &sessions {
            session.close(reason, None);
        }
        let pending = self.confirmations.clear_all();
        tracing::info!(
            sessions = sessions.len(),
            pending,
            reason = reason.as_str(),
            "closed all sessions"
        );
        sessions.len()
    }

    pub fn shutdown_sessions(&self) -> usize {
        self.close_all(CloseReason::Shutdown)
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            panic_mode: self.guard.panic_active(),
            active_sessions: self.registry.len(),
            channels: self.outbox.channel_ids(),
            checked_at: Utc::now(),
        }
    }
}
