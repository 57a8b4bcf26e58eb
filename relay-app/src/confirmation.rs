//! Two-step gate in front of every new remote connection.
//!
//! `.connect` checks the PIN and the host whitelist and parks a
//! [`PendingConnection`] for the sender; the next `.confirm` resolves it.
//! The PIN is only checked at `.connect`.

use crate::error::{GatewayError, PolicyDenial};
use crate::guard::constant_time_eq;
use crate::outbox::Conversation;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

const DEFAULT_USER: &str = "root";
const DEFAULT_PORT: u16 = 22;
pub const CONNECT_USAGE: &str = "Usage: .connect <PIN> <host> [user=root] [port=22]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConnection {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub conversation: Conversation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationState {
    NoPending,
    Pending(PendingConnection),
}

/// How a `.confirm` resolved the pending entry. Both outcomes remove it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed(PendingConnection),
    Cancelled(PendingConnection),
}

#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    pub pin: String,
    /// Exact host names; empty allows every host.
    pub host_whitelist: Vec<String>,
    pub affirmative_token: String,
}

impl ConnectPolicy {
    pub fn is_whitelisted(&self, host: &str) -> bool {
        self.host_whitelist.is_empty() || self.host_whitelist.iter().any(|allowed| allowed == host)
    }
}

pub struct ConfirmationBook {
    policy: ConnectPolicy,
    pending: Mutex<HashMap<String, PendingConnection>>,
}

impl ConfirmationBook {
    pub fn new(policy: ConnectPolicy) -> Self {
        Self {
            policy,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingConnection>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn affirmative_token(&self) -> &str {
        &self.policy.affirmative_token
    }

    /// Handles `.connect <pin> <host> [user] [port]`. On success the new
    /// entry replaces any earlier one for `identity`.
    pub fn request(
        &self,
        identity: &str,
        args: &[&str],
        conversation: &Conversation,
    ) -> Result<PendingConnection, GatewayError> {
        let [pin, host, rest @ ..] = args else {
            return Err(GatewayError::usage(CONNECT_USAGE));
        };
        if !constant_time_eq(pin, &self.policy.pin) {
            tracing::warn!(identity, "connect rejected: wrong pin");
            return Err(GatewayError::PolicyDenied(PolicyDenial::WrongPin));
        }
        if !self.policy.is_whitelisted(host) {
            tracing::warn!(identity, host, "connect rejected: host not whitelisted");
            return Err(GatewayError::PolicyDenied(PolicyDenial::HostNotWhitelisted(
                host.to_string(),
            )));
        }
        let user = rest.first().copied().unwrap_or(DEFAULT_USER);
        let port = match rest.get(1) {
            None => DEFAULT_PORT,
            Some(raw) => parse_port(raw)?,
        };

        let pending = PendingConnection {
            host: host.to_string(),
            user: user.to_string(),
            port,
            conversation: conversation.clone(),
        };
        if self
            .lock()
            .insert(identity.to_string(), pending.clone())
            .is_some()
        {
            tracing::debug!(identity, "previous pending connection overwritten");
        }
        Ok(pending)
    }

    /// Handles `.confirm <token>`.
    ///
    /// Without a pending entry this is an error. The affirmative token
    /// (case-insensitive) confirms; anything else, including no token at
    /// all, cancels.
    pub fn confirm(&self, identity: &str, token: &str) -> Result<ConfirmationOutcome, GatewayError> {
        let Some(entry) = self.lock().remove(identity) else {
            return Err(GatewayError::usage(
                "No connection is waiting for confirmation.",
            ));
        };
        let token = token.trim();
        if !token.is_empty() && token.eq_ignore_ascii_case(self.policy.affirmative_token.trim()) {
            Ok(ConfirmationOutcome::Confirmed(entry))
        } else {
            Ok(ConfirmationOutcome::Cancelled(entry))
        }
    }

    pub fn state(&self, identity: &str) -> ConfirmationState {
        match self.lock().get(identity) {
            Some(entry) => ConfirmationState::Pending(entry.clone()),
            None => ConfirmationState::NoPending,
        }
    }

    pub fn clear_all(&self) -> usize {
        let mut pending = self.lock();
        let count = pending.len();
        pending.clear();
        count
    }
}

fn parse_port(raw: &str) -> Result<u16, GatewayError> {
    match raw.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(GatewayError::usage(format!(
            "Invalid port {raw:?}. {CONNECT_USAGE}"
        ))),
    }
}
