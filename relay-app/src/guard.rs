//! Identity and policy guard.
//!
//! Every inbound command passes through [`PolicyGuard::evaluate`] before it
//! reaches the dispatcher. Checks run in a fixed order: owner, panic lockout,
//! rate limit.

use crate::commands;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const UNPANIC_COMMAND: &str = "unpanic";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Accept,
    RejectNotOwner,
    RejectPanic,
    RejectRateLimited,
}

#[derive(Debug)]
pub struct PolicyGuard {
    owner: String,
    rate_limit: Duration,
    ledger: DashMap<String, Instant>,
    panic: AtomicBool,
}

impl PolicyGuard {
    pub fn new(owner_identity: &str, rate_limit: Duration) -> Self {
        Self {
            owner: normalize_identity(owner_identity),
            rate_limit,
            ledger: DashMap::new(),
            panic: AtomicBool::new(false),
        }
    }

    pub fn is_owner(&self, sender: &str) -> bool {
        let sender = normalize_identity(sender);
        !sender.is_empty() && constant_time_eq(&sender, &self.owner)
    }

    pub fn panic_active(&self) -> bool {
        self.panic.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_panic(&self, active: bool) -> bool {
        self.panic.swap(active, Ordering::SeqCst)
    }

    pub fn evaluate(&self, sender: &str, text: &str, now: Instant) -> GuardDecision {
        if !self.is_owner(sender) {
            return GuardDecision::RejectNotOwner;
        }

        if self.panic_active() {
            let is_unpanic = commands::parse(text).is_some_and(|c| c.name == UNPANIC_COMMAND);
            if !is_unpanic {
                return GuardDecision::RejectPanic;
            }
        }

        match self.ledger.entry(normalize_identity(sender)) {
            Entry::Occupied(mut last) => {
                if now.saturating_duration_since(*last.get()) < self.rate_limit {
                    return GuardDecision::RejectRateLimited;
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        GuardDecision::Accept
    }
}

/// Canonical form of a transport identity.
///
/// `628123:7@s.whatsapp.net` and `628123@S.WhatsApp.net` both become
/// `628123@s.whatsapp.net`; `+1 (555) 010-0000` becomes `15550100000`.
pub fn normalize_identity(raw: &str) -> String {
    let raw = raw.trim();
    let (local, domain) = match raw.split_once('@') {
        Some((local, domain)) => (local, Some(domain)),
        None => (raw, None),
    };
    let local = local.split_once(':').map_or(local, |(base, _device)| base);
    let local = if is_phone_like(local) {
        local.chars().filter(char::is_ascii_digit).collect()
    } else {
        local.to_string()
    };
    match domain {
        Some(domain) => format!("{local}@{}", domain.trim().to_ascii_lowercase()),
        None => local,
    }
}

fn is_phone_like(value: &str) -> bool {
    value.chars().any(|c| c.is_ascii_digit())
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')'))
}

pub(crate) fn constant_time_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let mut diff = left_bytes.len() ^ right_bytes.len();
    for index in 0..left_bytes.len().max(right_bytes.len()) {
        let l = left_bytes.get(index).copied().unwrap_or(0);
        let r = right_bytes.get(index).copied().unwrap_or(0);
        diff |= usize::from(l ^ r);
    }
    diff == 0
}
