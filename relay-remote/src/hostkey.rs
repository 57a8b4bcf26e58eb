use crate::error::{RemoteError, Result};
use base64::Engine;
use std::collections::HashMap;
use std::fmt;

/// SHA-256 digest of a server host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyFingerprint {
    digest: Vec<u8>,
}

impl HostKeyFingerprint {
    pub fn from_digest(digest: &[u8]) -> Self {
        Self {
            digest: digest.to_vec(),
        }
    }

    /// Lowercase hex, e.g. `9f86d0...`.
    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(self.digest.len() * 2);
        for byte in &self.digest {
            out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
            out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
        }
        out
    }

    /// OpenSSH style, e.g. `SHA256:n4bQgYhMfWWaL+qgxVrQFaO/TxsrC4Is0V1sFbDwCgg`.
    pub fn openssh(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(&self.digest);
        format!("SHA256:{encoded}")
    }

    /// Exact comparison against a pinned value in either rendering.
    pub fn matches(&self, pinned: &str) -> bool {
        let pinned = pinned.trim();
        if pinned.is_empty() {
            return false;
        }
        pinned == self.hex() || pinned == self.openssh()
    }
}

impl fmt::Display for HostKeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.openssh())
    }
}

/// Outcome of checking an observed host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyCheck {
    /// Observed key equals the pinned fingerprint.
    Pinned,
    /// No pin configured; accepted because unverified keys are allowed.
    AcceptedUnverified { observed: String },
    Mismatch { expected: String, observed: String },
    /// No pin configured and unverified keys are refused.
    Rejected { observed: String },
}

impl HostKeyCheck {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Pinned | Self::AcceptedUnverified { .. })
    }

    pub fn into_result(self, host: &str) -> Result<Self> {
        match self {
            Self::Mismatch { expected, observed } => Err(RemoteError::HostKeyMismatch {
                host: host.to_string(),
                expected,
                observed,
            }),
            Self::Rejected { .. } => Err(RemoteError::HostKeyUnverified {
                host: host.to_string(),
            }),
            accepted => Ok(accepted),
        }
    }
}

pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, observed: &HostKeyFingerprint) -> HostKeyCheck;
}

/// Verifies against a per-host pin map, falling back to `allow_unverified`.
#[derive(Debug, Clone, Default)]
pub struct PinnedHostKeyVerifier {
    pins: HashMap<String, String>,
    allow_unverified: bool,
}

impl PinnedHostKeyVerifier {
    pub fn new(pins: HashMap<String, String>, allow_unverified: bool) -> Self {
        Self {
            pins,
            allow_unverified,
        }
    }
}

impl HostKeyVerifier for PinnedHostKeyVerifier {
    fn verify(&self, host: &str, observed: &HostKeyFingerprint) -> HostKeyCheck {
        if let Some(expected) = self.pins.get(host) {
            if observed.matches(expected) {
                return HostKeyCheck::Pinned;
            }
            return HostKeyCheck::Mismatch {
                expected: expected.clone(),
                observed: observed.openssh(),
            };
        }
        if self.allow_unverified {
            tracing::warn!(host, observed = %observed, "host key not verified; accepting unpinned key");
            return HostKeyCheck::AcceptedUnverified {
                observed: observed.openssh(),
            };
        }
        HostKeyCheck::Rejected {
            observed: observed.openssh(),
        }
    }
}
