//! shellrelay configuration loader.
//!
//! Values come from a TOML file, then environment overrides (a `.env` file is
//! loaded by `main` before this runs). Any validation failure is fatal.

use relay_remote::AuthMaterial;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) const WHATSAPP_JID_DOMAIN: &str = "s.whatsapp.net";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub owner: OwnerConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Clone, Default, Deserialize)]
pub struct OwnerConfig {
    /// Transport identity of the single authorized operator,
    /// e.g. `628123456789@s.whatsapp.net`.
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub pin: String,
}

impl std::fmt::Debug for OwnerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerConfig")
            .field("identity", &self.identity)
            .field("pin", &"********")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshAuthMode {
    #[default]
    Key,
    Password,
}

#[derive(Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_key_path")]
    pub key_path: String,
    #[serde(default)]
    pub auth_mode: SshAuthMode,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Accept hosts without a pinned fingerprint. Insecure; off by default.
    #[serde(default)]
    pub allow_unverified_hostkey: bool,
    /// host -> SHA-256 fingerprint (hex or `SHA256:<base64>`).
    #[serde(default)]
    pub host_fingerprints: HashMap<String, String>,
}

fn default_ssh_key_path() -> String {
    "~/.ssh/id_rsa".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_path: default_ssh_key_path(),
            auth_mode: SshAuthMode::default(),
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            allow_unverified_hostkey: false,
            host_fingerprints: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("key_path", &self.key_path)
            .field("auth_mode", &self.auth_mode)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("allow_unverified_hostkey", &self.allow_unverified_hostkey)
            .field("host_fingerprints", &self.host_fingerprints)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Exact host names allowed for `.connect`. Empty allows every host.
    #[serde(default)]
    pub host_whitelist: Vec<String>,
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_session_idle_ms")]
    pub session_idle_ms: u64,
    #[serde(default = "default_affirmative_token")]
    pub affirmative_token: String,
}

fn default_rate_limit_ms() -> u64 {
    1_200
}

fn default_session_idle_ms() -> u64 {
    600_000
}

fn default_affirmative_token() -> String {
    "YA".to_string()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            host_whitelist: Vec::new(),
            rate_limit_ms: default_rate_limit_ms(),
            session_idle_ms: default_session_idle_ms(),
            affirmative_token: default_affirmative_token(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,
    #[serde(default = "default_chunk_pacing_ms")]
    pub chunk_pacing_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_installer_load_delay_ms")]
    pub installer_load_delay_ms: u64,
}

fn default_chunk_max_chars() -> usize {
    3_500
}

fn default_chunk_pacing_ms() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_settle_delay_ms() -> u64 {
    2_000
}

fn default_installer_load_delay_ms() -> u64 {
    3_000
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_max_chars: default_chunk_max_chars(),
            chunk_pacing_ms: default_chunk_pacing_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            installer_load_delay_ms: default_installer_load_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_delivery_delay_ms")]
    pub delivery_delay_ms: u64,
}

fn default_audit_log_dir() -> String {
    "logs".to_string()
}

fn default_delivery_delay_ms() -> u64 {
    1_000
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: default_audit_log_dir(),
            delivery_delay_ms: default_delivery_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

#[derive(Clone, Default, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default)]
    pub webhook_verify_token: String,
    #[serde(default)]
    pub app_secret: Option<String>,
}

impl std::fmt::Debug for WhatsAppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhatsAppConfig")
            .field("enabled", &self.enabled)
            .field("phone_number_id", &self.phone_number_id)
            .field("app_secret_configured", &self.app_secret.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

impl RelayConfig {
    /// Load the config file and return it with the path it was read from.
    ///
    /// An explicit path must exist. A missing file at the default location
    /// yields defaults, so env-only deployments work.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = match path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::info!(
                    config_path = %path.display(),
                    "config file not found; using defaults and environment"
                );
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OWNER_NUMBER") {
            self.owner.identity = owner_identity_from_number(&v);
        }
        if let Some(v) = get("OWNER_PIN") {
            self.owner.pin = v.trim().to_string();
        }
        if let Some(v) = get("SSH_KEY_PATH") {
            self.ssh.key_path = v;
        }
        if let Some(v) = get("HOST_WHITELIST") {
            self.policy.host_whitelist = v
                .split(',')
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(ToOwned::to_owned)
                .collect();
        }
        if let Some(v) = get("HOSTKEY_SHA256_MAP") {
            self.ssh.host_fingerprints = serde_json::from_str(&v)
                .map_err(|e| anyhow::anyhow!("HOSTKEY_SHA256_MAP must be a JSON object: {e}"))?;
        }
        if let Some(v) = get("RATE_LIMIT_MS") {
            self.policy.rate_limit_ms = parse_u64("RATE_LIMIT_MS", &v)?;
        }
        if let Some(v) = get("SESSION_IDLE_MS") {
            self.policy.session_idle_ms = parse_u64("SESSION_IDLE_MS", &v)?;
        }
        if let Some(v) = get("ALLOW_UNOFFICIAL") {
            self.ssh.allow_unverified_hostkey = parse_bool("ALLOW_UNOFFICIAL", &v)?;
        }
        if let Some(v) = get("SSH_USE_PASSWORD") {
            self.ssh.auth_mode = if parse_bool("SSH_USE_PASSWORD", &v)? {
                SshAuthMode::Password
            } else {
                SshAuthMode::Key
            };
        }
        if let Some(v) = get("SSH_PASSWORD") {
            self.ssh.password = Some(v);
        }
        if let Some(v) = get("WHATSAPP_ACCESS_TOKEN") {
            self.channels.whatsapp.access_token = v;
            self.channels.whatsapp.enabled = true;
        }
        if let Some(v) = get("WHATSAPP_PHONE_NUMBER_ID") {
            self.channels.whatsapp.phone_number_id = v;
        }
        if let Some(v) = get("WHATSAPP_VERIFY_TOKEN") {
            self.channels.whatsapp.webhook_verify_token = v;
        }
        if let Some(v) = get("WHATSAPP_APP_SECRET") {
            self.channels.whatsapp.app_secret = Some(v);
        }
        if let Some(v) = get("SHELLRELAY_BIND_ADDR") {
            self.runtime.bind_addr = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.owner.identity.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "owner.identity is required (or set OWNER_NUMBER)"
            ));
        }
        if self.owner.pin.trim().is_empty() {
            return Err(anyhow::anyhow!("owner.pin is required (or set OWNER_PIN)"));
        }
        match self.ssh.auth_mode {
            SshAuthMode::Key if self.ssh.key_path.trim().is_empty() => {
                return Err(anyhow::anyhow!("ssh.key_path is required for key auth"));
            }
            SshAuthMode::Password
                if self
                    .ssh
                    .password
                    .as_deref()
                    .is_none_or(|p| p.is_empty()) =>
            {
                return Err(anyhow::anyhow!(
                    "ssh.password is required when ssh.auth_mode = \"password\""
                ));
            }
            _ => {}
        }
        for (name, value) in [
            ("ssh.connect_timeout_ms", self.ssh.connect_timeout_ms),
            ("policy.rate_limit_ms", self.policy.rate_limit_ms),
            ("policy.session_idle_ms", self.policy.session_idle_ms),
            ("streaming.poll_interval_ms", self.streaming.poll_interval_ms),
            ("runtime.http_timeout_seconds", self.runtime.http_timeout_seconds),
        ] {
            if value == 0 {
                return Err(anyhow::anyhow!("{name} must be > 0"));
            }
        }
        if self.streaming.chunk_max_chars == 0 {
            return Err(anyhow::anyhow!("streaming.chunk_max_chars must be > 0"));
        }
        if self.runtime.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("runtime.http_max_in_flight must be > 0"));
        }
        if self.policy.affirmative_token.trim().is_empty() {
            return Err(anyhow::anyhow!("policy.affirmative_token must not be empty"));
        }
        if self.audit.log_dir.trim().is_empty() {
            return Err(anyhow::anyhow!("audit.log_dir must not be empty"));
        }
        let whatsapp = &self.channels.whatsapp;
        if whatsapp.enabled {
            for (name, value) in [
                ("channels.whatsapp.access_token", &whatsapp.access_token),
                ("channels.whatsapp.phone_number_id", &whatsapp.phone_number_id),
                (
                    "channels.whatsapp.webhook_verify_token",
                    &whatsapp.webhook_verify_token,
                ),
            ] {
                if value.trim().is_empty() {
                    return Err(anyhow::anyhow!(
                        "{name} is required when channels.whatsapp.enabled = true"
                    ));
                }
            }
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.runtime
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid runtime.bind_addr {:?}: {e}", self.runtime.bind_addr))
    }

    pub fn auth_material(&self) -> anyhow::Result<AuthMaterial> {
        match self.ssh.auth_mode {
            SshAuthMode::Key => Ok(AuthMaterial::PrivateKeyFile(expand_home(&self.ssh.key_path)?)),
            SshAuthMode::Password => Ok(AuthMaterial::Password(
                self.ssh.password.clone().unwrap_or_default(),
            )),
        }
    }

    pub fn audit_dir(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.audit.log_dir)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.ssh.connect_timeout_ms)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.policy.rate_limit_ms)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_millis(self.policy.session_idle_ms)
    }
}

/// `OWNER_NUMBER` is a phone number; turn it into a WhatsApp JID unless it
/// already carries a domain.
fn owner_identity_from_number(raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains('@') {
        return raw.to_string();
    }
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    format!("{digits}@{WHATSAPP_JID_DOMAIN}")
}

fn parse_u64(name: &str, value: &str) -> anyhow::Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{name} must be an unsigned integer: {e}"))
}

fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("{name} must be true or false, got {other:?}")),
    }
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    let Some(rest) = trimmed.strip_prefix("~/") else {
        return Ok(PathBuf::from(trimmed));
    };
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(Path::new(&home).join(rest))
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(Path::new(&home).join(".shellrelay").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[owner]
identity = "628123456789@s.whatsapp.net"
pin = "482913"
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_sections_are_missing() {
        let cfg = RelayConfig::parse(MINIMAL).expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.policy.rate_limit_ms, 1_200);
        assert_eq!(cfg.policy.session_idle_ms, 600_000);
        assert_eq!(cfg.policy.affirmative_token, "YA");
        assert_eq!(cfg.streaming.chunk_max_chars, 3_500);
        assert_eq!(cfg.streaming.chunk_pacing_ms, 600);
        assert_eq!(cfg.streaming.poll_interval_ms, 5_000);
        assert_eq!(cfg.ssh.connect_timeout_ms, 30_000);
        assert!(!cfg.ssh.allow_unverified_hostkey);
        assert_eq!(cfg.audit.log_dir, "logs");
        assert_eq!(cfg.bind_addr().expect("addr").port(), 8787);
    }

    #[test]
    fn owner_identity_and_pin_are_required() {
        let err = RelayConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("owner.identity"));

        let mut cfg = RelayConfig::default();
        cfg.owner.identity = "628123@s.whatsapp.net".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("owner.pin"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut cfg = RelayConfig::parse(MINIMAL).expect("parse");
        cfg.apply_env_overrides(env(&[
            ("OWNER_NUMBER", "+62 812-0000"),
            ("OWNER_PIN", "111111"),
            ("HOST_WHITELIST", "node-1.example.com, 10.0.0.5 ,,"),
            ("HOSTKEY_SHA256_MAP", r#"{"node-1.example.com":"SHA256:abc"}"#),
            ("RATE_LIMIT_MS", "2500"),
            ("ALLOW_UNOFFICIAL", "true"),
            ("SHELLRELAY_BIND_ADDR", "0.0.0.0:9000"),
        ]))
        .expect("overrides");

        assert_eq!(cfg.owner.identity, "628120000@s.whatsapp.net");
        assert_eq!(cfg.owner.pin, "111111");
        assert_eq!(
            cfg.policy.host_whitelist,
            vec!["node-1.example.com".to_string(), "10.0.0.5".to_string()]
        );
        assert_eq!(
            cfg.ssh.host_fingerprints.get("node-1.example.com").map(String::as_str),
            Some("SHA256:abc")
        );
        assert_eq!(cfg.policy.rate_limit_ms, 2_500);
        assert!(cfg.ssh.allow_unverified_hostkey);
        assert_eq!(cfg.bind_addr().expect("addr").port(), 9000);
    }

    #[test]
    fn malformed_env_values_are_errors() {
        let mut cfg = RelayConfig::parse(MINIMAL).expect("parse");
        assert!(
            cfg.apply_env_overrides(env(&[("HOSTKEY_SHA256_MAP", "not json")]))
                .is_err()
        );
        assert!(
            cfg.apply_env_overrides(env(&[("RATE_LIMIT_MS", "fast")]))
                .is_err()
        );
        assert!(
            cfg.apply_env_overrides(env(&[("ALLOW_UNOFFICIAL", "maybe")]))
                .is_err()
        );
    }

    #[test]
    fn password_mode_requires_password() {
        let mut cfg = RelayConfig::parse(MINIMAL).expect("parse");
        cfg.apply_env_overrides(env(&[("SSH_USE_PASSWORD", "true")]))
            .expect("overrides");
        assert!(cfg.validate().is_err());

        cfg.apply_env_overrides(env(&[("SSH_PASSWORD", "s3cret")]))
            .expect("overrides");
        cfg.validate().expect("valid with password");
        assert_eq!(cfg.auth_material().expect("auth").method(), "password");
    }

    #[test]
    fn enabled_whatsapp_requires_credentials() {
        let mut cfg = RelayConfig::parse(MINIMAL).expect("parse");
        cfg.apply_env_overrides(env(&[("WHATSAPP_ACCESS_TOKEN", "token")]))
            .expect("overrides");
        assert!(cfg.channels.whatsapp.enabled);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("phone_number_id"));

        cfg.apply_env_overrides(env(&[
            ("WHATSAPP_PHONE_NUMBER_ID", "10001"),
            ("WHATSAPP_VERIFY_TOKEN", "verify"),
        ]))
        .expect("overrides");
        cfg.validate().expect("valid");
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut cfg = RelayConfig::parse(MINIMAL).expect("parse");
        cfg.policy.session_idle_ms = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("session_idle_ms"));
    }

    #[test]
    fn secrets_are_not_debug_printed() {
        let mut cfg = RelayConfig::parse(MINIMAL).expect("parse");
        cfg.ssh.password = Some("hunter2".to_string());
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("482913"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.toml");
        assert!(RelayConfig::load_with_path(Some(missing)).await.is_err());
    }
}
