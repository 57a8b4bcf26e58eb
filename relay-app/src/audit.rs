//! Append-only per-session audit log.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Creates `<dir>/<sanitized-host>_<start-millis>.log`.
    pub fn create(dir: &Path, host: &str, started_at: DateTime<Utc>) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{}_{}.log",
            sanitize_host(host),
            started_at.timestamp_millis()
        ));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one timestamped entry. Write failures are logged, not returned.
    pub fn record(&self, message: &str) {
        let line = format!(
            "[{}] {message}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            tracing::warn!(path = %self.path.display(), error = %e, "audit write failed");
        }
    }
}

/// Keeps `[A-Za-z0-9._-]`; everything else becomes `_`.
pub fn sanitize_host(host: &str) -> String {
    let sanitized: String = host
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        return "host".to_string();
    }
    sanitized
}
