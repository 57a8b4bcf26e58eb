//! Configuration scaffolding for `shellrelay init`.
//!
//! Writes `~/.shellrelay/config.toml` from the bundled template. Existing
//! files are never overwritten.

use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
struct TemplateFile {
    relative_path: &'static str,
    contents: &'static str,
}

const TEMPLATE_FILES: &[TemplateFile] = &[
    TemplateFile {
        relative_path: "config.toml",
        contents: include_str!("../../config-templates/config.toml"),
    },
    TemplateFile {
        relative_path: "logs/.keep",
        contents: "",
    },
];

pub async fn initialize_default() -> Result<InitReport> {
    let config_path = crate::config::default_config_path()?;
    let root = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid default config path: {}", config_path.display()))?
        .to_path_buf();
    initialize_at_root(&root).await
}

pub async fn initialize_at_root(root: &Path) -> Result<InitReport> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| anyhow::anyhow!("create config root {}: {e}", root.display()))?;

    let mut report = InitReport {
        root: root.to_path_buf(),
        ..InitReport::default()
    };

    for template in TEMPLATE_FILES {
        let target = root.join(template.relative_path);
        if tokio::fs::try_exists(&target)
            .await
            .map_err(|e| anyhow::anyhow!("inspect config path {}: {e}", target.display()))?
        {
            tracing::debug!(path = %target.display(), "keeping existing file");
            report.skipped.push(target);
            continue;
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| anyhow::anyhow!("create config dir {}: {e}", parent.display()))?;
        }
        tokio::fs::write(&target, template.contents)
            .await
            .map_err(|e| anyhow::anyhow!("write config template {}: {e}", target.display()))?;
        report.created.push(target);
    }

    Ok(report)
}
