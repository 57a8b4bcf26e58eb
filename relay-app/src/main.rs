//! shellrelay: drive remote shells and the Pterodactyl installer from chat.

mod audit;
mod channel_plugins;
mod commands;
mod config;
mod confirmation;
mod error;
mod gateway;
mod guard;
mod init;
mod outbox;
mod provisioning;
mod redact;
mod registry;
mod remote_session;
mod routes;
mod server;
mod state;
mod streaming;
#[cfg(test)]
mod test_support;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

const DEFAULT_LOG_FILTER: &str =
    "info,shellrelay=debug,relay_app=debug,relay_channels=debug,relay_remote=debug,tower_http=info";

#[derive(Debug, Parser)]
#[command(
    name = "shellrelay",
    version,
    about = "Chat-driven SSH gateway for Pterodactyl provisioning"
)]
struct Cli {
    /// Config file path (defaults to ~/.shellrelay/config.toml).
    #[arg(long, global = true, env = "SHELLRELAY_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay (default).
    Serve,
    /// Initialize ~/.shellrelay with a config template (idempotent).
    Init,
    /// Validate config and report the effective policy.
    Doctor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    fn from_env() -> anyhow::Result<Self> {
        let Ok(raw) = std::env::var("SHELLRELAY_LOG_FORMAT") else {
            return Ok(Self::Json);
        };
        Self::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "unsupported SHELLRELAY_LOG_FORMAT={raw:?}; expected one of: json, pretty, compact"
            )
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match dotenvy::dotenv() {
        Err(e) if !e.not_found() => return Err(anyhow::anyhow!("load .env: {e}")),
        _ => {}
    }
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Init => {
            let report = init::initialize_default().await?;
            if report.created.is_empty() {
                println!(
                    "shellrelay init: already initialized at {}",
                    report.root.display()
                );
            } else {
                println!("shellrelay init: initialized {}", report.root.display());
                for path in &report.created {
                    println!("created {}", path.display());
                }
                if !report.skipped.is_empty() {
                    println!("kept {} existing file(s) unchanged", report.skipped.len());
                }
            }
            println!(
                "next: set owner.identity and owner.pin in {}",
                report.root.join("config.toml").display()
            );
            Ok(())
        }
        Command::Doctor => server::doctor(cli.config).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let log_format = LogFormat::from_env()?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);
    match log_format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }

    tracing::info!(
        log_format = ?log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
