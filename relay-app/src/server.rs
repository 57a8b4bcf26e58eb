//! shellrelay server.
//!
//! Wires configuration, channel adapters, the gateway loop and the HTTP
//! surface together, then runs until a shutdown signal arrives.

use crate::channel_plugins;
use crate::config::{RelayConfig, SshAuthMode};
use crate::gateway::Gateway;
use crate::outbox::Outbox;
use crate::routes;
use crate::state::RelayState;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use relay_remote::{RemoteConnector, Ssh2Connector};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const INBOUND_QUEUE_CAPACITY: usize = 256;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    let audit_dir = cfg.audit_dir()?;
    let key_path = match cfg.ssh.auth_mode {
        SshAuthMode::Key => Some(crate::config::expand_home(&cfg.ssh.key_path)?),
        SshAuthMode::Password => None,
    };
    if let Some(key_path) = key_path.as_ref().filter(|path| !path.exists()) {
        tracing::warn!(key_path = %key_path.display(), "ssh private key not found");
    }
    tracing::info!(
        config_path = %path.display(),
        owner = %cfg.owner.identity,
        ssh_auth_mode = ?cfg.ssh.auth_mode,
        ssh_key_path = ?key_path,
        ssh_connect_timeout_ms = cfg.ssh.connect_timeout_ms,
        ssh_allow_unverified_hostkey = cfg.ssh.allow_unverified_hostkey,
        ssh_pinned_hosts = cfg.ssh.host_fingerprints.len(),
        host_whitelist = ?cfg.policy.host_whitelist,
        rate_limit_ms = cfg.policy.rate_limit_ms,
        session_idle_ms = cfg.policy.session_idle_ms,
        audit_dir = %audit_dir.display(),
        whatsapp_enabled = cfg.channels.whatsapp.enabled,
        bind_addr = %cfg.bind_addr()?,
        "config ok"
    );
    if cfg.ssh.allow_unverified_hostkey {
        tracing::warn!("allow_unverified_hostkey is enabled; hosts without a pinned fingerprint are accepted");
    }
    if cfg.policy.host_whitelist.is_empty() {
        tracing::warn!("policy.host_whitelist is empty; any host may be targeted after confirmation");
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        owner = %cfg.owner.identity,
        ssh_auth_mode = ?cfg.ssh.auth_mode,
        host_whitelist_len = cfg.policy.host_whitelist.len(),
        rate_limit_ms = cfg.policy.rate_limit_ms,
        session_idle_ms = cfg.policy.session_idle_ms,
        chunk_max_chars = cfg.streaming.chunk_max_chars,
        poll_interval_ms = cfg.streaming.poll_interval_ms,
        whatsapp_enabled = cfg.channels.whatsapp.enabled,
        runtime_http_timeout_seconds = cfg.runtime.http_timeout_seconds,
        runtime_http_max_in_flight = cfg.runtime.http_max_in_flight,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let loaded = channel_plugins::load_enabled_channels(&cfg, inbound_tx).await?;
    let channel_ids: Vec<String> = loaded.channels.keys().cloned().collect();

    let connector: Arc<dyn RemoteConnector> = Arc::new(Ssh2Connector);
    let state = Arc::new(RelayState::from_config(
        &cfg,
        Outbox::new(loaded.channels),
        connector,
    )?);

    let gateway = Arc::new(Gateway::new(Arc::clone(&state), inbound_rx));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!(channels = ?channel_ids, "gateway started");

    let mut relay_router = routes::router().layer(Extension(Arc::clone(&state)));
    for channel_router in loaded.routers {
        relay_router = relay_router.merge(channel_router);
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri().path(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                path = %request.uri().path(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = relay_router
        .layer(GlobalConcurrencyLimitLayer::new(
            cfg.runtime.http_max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.runtime.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "shellrelay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    let closed = state.shutdown_sessions();
    tracing::info!(sessions_closed = closed, "remote sessions closed");

    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> &str {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("missing")
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::warn!("received ctrl-c; beginning graceful shutdown");
                    }
                    _ = terminate.recv() => {
                        tracing::warn!("received SIGTERM; beginning graceful shutdown");
                    }
                    _ = shutdown.cancelled() => {}
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                wait_for_ctrl_c(&shutdown).await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        wait_for_ctrl_c(&shutdown).await;
    }
    shutdown.cancel();
}

#[cfg_attr(unix, allow(dead_code))]
async fn wait_for_ctrl_c(shutdown: &CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
            Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
        },
        _ = shutdown.cancelled() => {}
    }
}
