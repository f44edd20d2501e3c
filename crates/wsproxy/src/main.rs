mod cli;
mod config;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};

use audit_log::{AuditEntry, AuditEvent, AuditPeer, AuditSink};
use ws_tunnel::{
    AllowList, ConnectHook, ConnectionContext, MiddlewarePipeline, Proxy, ProxyConfig,
};

use crate::cli::Cli;

// ---------------------------------------------------------------------------
// AccessLog
// ---------------------------------------------------------------------------

/// Connect hook emitting one structured line per admitted connection.
struct AccessLog;

#[async_trait]
impl ConnectHook for AccessLog {
    fn name(&self) -> &str {
        "access-log"
    }

    async fn on_connect(&self, ctx: &ConnectionContext) {
        info!(
            session_id = %ctx.session_id,
            remote_addr = %ctx.remote_address,
            target = %ctx.target,
            "connection admitted"
        );
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Resolve on ctrl-c, or SIGTERM where available.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT (ctrl-c)"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(err) => warn!(%err, "failed to register SIGTERM handler"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("received SIGINT (ctrl-c)");
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref listen) = cli.listen {
        cfg.listen_addr = listen.clone();
    }
    if let Some(ref allow) = cli.allow {
        cfg.allow = allow.split(',').map(str::to_string).collect();
    }
    let listen_addr = cfg.listen_socket_addr(cli.port)?;

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!(
        config_file = %cli.config.display(),
        listen = %listen_addr,
        "wsproxy starting"
    );
    if !cli.config.exists() {
        warn!(
            path = %cli.config.display(),
            "configuration file not found; using defaults"
        );
    }

    // 4. Start audit logger, if configured.
    let (audit, audit_handle) = match &cfg.logging.audit_log_path {
        Some(path) => {
            let (sink, handle) = AuditSink::start(path)
                .await
                .context("failed to start audit logger")?;
            (sink, Some(handle))
        }
        None => (AuditSink::disabled(), None),
    };
    info!(
        enabled = audit.is_enabled(),
        path = ?cfg.logging.audit_log_path,
        "audit logging configured"
    );

    audit
        .log(AuditEntry::new(
            AuditEvent::ProcessStarted,
            AuditPeer::new("wsproxy"),
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "config_file": cli.config.display().to_string(),
                "listen_addr": listen_addr.to_string(),
            }),
        ))
        .await;

    // 5. Build the hook pipeline.
    let allow = AllowList::new(&cfg.allow);
    if allow.allows_all() {
        info!("allow-list empty; every target is reachable");
    } else {
        info!(entries = allow.len(), "allow-list loaded");
    }

    let pipeline = MiddlewarePipeline::builder()
        .verify(allow)
        .connect(AccessLog)
        .build();

    // 6. Set up shutdown signal (ctrl_c + SIGTERM).
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx_signal.send(());
    });

    // 7. Run the proxy until shutdown.
    let mut proxy_config = ProxyConfig::new(listen_addr, pipeline);
    proxy_config.session = cfg.session.to_session_config();
    proxy_config.audit = audit.clone();
    proxy_config.handshake_timeout = cfg.session.handshake_timeout();

    let proxy_result = Proxy::new(proxy_config).run(shutdown_rx).await;

    // 8. Log shutdown.
    info!("wsproxy shutting down");

    audit
        .log(AuditEntry::new(
            AuditEvent::ProcessStopped,
            AuditPeer::new("wsproxy"),
            serde_json::json!({
                "proxy_result": format!("{:?}", proxy_result),
            }),
        ))
        .await;

    // Let live sessions finish their close before the writer drains.
    drop(shutdown_tx);
    drop(audit);
    if let Some(handle) = audit_handle {
        let grace = cfg.session.to_session_config().linger + Duration::from_secs(1);
        if tokio::time::timeout(grace, handle).await.is_err() {
            warn!("audit writer did not finish before exit");
        }
    }

    proxy_result
}
