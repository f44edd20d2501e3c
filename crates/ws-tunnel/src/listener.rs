use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use audit_log::{AuditEntry, AuditEvent, AuditPeer, AuditSink};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::pipeline::{ConnectionContext, ConnectionInfo, MiddlewarePipeline};
use crate::session::{DirectDialer, Dialer, ProxySession, SessionConfig};
use crate::target::{identifier_from_path, Target};

const COMPONENT: &str = "listener";

/// Pause after a failed `accept` so a full fd table does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Body served to plain HTTP requests that do not ask for an upgrade.
const STATUS_BODY: &str = "wsProxy running...\n";

/// Request heads larger than this are left to the handshake to reject.
const REQUEST_HEAD_LIMIT: usize = 8 * 1024;

const PEEK_RETRY: Duration = Duration::from_millis(10);

pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Hooks consulted for every connection; shared read-only by all tasks.
    pub pipeline: Arc<MiddlewarePipeline>,
    pub session: SessionConfig,
    pub dialer: Arc<dyn Dialer>,
    pub audit: AuditSink,
    /// Upper bound on everything before the session starts: request head,
    /// upgrade, verify and connect hooks.
    pub handshake_timeout: Duration,
}

impl ProxyConfig {
    pub fn new(listen_addr: SocketAddr, pipeline: MiddlewarePipeline) -> Self {
        Self {
            listen_addr,
            pipeline: Arc::new(pipeline),
            session: SessionConfig::default(),
            dialer: Arc::new(DirectDialer),
            audit: AuditSink::disabled(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// WebSocket front end feeding [`ProxySession`]s.
///
/// Each accepted socket gets its own task: the upgrade path is decoded
/// during the handshake, the verify chain decides admission, the connect
/// chain observes it, and the session relays until one side goes away.
pub struct Proxy {
    config: Arc<ProxyConfig>,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub async fn bind(self) -> anyhow::Result<BoundProxy> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        Ok(BoundProxy {
            listener,
            config: self.config,
        })
    }

    /// Bind and serve until `shutdown` fires.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        self.bind().await?.serve(shutdown).await
    }
}

pub struct BoundProxy {
    listener: TcpListener,
    config: Arc<ProxyConfig>,
}

impl BoundProxy {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires. Live sessions receive the
    /// same signal and close themselves.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.local_addr()?,
            pipeline = ?self.config.pipeline,
            "Starting wsproxy"
        );

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.recv() => {
                    tracing::info!("listener shutting down");
                    return Ok(());
                }
            };

            let (stream, remote_addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let config = Arc::clone(&self.config);
            let shutdown = shutdown.resubscribe();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, remote_addr, config, shutdown).await {
                    tracing::debug!(%remote_addr, err = format!("{err:#}"), "connection dropped");
                }
            });
        }
    }
}

/// A connection that passed the handshake and both hook chains.
struct Admitted {
    ws: WebSocketStream<TcpStream>,
    target: Target,
    session_id: Uuid,
}

/// Drive one socket from handshake to session teardown.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let admission = tokio::time::timeout(
        config.handshake_timeout,
        admit(stream, remote_addr, &config),
    );

    let admitted = tokio::select! {
        admitted = admission => admitted
            .map_err(|_| anyhow::anyhow!("no session after {:?}", config.handshake_timeout))??,
        _ = shutdown.recv() => {
            tracing::debug!(%remote_addr, "shutdown before session start");
            return Ok(());
        }
    };

    let Some(Admitted {
        ws,
        target,
        session_id,
    }) = admitted
    else {
        return Ok(());
    };

    config
        .audit
        .log(AuditEntry::new(
            AuditEvent::SessionOpened,
            peer(remote_addr)
                .with_session_id(session_id)
                .with_target(target.to_string()),
            serde_json::json!({}),
        ))
        .await;

    let session = ProxySession::new(ws, target, remote_addr)
        .with_id(session_id)
        .with_config(config.session.clone())
        .with_dialer(Arc::clone(&config.dialer));
    let handle = session.handle();
    let run = session.run();
    tokio::pin!(run);

    let summary = tokio::select! {
        summary = &mut run => summary,
        _ = shutdown.recv() => {
            handle.close();
            run.await
        }
    };

    config
        .audit
        .log(AuditEntry::new(
            AuditEvent::SessionClosed,
            peer(remote_addr)
                .with_session_id(summary.session_id)
                .with_target(summary.target.to_string()),
            serde_json::json!({
                "reason": summary.close_reason.as_str(),
                "bytes_up": summary.bytes_up,
                "bytes_down": summary.bytes_down,
            }),
        ))
        .await;

    Ok(())
}

/// Everything between accept and session start. `None` means the
/// connection was answered or rejected without a session.
async fn admit(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    config: &ProxyConfig,
) -> anyhow::Result<Option<Admitted>> {
    // ------------------------------------------------------------------
    // 1. Plain HTTP requests get the status page.
    // ------------------------------------------------------------------
    let kind = peek_request(&stream)
        .await
        .context("failed to read request head")?;
    if let RequestKind::Plain { head_len } = kind {
        serve_status(&mut stream, head_len)
            .await
            .context("failed to answer status request")?;
        return Ok(None);
    }

    // ------------------------------------------------------------------
    // 2. Handshake. The target is decoded from the request path inside the
    //    callback so an unreadable identifier never completes the upgrade.
    // ------------------------------------------------------------------
    let mut requested: Option<(String, Target)> = None;

    let callback = |req: &HsRequest, response: HsResponse| -> Result<HsResponse, ErrorResponse> {
        let raw = identifier_from_path(req.uri().path()).to_string();
        match Target::decode(&raw) {
            Ok(target) => {
                requested = Some((raw, target));
                Ok(response)
            }
            Err(err) => {
                tracing::info!(%remote_addr, target = %raw, %err, "rejected undecodable target");
                config.audit.record(AuditEntry::new(
                    AuditEvent::ConnectionRejected,
                    peer(remote_addr).with_target(raw.as_str()),
                    serde_json::json!({ "reason": "decode", "error": err.to_string() }),
                ));
                let mut rejection = ErrorResponse::new(Some(format!("invalid target: {err}")));
                *rejection.status_mut() = StatusCode::BAD_REQUEST;
                Err(rejection)
            }
        }
    };

    let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .context("websocket handshake failed")?;

    let Some((raw, target)) = requested else {
        anyhow::bail!("handshake completed without a decoded target");
    };

    // ------------------------------------------------------------------
    // 3. Verify chain.
    // ------------------------------------------------------------------
    let info = ConnectionInfo {
        remote_address: remote_addr,
        requested_target_raw: raw,
    };

    if !config.pipeline.run_verify(&info).await {
        config
            .audit
            .log(AuditEntry::new(
                AuditEvent::ConnectionRejected,
                peer(remote_addr).with_target(target.to_string()),
                serde_json::json!({ "reason": "policy" }),
            ))
            .await;

        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: "target not allowed".into(),
        };
        if let Err(err) = ws.close(Some(frame)).await {
            tracing::trace!(%err, "close after rejection failed");
        }
        return Ok(None);
    }

    // ------------------------------------------------------------------
    // 4. Connect chain.
    // ------------------------------------------------------------------
    let session_id = Uuid::new_v4();
    let ctx = ConnectionContext {
        session_id,
        remote_address: remote_addr,
        target: target.clone(),
    };
    config.pipeline.run_connect(&ctx).await;

    Ok(Some(Admitted {
        ws,
        target,
        session_id,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Upgrade,
    Plain { head_len: usize },
}

/// Look at the request head without consuming it, so the WebSocket
/// handshake still sees the full request.
async fn peek_request(stream: &TcpStream) -> std::io::Result<RequestKind> {
    let mut buf = vec![0u8; REQUEST_HEAD_LIMIT];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if let Some(kind) = classify_request(&buf[..n]) {
            return Ok(kind);
        }
        if n == buf.len() {
            return Ok(RequestKind::Upgrade);
        }
        // Head still incomplete; peek keeps returning the same bytes.
        tokio::time::sleep(PEEK_RETRY).await;
    }
}

/// `None` until the blank line ending the head has arrived.
fn classify_request(bytes: &[u8]) -> Option<RequestKind> {
    let end = bytes.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&bytes[..end]);

    let upgrade = head
        .lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
        });

    Some(if upgrade {
        RequestKind::Upgrade
    } else {
        RequestKind::Plain { head_len: end + 4 }
    })
}

async fn serve_status(stream: &mut TcpStream, head_len: usize) -> std::io::Result<()> {
    let mut head = vec![0u8; head_len];
    stream.read_exact(&mut head).await?;

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{STATUS_BODY}",
        StatusCode::OK,
        STATUS_BODY.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn peer(remote_addr: SocketAddr) -> AuditPeer {
    AuditPeer::new(COMPONENT).with_remote_addr(remote_addr)
}
