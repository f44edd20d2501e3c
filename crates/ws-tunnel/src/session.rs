//! One WebSocket client bridged to one outbound TCP connection.
//!
//! ```text
//!  ws_rx ──► read_inbound ──► backlog (mpsc) ──► write_outbound ──► tcp_tx
//!  ws_tx ◄────────────────── forward_outbound ◄──────────────────── tcp_rx
//! ```
//!
//! The inbound reader starts as soon as the session runs, so messages that
//! arrive while the outbound socket is still connecting queue up in the
//! backlog instead of being lost. When the backlog is full the reader stops
//! pulling from the WebSocket, which pushes back on the client.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, trace, Instrument};
use uuid::Uuid;

use crate::target::Target;

/// Largest chunk read from the outbound socket per WebSocket message.
pub const BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on the outbound dial. `None` waits as long as the OS does.
    pub connect_timeout: Option<Duration>,
    /// Inbound messages held while the outbound side catches up.
    pub backlog: usize,
    /// How long teardown may spend flushing the backlog and closing sockets.
    pub linger: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            backlog: 256,
            linger: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    InboundClosed,
    InboundError,
    OutboundClosed,
    OutboundError,
    ConnectFailed,
    ConnectTimedOut,
    Requested,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InboundClosed => "inbound_closed",
            Self::InboundError => "inbound_error",
            Self::OutboundClosed => "outbound_closed",
            Self::OutboundError => "outbound_error",
            Self::ConnectFailed => "connect_failed",
            Self::ConnectTimedOut => "connect_timed_out",
            Self::Requested => "requested",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read/write/connect failure on either side of a session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket transport: {0}")]
    WebSocket(#[from] WsError),
    #[error("tcp transport: {0}")]
    Tcp(#[from] io::Error),
}

impl TransportError {
    /// True for failures that only mean the other end is already gone.
    ///
    /// These show up when a write races with teardown and are absorbed
    /// rather than reported.
    pub fn is_ignorable(&self) -> bool {
        match self {
            Self::WebSocket(WsError::ConnectionClosed | WsError::AlreadyClosed) => true,
            Self::WebSocket(WsError::Protocol(
                ProtocolError::ResetWithoutClosingHandshake | ProtocolError::SendAfterClosing,
            )) => true,
            Self::WebSocket(WsError::Io(err)) | Self::Tcp(err) => is_disconnect(err.kind()),
            Self::WebSocket(_) => false,
        }
    }
}

fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Opens the outbound connection for a session.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &Target) -> io::Result<TcpStream>;
}

/// Plain `TcpStream::connect` with `TCP_NODELAY` set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, target: &Target) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((target.host(), target.port())).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Handle for observing a session and asking it to close from outside.
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<watch::Sender<SessionState>>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Request teardown. Returns `false` if the session was already closed.
    pub fn close(&self) -> bool {
        mark_closed(&self.state)
    }

    /// Resolves once the session has reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub target: Target,
    pub close_reason: CloseReason,
    /// Bytes written from the client to the target.
    pub bytes_up: u64,
    /// Bytes sent from the target back to the client.
    pub bytes_down: u64,
}

#[derive(Default)]
struct Traffic {
    up: u64,
    down: u64,
}

/// A single client-to-target tunnel.
///
/// Owns the inbound WebSocket and, once dialed, the outbound TCP stream.
/// The outbound side is dialed once; there is no reconnect.
pub struct ProxySession<S> {
    id: Uuid,
    inbound: S,
    target: Target,
    from: SocketAddr,
    config: SessionConfig,
    dialer: Arc<dyn Dialer>,
    state: Arc<watch::Sender<SessionState>>,
}

impl<S> ProxySession<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send,
{
    pub fn new(inbound: S, target: Target, from: SocketAddr) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id: Uuid::new_v4(),
            inbound,
            target,
            from,
            config: SessionConfig::default(),
            dialer: Arc::new(DirectDialer),
            state: Arc::new(state),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Dial the target and relay until either side ends or a close is
    /// requested through a [`SessionHandle`].
    pub async fn run(self) -> SessionSummary {
        let span = tracing::info_span!(
            "session",
            session_id = %self.id,
            from = %self.from,
            target = %self.target,
        );
        self.relay().instrument(span).await
    }

    async fn relay(self) -> SessionSummary {
        let Self {
            id,
            inbound,
            target,
            from,
            config,
            dialer,
            state,
        } = self;

        info!("Requested connection from '{from}' to '{target}' [ACCEPTED]");

        let (mut ws_tx, mut ws_rx) = inbound.split();
        let (backlog_tx, mut backlog_rx) = mpsc::channel::<Bytes>(config.backlog.max(1));
        let mut closed = state.subscribe();
        let mut traffic = Traffic::default();

        let mut reader = Box::pin(read_inbound(&mut ws_rx, backlog_tx));
        let mut inbound_done: Option<CloseReason> = None;

        // A client that closes while we are still dialing keeps its queued
        // payloads: the dial continues, bounded by `linger` from that point.
        let dialed = {
            let dialing = dial(dialer.as_ref(), &target, config.connect_timeout);
            let deadline = tokio::time::sleep(config.linger);
            tokio::pin!(dialing, deadline);

            loop {
                tokio::select! {
                    result = &mut dialing => break result,
                    reason = reader.as_mut(), if inbound_done.is_none() => {
                        debug!(%reason, "inbound finished while connecting");
                        deadline.as_mut().reset(Instant::now() + config.linger);
                        inbound_done = Some(reason);
                    }
                    _ = &mut deadline, if inbound_done.is_some() => {
                        debug!("outbound connect outlived linger after inbound closed");
                        break Err(inbound_done.unwrap_or(CloseReason::InboundClosed));
                    }
                    _ = wait_closed(&mut closed) => break Err(CloseReason::Requested),
                }
            }
        };

        let reason = match dialed {
            Err(reason) => reason,
            // Closed from outside while the dial was in flight.
            Ok(_) if !activate(&state) => CloseReason::Requested,
            Ok(stream) => {
                info!("Connection accepted from '{target}'");
                let (mut tcp_rx, mut tcp_tx) = stream.into_split();
                let reason = pump(
                    &mut reader,
                    inbound_done,
                    &mut backlog_rx,
                    &mut tcp_tx,
                    &mut tcp_rx,
                    &mut ws_tx,
                    &mut closed,
                    config.linger,
                    &mut traffic,
                )
                .await;

                match tokio::time::timeout(config.linger, tcp_tx.shutdown()).await {
                    Ok(Err(err)) => trace!(%err, "outbound shutdown failed"),
                    Err(_) => trace!("outbound shutdown timed out"),
                    Ok(Ok(())) => {}
                }
                reason
            }
        };

        drop(reader);
        mark_closed(&state);

        match tokio::time::timeout(config.linger, ws_tx.close()).await {
            Ok(Err(err)) => trace!(%err, "inbound close failed"),
            Err(_) => trace!("inbound close timed out"),
            Ok(Ok(())) => {}
        }

        info!(
            reason = %reason,
            bytes_up = traffic.up,
            bytes_down = traffic.down,
            "session closed"
        );

        SessionSummary {
            session_id: id,
            target,
            close_reason: reason,
            bytes_up: traffic.up,
            bytes_down: traffic.down,
        }
    }
}

/// One-shot `Connecting -> Active`.
fn activate(state: &watch::Sender<SessionState>) -> bool {
    state.send_if_modified(|s| {
        if *s == SessionState::Connecting {
            *s = SessionState::Active;
            true
        } else {
            false
        }
    })
}

/// One-shot transition into `Closed`. Every teardown path goes through here.
fn mark_closed(state: &watch::Sender<SessionState>) -> bool {
    state.send_if_modified(|s| {
        if *s == SessionState::Closed {
            false
        } else {
            *s = SessionState::Closed;
            true
        }
    })
}

async fn wait_closed(rx: &mut watch::Receiver<SessionState>) {
    // The sender outlives every receiver held by the session.
    let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
}

async fn dial(
    dialer: &dyn Dialer,
    target: &Target,
    limit: Option<Duration>,
) -> Result<TcpStream, CloseReason> {
    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, dialer.dial(target)).await {
            Ok(result) => result,
            Err(_) => {
                info!(timeout_ms = limit.as_millis() as u64, "outbound connect timed out");
                return Err(CloseReason::ConnectTimedOut);
            }
        },
        None => dialer.dial(target).await,
    };

    result.map_err(|err| {
        info!(%err, "outbound connect failed");
        CloseReason::ConnectFailed
    })
}

/// Steady-state relay. Returns once the session should tear down.
///
/// When the client side finishes first, whatever it already sent is still
/// written to the target, bounded by `linger`.
#[allow(clippy::too_many_arguments)]
async fn pump<R, W>(
    reader: &mut Pin<Box<R>>,
    mut inbound_done: Option<CloseReason>,
    backlog: &mut mpsc::Receiver<Bytes>,
    tcp_tx: &mut OwnedWriteHalf,
    tcp_rx: &mut OwnedReadHalf,
    ws_tx: &mut W,
    closed: &mut watch::Receiver<SessionState>,
    linger: Duration,
    traffic: &mut Traffic,
) -> CloseReason
where
    R: std::future::Future<Output = CloseReason>,
    W: Sink<Message, Error = WsError> + Unpin,
{
    let Traffic { up, down } = traffic;
    let writer = write_outbound(backlog, tcp_tx, up);
    let downlink = forward_outbound(tcp_rx, ws_tx, down);
    let deadline = tokio::time::sleep(linger);
    tokio::pin!(writer, downlink, deadline);

    loop {
        tokio::select! {
            reason = reader.as_mut(), if inbound_done.is_none() => {
                debug!(%reason, "inbound finished, flushing backlog");
                deadline.as_mut().reset(Instant::now() + linger);
                inbound_done = Some(reason);
            }
            result = &mut writer => {
                return match result {
                    Ok(()) => inbound_done.unwrap_or(CloseReason::InboundClosed),
                    Err(reason) => reason,
                };
            }
            reason = &mut downlink => return reason,
            _ = &mut deadline, if inbound_done.is_some() => {
                debug!("backlog not flushed before linger expired");
                return inbound_done.unwrap_or(CloseReason::InboundClosed);
            }
            _ = wait_closed(closed) => return CloseReason::Requested,
        }
    }
}

/// Next data payload from the client, skipping control frames.
async fn next_payload<R>(ws_rx: &mut R) -> Result<Bytes, CloseReason>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match ws_rx.next().await {
            Some(Ok(msg @ (Message::Binary(_) | Message::Text(_)))) => return Ok(msg.into_data()),
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "inbound sent close");
                return Err(CloseReason::InboundClosed);
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                let err = TransportError::from(err);
                if err.is_ignorable() {
                    debug!(%err, "inbound disconnected");
                    return Err(CloseReason::InboundClosed);
                }
                info!(%err, "inbound transport error");
                return Err(CloseReason::InboundError);
            }
            None => return Err(CloseReason::InboundClosed),
        }
    }
}

async fn read_inbound<R>(ws_rx: &mut R, backlog: mpsc::Sender<Bytes>) -> CloseReason
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let payload = match next_payload(ws_rx).await {
            Ok(payload) => payload,
            Err(reason) => return reason,
        };
        if backlog.send(payload).await.is_err() {
            return CloseReason::Requested;
        }
    }
}

/// Drain the backlog into the target socket in arrival order.
async fn write_outbound(
    backlog: &mut mpsc::Receiver<Bytes>,
    tcp_tx: &mut OwnedWriteHalf,
    written: &mut u64,
) -> Result<(), CloseReason> {
    while let Some(chunk) = backlog.recv().await {
        match tcp_tx.write_all(&chunk).await {
            Ok(()) => *written += chunk.len() as u64,
            Err(err) => {
                let err = TransportError::Tcp(err);
                if !err.is_ignorable() {
                    info!(%err, "outbound write failed");
                    return Err(CloseReason::OutboundError);
                }
                trace!(%err, "outbound write after close ignored");
            }
        }
    }
    Ok(())
}

/// Send every chunk read from the target to the client as one binary message.
async fn forward_outbound<W>(tcp_rx: &mut OwnedReadHalf, ws_tx: &mut W, sent: &mut u64) -> CloseReason
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match tcp_rx.read(&mut buf).await {
            Ok(0) => {
                debug!("outbound closed");
                return CloseReason::OutboundClosed;
            }
            Ok(n) => n,
            Err(err) => {
                info!(%err, "outbound read failed");
                return CloseReason::OutboundError;
            }
        };

        match ws_tx.send(Message::Binary(Bytes::copy_from_slice(&buf[..n]))).await {
            Ok(()) => *sent += n as u64,
            Err(err) => {
                let err = TransportError::from(err);
                if !err.is_ignorable() {
                    info!(%err, "inbound send failed");
                    return CloseReason::InboundError;
                }
                trace!(%err, "inbound send after close ignored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;
    use tokio::sync::{oneshot, Notify};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    type Ws = WebSocketStream<DuplexStream>;

    async fn ws_pair() -> (Ws, Ws) {
        let (server_io, client_io) = tokio::io::duplex(256 * 1024);
        tokio::join!(
            WebSocketStream::from_raw_socket(server_io, Role::Server, None),
            WebSocketStream::from_raw_socket(client_io, Role::Client, None),
        )
    }

    fn from_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn quick_config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Some(Duration::from_secs(2)),
            backlog: 64,
            linger: Duration::from_millis(200),
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) if stream.write_all(&buf[..n]).await.is_err() => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });
        addr
    }

    fn target(addr: SocketAddr) -> Target {
        Target::new(addr.ip().to_string(), addr.port())
    }

    /// Read binary messages until `expected` bytes have arrived.
    async fn collect(client: &mut Ws, expected: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < expected {
            let msg = tokio::time::timeout(TEST_TIMEOUT, client.next())
                .await
                .expect("timed out waiting for data")
                .expect("stream ended early")
                .expect("websocket error");
            if let Message::Binary(data) = msg {
                out.extend_from_slice(&data);
            }
        }
        out
    }

    /// Dialer that holds the session in `Connecting` until released.
    struct GatedDialer {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl Dialer for GatedDialer {
        async fn dial(&self, target: &Target) -> io::Result<TcpStream> {
            self.gate.notified().await;
            DirectDialer.dial(target).await
        }
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let addr = echo_server().await;
        let (server, mut client) = ws_pair().await;
        let session = ProxySession::new(server, target(addr), from_addr()).with_config(quick_config());
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        client.send(Message::Binary(Bytes::from_static(b"hello"))).await.unwrap();
        assert_eq!(collect(&mut client, 5).await, b"hello");
        assert_eq!(handle.state(), SessionState::Active);

        client.close(None).await.unwrap();
        let summary = tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(summary.close_reason, CloseReason::InboundClosed);
        assert_eq!(summary.bytes_up, 5);
        assert_eq!(summary.bytes_down, 5);
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn text_payload_is_forwarded_as_raw_bytes() {
        let addr = echo_server().await;
        let (server, mut client) = ws_pair().await;
        let session = ProxySession::new(server, target(addr), from_addr()).with_config(quick_config());
        tokio::spawn(session.run());

        client.send(Message::Text("ping".into())).await.unwrap();
        assert_eq!(collect(&mut client, 4).await, b"ping");
    }

    #[tokio::test]
    async fn messages_sent_while_connecting_are_forwarded_in_order() {
        let addr = echo_server().await;
        let gate = Arc::new(Notify::new());
        let (server, mut client) = ws_pair().await;
        let session = ProxySession::new(server, target(addr), from_addr())
            .with_config(quick_config())
            .with_dialer(Arc::new(GatedDialer {
                gate: Arc::clone(&gate),
            }));
        let handle = session.handle();
        tokio::spawn(session.run());

        let mut expected = Vec::new();
        for i in 0..20 {
            let msg = format!("msg-{i:02};");
            expected.extend_from_slice(msg.as_bytes());
            client.send(Message::Binary(msg.into_bytes().into())).await.unwrap();
        }
        // Let the reader pull everything into the backlog.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), SessionState::Connecting);

        gate.notify_one();
        assert_eq!(collect(&mut client, expected.len()).await, expected);
    }

    /// Target that records everything it receives until the peer's FIN.
    async fn sink_server() -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let _ = stream.read_to_end(&mut received).await;
            let _ = tx.send(received);
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn inbound_close_while_connecting_still_delivers_backlog() {
        let (addr, received) = sink_server().await;
        let gate = Arc::new(Notify::new());
        let (server, mut client) = ws_pair().await;
        let session = ProxySession::new(server, target(addr), from_addr())
            .with_config(SessionConfig {
                linger: Duration::from_secs(2),
                ..quick_config()
            })
            .with_dialer(Arc::new(GatedDialer {
                gate: Arc::clone(&gate),
            }));
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        for part in ["one;", "two;", "three;"] {
            client.send(Message::Binary(Bytes::from_static(part.as_bytes()))).await.unwrap();
        }
        client.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), SessionState::Connecting);

        gate.notify_one();
        let summary = tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(summary.close_reason, CloseReason::InboundClosed);
        assert_eq!(summary.bytes_up, 14);

        let received = tokio::time::timeout(TEST_TIMEOUT, received).await.unwrap().unwrap();
        assert_eq!(received, b"one;two;three;");
    }

    #[tokio::test]
    async fn inbound_close_while_connecting_gives_up_after_linger() {
        let addr = echo_server().await;
        let (server, mut client) = ws_pair().await;
        let session = ProxySession::new(server, target(addr), from_addr())
            .with_config(SessionConfig {
                connect_timeout: None,
                ..quick_config()
            })
            .with_dialer(Arc::new(GatedDialer {
                gate: Arc::new(Notify::new()),
            }));
        let task = tokio::spawn(session.run());

        client.send(Message::Binary(Bytes::from_static(b"lost"))).await.unwrap();
        client.close(None).await.unwrap();

        let summary = tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(summary.close_reason, CloseReason::InboundClosed);
        assert_eq!(summary.bytes_up, 0);
    }

    #[tokio::test]
    async fn external_close_while_connecting_drops_backlog() {
        let addr = echo_server().await;
        let (server, mut client) = ws_pair().await;
        let session = ProxySession::new(server, target(addr), from_addr())
            .with_config(quick_config())
            .with_dialer(Arc::new(GatedDialer {
                gate: Arc::new(Notify::new()),
            }));
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        client.send(Message::Binary(Bytes::from_static(b"queued"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.close());

        let summary = tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(summary.close_reason, CloseReason::Requested);
        assert_eq!(summary.bytes_up, 0);
    }

    #[tokio::test]
    async fn connect_failure_closes_inbound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (server, mut client) = ws_pair().await;
        let session = ProxySession::new(server, target(addr), from_addr()).with_config(quick_config());
        let summary = tokio::time::timeout(TEST_TIMEOUT, session.run()).await.unwrap();
        assert_eq!(summary.close_reason, CloseReason::ConnectFailed);

        let next = tokio::time::timeout(TEST_TIMEOUT, client.next()).await.unwrap();
        assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    }

    #[tokio::test]
    async fn connect_timeout_is_terminal() {
        let addr = echo_server().await;
        let (server, _client) = ws_pair().await;
        let session = ProxySession::new(server, target(addr), from_addr())
            .with_config(SessionConfig {
                connect_timeout: Some(Duration::from_millis(50)),
                ..quick_config()
            })
            .with_dialer(Arc::new(GatedDialer {
                gate: Arc::new(Notify::new()),
            }));
        let summary = tokio::time::timeout(TEST_TIMEOUT, session.run()).await.unwrap();
        assert_eq!(summary.close_reason, CloseReason::ConnectTimedOut);
    }

    #[tokio::test]
    async fn outbound_eof_closes_inbound_after_delivering_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"bye").await.unwrap();
        });

        let (server, mut client) = ws_pair().await;
        let session = ProxySession::new(server, target(addr), from_addr()).with_config(quick_config());
        let task = tokio::spawn(session.run());

        assert_eq!(collect(&mut client, 3).await, b"bye");
        let summary = tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(summary.close_reason, CloseReason::OutboundClosed);

        let next = tokio::time::timeout(TEST_TIMEOUT, client.next()).await.unwrap();
        assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    }

    #[tokio::test]
    async fn external_close_is_idempotent() {
        let addr = echo_server().await;
        let (server, mut client) = ws_pair().await;
        let session = ProxySession::new(server, target(addr), from_addr()).with_config(quick_config());
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        client.send(Message::Binary(Bytes::from_static(b"x"))).await.unwrap();
        collect(&mut client, 1).await;

        assert!(handle.close());
        assert!(!handle.close());
        let summary = tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(summary.close_reason, CloseReason::Requested);
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn inbound_close_during_stalled_write_closes_once() {
        // Target accepts but never reads, so outbound writes stall once the
        // socket buffers fill up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = hold_rx.await;
            drop(stream);
        });

        let (server, mut client) = ws_pair().await;
        let session = ProxySession::new(server, target(addr), from_addr()).with_config(quick_config());
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        let chunk = Bytes::from(vec![0x5a; 4 * 1024 * 1024]);
        for _ in 0..8 {
            client.send(Message::Binary(chunk.clone())).await.unwrap();
        }
        client.close(None).await.unwrap();

        let summary = tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(summary.close_reason, CloseReason::InboundClosed);
        assert!(summary.bytes_up < 32 * 1024 * 1024);
        assert_eq!(handle.state(), SessionState::Closed);
        assert!(!handle.close());
        tokio::time::timeout(TEST_TIMEOUT, handle.closed()).await.unwrap();
        let _ = hold_tx.send(());
    }

    #[tokio::test]
    async fn concurrent_sessions_do_not_cross_talk() {
        let addr = echo_server().await;
        let (server_a, mut client_a) = ws_pair().await;
        let (server_b, mut client_b) = ws_pair().await;
        tokio::spawn(ProxySession::new(server_a, target(addr), from_addr()).run());
        tokio::spawn(ProxySession::new(server_b, target(addr), from_addr()).run());

        for i in 0..10 {
            client_a.send(Message::Binary(format!("a{i}").into_bytes().into())).await.unwrap();
            client_b.send(Message::Binary(format!("b{i}").into_bytes().into())).await.unwrap();
        }

        let a = collect(&mut client_a, 20).await;
        let b = collect(&mut client_b, 20).await;
        assert_eq!(a, b"a0a1a2a3a4a5a6a7a8a9");
        assert_eq!(b, b"b0b1b2b3b4b5b6b7b8b9");
    }

    #[test]
    fn disconnect_errors_are_ignorable() {
        assert!(TransportError::from(WsError::ConnectionClosed).is_ignorable());
        assert!(TransportError::from(WsError::AlreadyClosed).is_ignorable());
        assert!(TransportError::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_ignorable());
        assert!(
            TransportError::from(WsError::Io(io::Error::from(io::ErrorKind::ConnectionReset)))
                .is_ignorable()
        );
        assert!(
            TransportError::from(WsError::Protocol(ProtocolError::SendAfterClosing)).is_ignorable()
        );
    }

    #[test]
    fn other_errors_are_not_ignorable() {
        assert!(!TransportError::from(io::Error::from(io::ErrorKind::PermissionDenied)).is_ignorable());
        assert!(
            !TransportError::from(WsError::Protocol(ProtocolError::HandshakeIncomplete))
                .is_ignorable()
        );
    }

    #[test]
    fn close_transitions_once() {
        let (tx, _) = watch::channel(SessionState::Connecting);
        assert!(activate(&tx));
        assert!(!activate(&tx));
        assert!(mark_closed(&tx));
        assert!(!mark_closed(&tx));
        assert!(!activate(&tx));
        assert_eq!(*tx.borrow(), SessionState::Closed);
    }
}
