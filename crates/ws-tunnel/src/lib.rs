//! WebSocket-to-TCP tunnelling proxy.
//!
//! A client opens a WebSocket whose request path is a base64-encoded
//! `host:port`. The proxy decodes it, runs a chain of verify hooks to decide
//! whether the connection may proceed, runs the connect hooks, and then
//! relays raw bytes between the WebSocket and a freshly dialled TCP socket
//! until either side closes.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS-->  wsproxy  <--TCP-->  host:port
//!                     |
//!            [Verify hooks]  (AllowList, ...)
//!            [Connect hooks]
//!                     |
//!               [Audit Sink]
//! ```
//!
//! Messages the client sends before the TCP connection is up are queued
//! and written in order once it is. Each session is independent; nothing
//! is shared between sessions except the read-only hook pipeline.

pub mod allow;
pub mod listener;
pub mod pipeline;
pub mod session;
pub mod target;

pub use allow::AllowList;
pub use listener::{BoundProxy, Proxy, ProxyConfig};
pub use pipeline::{
    connect_fn, verify_fn, ConnectHook, ConnectionContext, ConnectionInfo, MiddlewarePipeline,
    PipelineBuilder, VerifyHook,
};
pub use session::{
    CloseReason, Dialer, DirectDialer, ProxySession, SessionConfig, SessionHandle, SessionState,
    SessionSummary, TransportError,
};
pub use target::{DecodeError, Target};
