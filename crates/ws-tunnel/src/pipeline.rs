//! Ordered verify/connect hook chains.
//!
//! A [`MiddlewarePipeline`] is assembled once at startup through
//! [`PipelineBuilder`] and shared read-only by every connection afterwards.
//! Verify hooks decide admission and run as a short-circuiting AND; connect
//! hooks only observe an admitted connection and can never veto it.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::target::Target;

/// What a verify hook gets to see about a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_address: SocketAddr,
    /// The request path with its leading `/` removed, still base64-encoded.
    pub requested_target_raw: String,
}

/// Read-only view of an admitted connection, handed to connect hooks.
///
/// The session owns both transports, so hooks see the connection through
/// this context instead of the socket itself.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub session_id: uuid::Uuid,
    pub remote_address: SocketAddr,
    pub target: Target,
}

/// Admission check run before a session is created.
#[async_trait]
pub trait VerifyHook: Send + Sync {
    fn name(&self) -> &str;

    /// Return `false` to reject the connection.
    async fn verify(&self, info: &ConnectionInfo) -> bool;
}

/// Side-effect hook run after admission, before the session starts.
#[async_trait]
pub trait ConnectHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_connect(&self, ctx: &ConnectionContext);
}

/// Immutable, ordered hook chains.
#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    verify: Vec<Arc<dyn VerifyHook>>,
    connect: Vec<Arc<dyn ConnectHook>>,
}

impl MiddlewarePipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Run the verify chain in registration order.
    ///
    /// Stops at the first hook that returns `false`; hooks after it are not
    /// invoked. An empty chain accepts.
    pub async fn run_verify(&self, info: &ConnectionInfo) -> bool {
        for hook in &self.verify {
            if !hook.verify(info).await {
                tracing::debug!(
                    hook = hook.name(),
                    remote_addr = %info.remote_address,
                    target = %info.requested_target_raw,
                    "verify hook rejected connection"
                );
                return false;
            }
        }
        true
    }

    /// Run every connect hook in registration order, awaiting each one.
    pub async fn run_connect(&self, ctx: &ConnectionContext) {
        for hook in &self.connect {
            hook.on_connect(ctx).await;
        }
    }

    pub fn verify_hooks(&self) -> impl Iterator<Item = &str> {
        self.verify.iter().map(|h| h.name())
    }

    pub fn connect_hooks(&self) -> impl Iterator<Item = &str> {
        self.connect.iter().map(|h| h.name())
    }
}

impl std::fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("verify", &self.verify_hooks().collect::<Vec<_>>())
            .field("connect", &self.connect_hooks().collect::<Vec<_>>())
            .finish()
    }
}

/// Collects hooks before the pipeline is frozen.
#[derive(Default)]
pub struct PipelineBuilder {
    verify: Vec<Arc<dyn VerifyHook>>,
    connect: Vec<Arc<dyn ConnectHook>>,
}

impl PipelineBuilder {
    pub fn verify(mut self, hook: impl VerifyHook + 'static) -> Self {
        self.verify.push(Arc::new(hook));
        self
    }

    pub fn connect(mut self, hook: impl ConnectHook + 'static) -> Self {
        self.connect.push(Arc::new(hook));
        self
    }

    pub fn build(self) -> MiddlewarePipeline {
        MiddlewarePipeline {
            verify: self.verify,
            connect: self.connect,
        }
    }
}

/// Verify hook backed by an async closure.
pub struct FnVerify<F> {
    name: String,
    f: F,
}

/// Wrap an async closure as a [`VerifyHook`].
pub fn verify_fn<F, Fut>(name: impl Into<String>, f: F) -> FnVerify<F>
where
    F: Fn(ConnectionInfo) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    FnVerify {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> VerifyHook for FnVerify<F>
where
    F: Fn(ConnectionInfo) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self, info: &ConnectionInfo) -> bool {
        (self.f)(info.clone()).await
    }
}

/// Connect hook backed by an async closure.
pub struct FnConnect<F> {
    name: String,
    f: F,
}

/// Wrap an async closure as a [`ConnectHook`].
pub fn connect_fn<F, Fut>(name: impl Into<String>, f: F) -> FnConnect<F>
where
    F: Fn(ConnectionContext) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    FnConnect {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> ConnectHook for FnConnect<F>
where
    F: Fn(ConnectionContext) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_connect(&self, ctx: &ConnectionContext) {
        (self.f)(ctx.clone()).await
    }
}
