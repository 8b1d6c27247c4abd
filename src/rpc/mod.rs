//! Request/response and generator calls multiplexed over message ports.
//!
//! Every call gets a private reply channel, so replies can never be confused
//! across calls. Generator calls get a quartet of ports (`next`, `return`,
//! `throw`, `asyncDispose`), each of which behaves as a request port.

mod envelope;
mod generator;
mod request;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::abort::AbortSignal;
use crate::port::{MessagePort, PortError};
use crate::value::RpcValue;

pub use envelope::{Envelope, EnvelopeError, GeneratorPorts};
pub use generator::{GeneratorEndpoint, RemoteGenerator};
pub use request::RpcEndpoint;

pub(crate) const NO_FUNCTION_REGISTERED: &str = "No function registered";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("remote rejected: {}", .0.display_string())]
    Rejected(RpcValue),
    #[error("Aborted.")]
    Aborted,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote endpoint disconnected before replying")]
    Disconnected,
    #[error("generator has been disposed")]
    Disposed,
    #[error("no endpoint for method {0}")]
    UnknownMethod(String),
    #[error("method streams its results; call it as a generator")]
    StreamingMethod,
    #[error("method does not stream")]
    NotStreaming,
    #[error("unexpected payload: {0}")]
    Decode(String),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl RpcError {
    pub fn rejection(&self) -> Option<&RpcValue> {
        match self {
            Self::Rejected(value) => Some(value),
            _ => None,
        }
    }
}

/// Rejects a call with an exact value instead of a generic `Error`.
#[derive(Debug, Error)]
#[error("rejected with {}", .0.display_string())]
pub struct Rejection(pub RpcValue);

pub(crate) fn rejection_value(err: anyhow::Error) -> RpcValue {
    match err.downcast::<Rejection>() {
        Ok(Rejection(value)) => value,
        Err(err) => RpcValue::Error {
            name: "Error".to_string(),
            message: format!("{err:#}"),
            stack: None,
        },
    }
}

/// Per-call knobs, bound with `with_options`.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub signal: Option<AbortSignal>,
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn signal(signal: AbortSignal) -> Self {
        Self {
            signal: Some(signal),
            timeout: None,
        }
    }
}

/// What a handler sees about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    signal: AbortSignal,
}

impl CallContext {
    pub(crate) fn new(signal: AbortSignal) -> Self {
        Self { signal }
    }

    /// Fires when the caller sent `[ABORT]`. Handlers must poll it to stop work.
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }
}

pub type HandlerResult = anyhow::Result<RpcValue>;
pub type GeneratorStream = BoxStream<'static, anyhow::Result<RpcValue>>;

pub trait RequestHandler: Send + Sync + 'static {
    fn call(&self, ctx: CallContext, args: Vec<RpcValue>) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(CallContext, Vec<RpcValue>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: CallContext, args: Vec<RpcValue>) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(ctx, args))
    }
}

pub trait GeneratorHandler: Send + Sync + 'static {
    fn generate(&self, ctx: CallContext, args: Vec<RpcValue>) -> GeneratorStream;
}

impl<F> GeneratorHandler for F
where
    F: Fn(CallContext, Vec<RpcValue>) -> GeneratorStream + Send + Sync + 'static,
{
    fn generate(&self, ctx: CallContext, args: Vec<RpcValue>) -> GeneratorStream {
        self(ctx, args)
    }
}

pub type SharedRequestHandler = Arc<dyn RequestHandler>;
pub type SharedGeneratorHandler = Arc<dyn GeneratorHandler>;

/// A served method, request or generator style.
#[derive(Clone)]
pub enum MethodHandler {
    Request(SharedRequestHandler),
    Generator(SharedGeneratorHandler),
}

impl MethodHandler {
    pub fn is_generator(&self) -> bool {
        matches!(self, Self::Generator(_))
    }
}

/// One method's port, wrapped according to the method's kind.
pub enum MethodEndpoint {
    Request(RpcEndpoint),
    Generator(GeneratorEndpoint),
}

impl MethodEndpoint {
    /// Call-only endpoint for a method exposed by the other side.
    pub fn caller(port: MessagePort, is_generator: bool, timeout: Option<Duration>) -> Self {
        if is_generator {
            Self::Generator(GeneratorEndpoint::new(port, None))
        } else {
            Self::Request(RpcEndpoint::new(port, None).with_default_timeout(timeout))
        }
    }

    /// Endpoint serving `handler` to the other side.
    pub fn serving(port: MessagePort, handler: MethodHandler) -> Self {
        match handler {
            MethodHandler::Request(handler) => Self::Request(RpcEndpoint::new(port, Some(handler))),
            MethodHandler::Generator(handler) => {
                Self::Generator(GeneratorEndpoint::new(port, Some(handler)))
            }
        }
    }

    pub async fn call(&self, args: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        match self {
            Self::Request(endpoint) => endpoint.call(args).await,
            Self::Generator(_) => Err(RpcError::StreamingMethod),
        }
    }

    pub fn stream(&self, args: Vec<RpcValue>, options: CallOptions) -> Result<RemoteGenerator, RpcError> {
        match self {
            Self::Generator(endpoint) => endpoint.call_with(args, options),
            Self::Request(_) => Err(RpcError::NotStreaming),
        }
    }
}

/// Wrap a closure as a shareable request handler.
pub fn request_handler<F, Fut>(handler: F) -> SharedRequestHandler
where
    F: Fn(CallContext, Vec<RpcValue>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(handler)
}

/// Wrap a closure as a shareable generator handler.
pub fn generator_handler<F>(handler: F) -> SharedGeneratorHandler
where
    F: Fn(CallContext, Vec<RpcValue>) -> GeneratorStream + Send + Sync + 'static,
{
    Arc::new(handler)
}
