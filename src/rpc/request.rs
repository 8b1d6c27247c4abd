use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::envelope::Envelope;
use super::{
    rejection_value, CallContext, CallOptions, RpcError, SharedRequestHandler,
    NO_FUNCTION_REGISTERED,
};
use crate::abort::{AbortController, AbortSignal};
use crate::port::{MessageChannel, MessagePort, PortReceiver, PortSender};
use crate::value::{fallback_clone, RpcValue};

/// Request/response endpoint bound to one method port.
///
/// Calls go out on the shared port; incoming calls on the same port are
/// served by the optional handler (or rejected when there is none).
pub struct RpcEndpoint {
    sender: Option<PortSender>,
    listener: Option<JoinHandle<()>>,
    shutdown: AbortController,
    options: CallOptions,
}

impl RpcEndpoint {
    pub fn new(port: MessagePort, handler: Option<SharedRequestHandler>) -> Self {
        let (sender, receiver) = port.split();
        let shutdown = AbortController::new();
        let listener = tokio::spawn(serve_requests(receiver, handler, shutdown.signal()));
        Self {
            sender,
            listener: Some(listener),
            shutdown,
            options: CallOptions::default(),
        }
    }

    /// Applies a default timeout to every call made through this endpoint.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub async fn call(&self, args: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        self.call_with(args, self.options.clone()).await
    }

    /// Binds `options` for the calls made through the returned view.
    pub fn with_options(&self, options: CallOptions) -> BoundCall<'_> {
        let merged = CallOptions {
            signal: options.signal,
            timeout: options.timeout.or(self.options.timeout),
        };
        BoundCall {
            endpoint: self,
            options: merged,
        }
    }

    async fn call_with(&self, args: Vec<RpcValue>, options: CallOptions) -> Result<RpcValue, RpcError> {
        let sender = self.sender.as_ref().ok_or(RpcError::Disconnected)?;
        call_over(sender, args, options).await
    }

    /// Stop listening and abort the signals of handlers still running.
    pub fn dispose(&mut self) {
        self.sender = None;
        self.shutdown.abort();
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for RpcEndpoint {
    fn drop(&mut self) {
        self.dispose();
    }
}

pub struct BoundCall<'a> {
    endpoint: &'a RpcEndpoint,
    options: CallOptions,
}

impl BoundCall<'_> {
    pub async fn call(&self, args: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        self.endpoint.call_with(args, self.options.clone()).await
    }
}

/// Issue one call over `sender`, correlating the reply through a private
/// channel.
pub(crate) async fn call_over(
    sender: &PortSender,
    args: Vec<RpcValue>,
    options: CallOptions,
) -> Result<RpcValue, RpcError> {
    let (mut local, remote) = MessageChannel::new();
    let (data, transfer) = Envelope::Call {
        args,
        reply: remote,
    }
    .into_message();
    sender.post_message(&data, transfer)?;

    let signal = options.signal.unwrap_or_else(AbortSignal::never);
    if signal.aborted() {
        abort_call(&mut local);
        return Err(RpcError::Aborted);
    }

    let settled = {
        let reply = async {
            match local.recv().await {
                Some(message) => match Envelope::from_message(message) {
                    Ok(Envelope::Resolve(value)) => Ok(value),
                    Ok(Envelope::Reject(reason)) => Err(RpcError::Rejected(reason)),
                    Ok(other) => {
                        warn!(target = "rpc", envelope = ?other, "unexpected envelope on reply port");
                        Err(RpcError::Disconnected)
                    }
                    Err(err) => Err(RpcError::from(err)),
                },
                None => Err(RpcError::Disconnected),
            }
        };
        let deadline = async {
            match options.timeout {
                Some(timeout) => {
                    tokio::time::sleep(timeout).await;
                    timeout
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = reply => Settled::Replied(result),
            _ = signal.cancelled() => Settled::Aborted,
            elapsed = deadline => Settled::TimedOut(elapsed),
        }
    };

    match settled {
        Settled::Replied(result) => {
            local.close();
            result
        }
        Settled::Aborted => {
            abort_call(&mut local);
            Err(RpcError::Aborted)
        }
        Settled::TimedOut(elapsed) => {
            abort_call(&mut local);
            Err(RpcError::Timeout(elapsed))
        }
    }
}

enum Settled {
    Replied(Result<RpcValue, RpcError>),
    Aborted,
    TimedOut(Duration),
}

fn abort_call(local: &mut MessagePort) {
    let (data, _) = Envelope::Abort.into_message();
    if let Err(err) = local.post_message(&data, Vec::new()) {
        debug!(target = "rpc", error = %err, "abort not delivered");
    }
    local.close();
}

async fn serve_requests(
    mut receiver: PortReceiver,
    handler: Option<SharedRequestHandler>,
    shutdown: AbortSignal,
) {
    while let Some(message) = receiver.recv().await {
        match Envelope::from_message(message) {
            Ok(Envelope::Call { args, reply }) => {
                tokio::spawn(serve_call(handler.clone(), args, reply, shutdown.child()));
            }
            Ok(other) => {
                warn!(target = "rpc", envelope = ?other, "ignoring non-call envelope on method port");
            }
            Err(err) => {
                warn!(target = "rpc", error = %err, "malformed envelope on method port");
            }
        }
    }
    debug!(target = "rpc", port = receiver.port_id(), "method port closed");
}

/// Run one handler invocation and answer on `reply`. An `[ABORT]` arriving
/// while the handler runs, or the caller dropping the reply port, aborts the
/// per-call controller.
pub(crate) async fn serve_call(
    handler: Option<SharedRequestHandler>,
    args: Vec<RpcValue>,
    mut reply: MessagePort,
    controller: AbortController,
) {
    let Some(handler) = handler else {
        send_outcome(&mut reply, Err(RpcValue::error(NO_FUNCTION_REGISTERED)));
        return;
    };

    let work = handler.call(CallContext::new(controller.signal()), args);
    tokio::pin!(work);

    let mut reply_open = true;
    let result = loop {
        tokio::select! {
            result = &mut work => break result,
            message = reply.recv(), if reply_open => match message {
                Some(message) => {
                    if matches!(Envelope::from_message(message), Ok(Envelope::Abort)) {
                        controller.abort();
                    }
                }
                None => {
                    debug!(target = "rpc", "caller dropped the reply port");
                    reply_open = false;
                    controller.abort();
                }
            },
        }
    };

    send_outcome(&mut reply, result.map_err(rejection_value));
}

fn send_outcome(reply: &mut MessagePort, outcome: Result<RpcValue, RpcValue>) {
    let envelope = match outcome {
        Ok(value) => Envelope::Resolve(value),
        Err(reason) => Envelope::Reject(reason),
    };
    post_reply(reply, envelope);
    reply.close();
}

/// A reply payload that survives the structured clone: the value itself
/// when it clones, its fallback copy otherwise.
pub(crate) fn cloneable_payload(value: RpcValue) -> RpcValue {
    match value.structured_clone() {
        Ok(_) => value,
        Err(err) => {
            debug!(target = "rpc", error = %err, "reply not cloneable, sending best-effort copy");
            fallback_clone(&value)
        }
    }
}

/// Post a RESOLVE/REJECT. The payload is degraded on its own, before it is
/// wrapped, so a top-level function still arrives as its description.
pub(crate) fn post_reply(reply: &MessagePort, envelope: Envelope) {
    let envelope = match envelope {
        Envelope::Resolve(value) => Envelope::Resolve(cloneable_payload(value)),
        Envelope::Reject(reason) => Envelope::Reject(cloneable_payload(reason)),
        other => other,
    };
    let (data, _) = envelope.into_message();
    if let Err(err) = reply.post_message(&data, Vec::new()) {
        debug!(target = "rpc", error = %err, "reply not delivered");
    }
}
