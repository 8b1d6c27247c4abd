use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::envelope::{Envelope, GeneratorPorts};
use super::request::{call_over, cloneable_payload, post_reply, serve_call};
use super::{
    rejection_value, CallContext, CallOptions, GeneratorStream, RpcError, SharedGeneratorHandler,
    NO_FUNCTION_REGISTERED,
};
use crate::abort::{AbortController, AbortSignal};
use crate::port::{MessageChannel, MessagePort, PortReceiver, PortSender};
use crate::value::RpcValue;

/// Endpoint for generator-style methods: one call yields a stream of values
/// pulled step by step over a dedicated port quartet.
pub struct GeneratorEndpoint {
    sender: Option<PortSender>,
    listener: Option<JoinHandle<()>>,
    shutdown: AbortController,
}

impl GeneratorEndpoint {
    pub fn new(port: MessagePort, handler: Option<SharedGeneratorHandler>) -> Self {
        let (sender, receiver) = port.split();
        let shutdown = AbortController::new();
        let listener = tokio::spawn(serve_generators(receiver, handler, shutdown.signal()));
        Self {
            sender,
            listener: Some(listener),
            shutdown,
        }
    }

    /// Start a remote generator. Nothing runs remotely until the first step.
    pub fn call(&self, args: Vec<RpcValue>) -> Result<RemoteGenerator, RpcError> {
        self.call_with(args, CallOptions::default())
    }

    /// Start a remote generator whose production is disposed when
    /// `options.signal` fires.
    pub fn call_with(
        &self,
        args: Vec<RpcValue>,
        options: CallOptions,
    ) -> Result<RemoteGenerator, RpcError> {
        let sender = self.sender.as_ref().ok_or(RpcError::Disconnected)?;

        let (next, remote_next) = MessageChannel::new();
        let (return_, remote_return) = MessageChannel::new();
        let (throw, remote_throw) = MessageChannel::new();
        let (async_dispose, remote_dispose) = MessageChannel::new();

        let (data, transfer) = Envelope::GeneratorGenerate {
            ports: GeneratorPorts {
                next: remote_next,
                return_: remote_return,
                throw: remote_throw,
                async_dispose: remote_dispose,
            },
            args,
        }
        .into_message();
        sender.post_message(&data, transfer)?;

        let watcher = match (options.signal.clone(), async_dispose.sender()) {
            (Some(signal), Some(dispose_sender)) => Some(tokio::spawn(async move {
                signal.cancelled().await;
                fire_dispose(&dispose_sender);
            })),
            _ => None,
        };

        Ok(RemoteGenerator {
            ports: Some(GeneratorPorts {
                next,
                return_,
                throw,
                async_dispose,
            }),
            state: GeneratorState::Active,
            signal: options.signal,
            watcher,
        })
    }

    pub fn dispose(&mut self) {
        self.sender = None;
        self.shutdown.abort();
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for GeneratorEndpoint {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeneratorState {
    Active,
    Done,
    Disposed,
}

#[derive(Debug, Clone, Copy)]
enum Capability {
    Next,
    Return,
    Throw,
}

/// Caller side of a generator invocation.
pub struct RemoteGenerator {
    ports: Option<GeneratorPorts>,
    state: GeneratorState,
    signal: Option<AbortSignal>,
    watcher: Option<JoinHandle<()>>,
}

impl RemoteGenerator {
    pub async fn next(&mut self) -> Result<Option<RpcValue>, RpcError> {
        self.step(Capability::Next, RpcValue::Undefined).await
    }

    /// Resume with a value, like `generator.next(value)`.
    pub async fn next_with(&mut self, value: RpcValue) -> Result<Option<RpcValue>, RpcError> {
        self.step(Capability::Next, value).await
    }

    /// Finish the generator early, returning `value`.
    pub async fn return_value(&mut self, value: RpcValue) -> Result<Option<RpcValue>, RpcError> {
        self.step(Capability::Return, value).await
    }

    pub async fn throw(&mut self, error: RpcValue) -> Result<Option<RpcValue>, RpcError> {
        self.step(Capability::Throw, error).await
    }

    pub fn is_finished(&self) -> bool {
        self.state != GeneratorState::Active
    }

    async fn step(
        &mut self,
        capability: Capability,
        value: RpcValue,
    ) -> Result<Option<RpcValue>, RpcError> {
        match self.state {
            GeneratorState::Disposed => return Err(RpcError::Disposed),
            GeneratorState::Done => return Ok(None),
            GeneratorState::Active => {}
        }
        if self.signal.as_ref().is_some_and(AbortSignal::aborted) {
            self.finish(GeneratorState::Disposed);
            return Err(RpcError::Aborted);
        }
        let sender = {
            let ports = self.ports.as_ref().ok_or(RpcError::Disposed)?;
            let port = match capability {
                Capability::Next => &ports.next,
                Capability::Return => &ports.return_,
                Capability::Throw => &ports.throw,
            };
            port.sender().ok_or(RpcError::Disconnected)?
        };

        let outcome = call_over(&sender, vec![value], CallOptions::default()).await;
        match outcome {
            Ok(result) => {
                let done = result.get("done").and_then(RpcValue::as_bool).unwrap_or(true);
                let value = result.get("value").cloned().unwrap_or_default();
                if done {
                    self.finish(GeneratorState::Done);
                    match capability {
                        Capability::Return => Ok(Some(value)),
                        _ => Ok(None),
                    }
                } else {
                    Ok(Some(value))
                }
            }
            Err(err) => {
                self.finish(GeneratorState::Done);
                Err(err)
            }
        }
    }

    /// Stop remote production and release the port quartet.
    pub async fn dispose(&mut self) -> Result<(), RpcError> {
        if self.state != GeneratorState::Active {
            self.state = GeneratorState::Disposed;
            return Ok(());
        }
        let sender = self
            .ports
            .as_ref()
            .and_then(|ports| ports.async_dispose.sender());
        self.finish(GeneratorState::Disposed);
        match sender {
            Some(sender) => match call_over(&sender, Vec::new(), CallOptions::default()).await {
                Ok(_) | Err(RpcError::Disconnected) => Ok(()),
                Err(err) => Err(err),
            },
            None => Ok(()),
        }
    }

    fn finish(&mut self, state: GeneratorState) {
        self.state = state;
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Some(mut ports) = self.ports.take() {
            ports.next.close();
            ports.return_.close();
            ports.throw.close();
            ports.async_dispose.close();
        }
    }

    /// Adapt to a `Stream`. The stream ends after the remote reports `done`
    /// or after the first error.
    pub fn into_stream(self) -> BoxStream<'static, Result<RpcValue, RpcError>> {
        stream::unfold(Some(self), |generator| async move {
            let mut generator = generator?;
            match generator.next().await {
                Ok(Some(value)) => Some((Ok(value), Some(generator))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }
}

impl Drop for RemoteGenerator {
    fn drop(&mut self) {
        if self.state == GeneratorState::Active {
            if let Some(sender) = self
                .ports
                .as_ref()
                .and_then(|ports| ports.async_dispose.sender())
            {
                fire_dispose(&sender);
            }
            self.finish(GeneratorState::Disposed);
        }
    }
}

fn fire_dispose(sender: &PortSender) {
    let (_local, remote) = MessageChannel::new();
    let (data, transfer) = Envelope::Call {
        args: Vec::new(),
        reply: remote,
    }
    .into_message();
    if let Err(err) = sender.post_message(&data, transfer) {
        debug!(target = "rpc", error = %err, "dispose not delivered");
    }
}

async fn serve_generators(
    mut receiver: PortReceiver,
    handler: Option<SharedGeneratorHandler>,
    shutdown: AbortSignal,
) {
    while let Some(message) = receiver.recv().await {
        match Envelope::from_message(message) {
            Ok(Envelope::GeneratorGenerate { ports, args }) => {
                tokio::spawn(serve_generator(handler.clone(), ports, args, shutdown.child()));
            }
            Ok(Envelope::Call { args, reply }) => {
                tokio::spawn(serve_call(None, args, reply, shutdown.child()));
            }
            Ok(other) => {
                warn!(target = "rpc", envelope = ?other, "ignoring envelope on generator port");
            }
            Err(err) => {
                warn!(target = "rpc", error = %err, "malformed envelope on generator port");
            }
        }
    }
}

enum Pulled {
    Item(Option<anyhow::Result<RpcValue>>),
    Disposed(Option<MessagePort>),
}

fn step_value(value: RpcValue, done: bool) -> RpcValue {
    RpcValue::object([
        ("value", cloneable_payload(value)),
        ("done", RpcValue::Bool(done)),
    ])
}

fn answer(mut reply: MessagePort, envelope: Envelope) {
    post_reply(&reply, envelope);
    reply.close();
}

/// Serve one generator invocation until it finishes or is disposed.
async fn serve_generator(
    handler: Option<SharedGeneratorHandler>,
    ports: GeneratorPorts,
    args: Vec<RpcValue>,
    controller: AbortController,
) {
    let GeneratorPorts {
        mut next,
        mut return_,
        mut throw,
        mut async_dispose,
    } = ports;

    let mut production: Option<GeneratorStream> = handler
        .as_ref()
        .map(|handler| handler.generate(CallContext::new(controller.signal()), args));

    loop {
        let (capability, message) = tokio::select! {
            message = next.recv() => (Some(Capability::Next), message),
            message = return_.recv() => (Some(Capability::Return), message),
            message = throw.recv() => (Some(Capability::Throw), message),
            message = async_dispose.recv() => (None, message),
        };
        let Some(message) = message else {
            // the caller went away without disposing
            controller.abort();
            break;
        };
        let (call_args, reply) = match Envelope::from_message(message) {
            Ok(Envelope::Call { args, reply }) => (args, reply),
            Ok(other) => {
                warn!(target = "rpc", envelope = ?other, "ignoring envelope on generator capability");
                continue;
            }
            Err(err) => {
                warn!(target = "rpc", error = %err, "malformed generator step");
                continue;
            }
        };

        let Some(stream) = production.as_mut() else {
            answer(reply, Envelope::Reject(RpcValue::error(NO_FUNCTION_REGISTERED)));
            break;
        };
        let argument = call_args.into_iter().next().unwrap_or_default();

        match capability {
            Some(Capability::Next) => {
                let mut reply = reply;
                let pulled = pull(stream, &mut async_dispose, &mut reply, &controller).await;
                match pulled {
                    Pulled::Item(Some(Ok(value))) => {
                        answer(reply, Envelope::Resolve(step_value(value, false)));
                        continue;
                    }
                    Pulled::Item(Some(Err(err))) => {
                        answer(reply, Envelope::Reject(rejection_value(err)));
                    }
                    Pulled::Item(None) => {
                        answer(reply, Envelope::Resolve(step_value(RpcValue::Undefined, true)));
                    }
                    Pulled::Disposed(dispose_reply) => {
                        controller.abort();
                        answer(reply, Envelope::Resolve(step_value(RpcValue::Undefined, true)));
                        if let Some(dispose_reply) = dispose_reply {
                            answer(dispose_reply, Envelope::Resolve(RpcValue::Undefined));
                        }
                    }
                }
            }
            Some(Capability::Return) => {
                controller.abort();
                answer(reply, Envelope::Resolve(step_value(argument, true)));
            }
            Some(Capability::Throw) => {
                controller.abort();
                answer(reply, Envelope::Reject(argument));
            }
            None => {
                controller.abort();
                answer(reply, Envelope::Resolve(RpcValue::Undefined));
            }
        }
        break;
    }

    production.take();
    next.close();
    return_.close();
    throw.close();
    async_dispose.close();
    debug!(target = "rpc", "generator session closed");
}

/// Pull the next item while watching for dispose and for `[ABORT]` on the
/// pending step's reply port.
async fn pull(
    stream: &mut GeneratorStream,
    async_dispose: &mut MessagePort,
    reply: &mut MessagePort,
    controller: &AbortController,
) -> Pulled {
    let mut reply_open = true;
    loop {
        tokio::select! {
            item = stream.next() => return Pulled::Item(item),
            message = async_dispose.recv() => {
                let dispose_reply = message.and_then(|message| match Envelope::from_message(message) {
                    Ok(Envelope::Call { reply, .. }) => Some(reply),
                    _ => None,
                });
                return Pulled::Disposed(dispose_reply);
            }
            message = reply.recv(), if reply_open => match message {
                Some(message) => {
                    if matches!(Envelope::from_message(message), Ok(Envelope::Abort)) {
                        controller.abort();
                    }
                }
                None => {
                    reply_open = false;
                    controller.abort();
                }
            },
        }
    }
}
