use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::methods::HostMethod;
use crate::port::{MessageChannel, MessagePort};
use crate::rpc::{
    CallContext, GeneratorStream, HandlerResult, MethodEndpoint, MethodHandler,
    SharedGeneratorHandler, SharedRequestHandler,
};
use crate::value::RpcValue;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} streams its results and needs a generator handler")]
    ExpectsGenerator(HostMethod),
    #[error("{0} does not stream and needs a request handler")]
    ExpectsRequest(HostMethod),
}

/// Host-supplied handlers for the capabilities offered to one sandbox frame.
/// Unregistered methods are simply not offered.
#[derive(Clone, Default)]
pub struct HostCallbackRegistry {
    callbacks: BTreeMap<HostMethod, MethodHandler>,
}

/// The host's half of the handshake descriptor: the ports handed to the
/// sandbox, and the endpoints serving them.
pub struct ServedCallbacks {
    pub ports: Vec<(String, MessagePort)>,
    pub endpoints: Vec<MethodEndpoint>,
}

impl HostCallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        method: HostMethod,
        handler: SharedRequestHandler,
    ) -> Result<&mut Self, RegistryError> {
        if method.is_generator() {
            return Err(RegistryError::ExpectsGenerator(method));
        }
        self.callbacks.insert(method, MethodHandler::Request(handler));
        Ok(self)
    }

    pub fn register_stream(
        &mut self,
        method: HostMethod,
        handler: SharedGeneratorHandler,
    ) -> Result<&mut Self, RegistryError> {
        if !method.is_generator() {
            return Err(RegistryError::ExpectsRequest(method));
        }
        self.callbacks.insert(method, MethodHandler::Generator(handler));
        Ok(self)
    }

    /// Register a closure for a request-style method.
    pub fn on<F, Fut>(&mut self, method: HostMethod, handler: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(CallContext, Vec<RpcValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(method, Arc::new(handler))
    }

    /// Register a closure for a streaming method.
    pub fn on_stream<F>(&mut self, method: HostMethod, handler: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(CallContext, Vec<RpcValue>) -> GeneratorStream + Send + Sync + 'static,
    {
        self.register_stream(method, Arc::new(handler))
    }

    pub fn contains(&self, method: HostMethod) -> bool {
        self.callbacks.contains_key(&method)
    }

    pub fn methods(&self) -> impl Iterator<Item = HostMethod> + '_ {
        self.callbacks.keys().copied()
    }

    /// Open one channel per registered method and start serving it.
    pub fn serve(&self) -> ServedCallbacks {
        let mut ports = Vec::with_capacity(self.callbacks.len());
        let mut endpoints = Vec::with_capacity(self.callbacks.len());
        for (method, handler) in &self.callbacks {
            let (local, remote) = MessageChannel::new();
            endpoints.push(MethodEndpoint::serving(local, handler.clone()));
            ports.push((method.name().to_string(), remote));
        }
        ServedCallbacks { ports, endpoints }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::{self, StreamExt};

    #[test]
    fn rejects_handlers_of_the_wrong_kind() {
        let mut registry = HostCallbackRegistry::new();
        let err = registry
            .on(HostMethod::StreamCompletion, |_ctx, _args| async { Ok(RpcValue::Null) })
            .err();
        assert_eq!(err, Some(RegistryError::ExpectsGenerator(HostMethod::StreamCompletion)));

        let err = registry
            .on_stream(HostMethod::CallCompletion, |_ctx, _args| stream::empty().boxed())
            .err();
        assert_eq!(err, Some(RegistryError::ExpectsRequest(HostMethod::CallCompletion)));
    }

    #[tokio::test]
    async fn serves_only_registered_methods() {
        let mut registry = HostCallbackRegistry::new();
        registry
            .on(HostMethod::LogTelemetry, |_ctx, _args| async { Ok(RpcValue::Null) })
            .unwrap()
            .on(HostMethod::NotifyEscapeKey, |_ctx, _args| async { Ok(RpcValue::Null) })
            .unwrap();
        let served = registry.serve();
        let names: Vec<_> = served.ports.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["logTelemetry", "notifyEscapeKey"]);
        assert_eq!(served.endpoints.len(), 2);
    }
}
