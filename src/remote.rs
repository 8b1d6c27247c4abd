//! Host-side proxy for the methods the sandbox serves.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{BoxStream, StreamExt};
use tracing::{debug, warn};

use crate::methods::SandboxMethod;
use crate::orchestrator::{HtmlRunEvent, WidgetRunParams};
use crate::port::MessagePort;
use crate::rpc::{CallOptions, MethodEndpoint, RemoteGenerator, RpcError};
use crate::value::RpcValue;

/// Typed calls into a connected sandbox frame.
pub struct SandboxRemoteApi {
    endpoints: Mutex<BTreeMap<SandboxMethod, Arc<MethodEndpoint>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SandboxRemoteApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRemoteApi")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SandboxRemoteApi {
    /// Wrap the ports named in the sandbox's handshake reply. Names this
    /// side does not know are dropped.
    pub fn from_ports(ports: BTreeMap<String, MessagePort>, timeout: Option<Duration>) -> Self {
        let mut endpoints = BTreeMap::new();
        for (name, port) in ports {
            match name.parse::<SandboxMethod>() {
                Ok(method) => {
                    let endpoint = MethodEndpoint::caller(port, method.is_generator(), timeout);
                    endpoints.insert(method, Arc::new(endpoint));
                }
                Err(err) => warn!(target = "handshake", error = %err, "ignoring unknown sandbox method"),
            }
        }
        Self {
            endpoints: Mutex::new(endpoints),
            closed: AtomicBool::new(false),
        }
    }

    pub fn methods(&self) -> Vec<SandboxMethod> {
        self.lock().keys().copied().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SandboxMethod, Arc<MethodEndpoint>>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn endpoint(&self, method: SandboxMethod) -> Result<Arc<MethodEndpoint>, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Disconnected);
        }
        self.lock()
            .get(&method)
            .cloned()
            .ok_or_else(|| RpcError::UnknownMethod(method.to_string()))
    }

    async fn call(&self, method: SandboxMethod, args: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        let endpoint = self.endpoint(method)?;
        debug!(target = "rpc", %method, "calling sandbox");
        endpoint.call(args).await
    }

    /// Start a widget run. Each step yields one serialized [`HtmlRunEvent`].
    pub fn run_widget_code(
        &self,
        params: &WidgetRunParams,
        options: CallOptions,
    ) -> Result<RemoteGenerator, RpcError> {
        let params = RpcValue::from_serialize(params).map_err(|err| RpcError::Decode(err.to_string()))?;
        self.endpoint(SandboxMethod::RunWidgetCode)?
            .stream(vec![params], options)
    }

    /// [`run_widget_code`](Self::run_widget_code), decoded.
    pub fn run_widget_events(
        &self,
        params: &WidgetRunParams,
        options: CallOptions,
    ) -> Result<BoxStream<'static, Result<HtmlRunEvent, RpcError>>, RpcError> {
        let generator = self.run_widget_code(params, options)?;
        Ok(generator
            .into_stream()
            .map(|step| {
                step.and_then(|value| {
                    value
                        .deserialize::<HtmlRunEvent>()
                        .map_err(|err| RpcError::Decode(err.to_string()))
                })
            })
            .boxed())
    }

    pub async fn set_widget_props(&self, props: RpcValue) -> Result<(), RpcError> {
        self.call(SandboxMethod::SetWidgetProps, vec![props]).await?;
        Ok(())
    }

    pub async fn set_theme(&self, theme: &str) -> Result<(), RpcError> {
        self.call(SandboxMethod::SetTheme, vec![RpcValue::from(theme)])
            .await?;
        Ok(())
    }

    pub async fn set_safe_area(&self, safe_area: RpcValue) -> Result<(), RpcError> {
        self.call(SandboxMethod::SetSafeArea, vec![safe_area]).await?;
        Ok(())
    }

    pub async fn navigate(&self, path: &str) -> Result<(), RpcError> {
        self.call(SandboxMethod::Navigate, vec![RpcValue::from(path)])
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), RpcError> {
        self.call(SandboxMethod::Stop, Vec::new()).await?;
        Ok(())
    }

    pub async fn get_current_path(&self) -> Result<Option<String>, RpcError> {
        let path = self.call(SandboxMethod::GetCurrentPath, Vec::new()).await?;
        Ok(path.as_str().map(str::to_string))
    }

    /// Drop every endpoint. Calls in flight fail with `Disconnected`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lock().clear();
    }
}

impl Drop for SandboxRemoteApi {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MessageChannel;
    use crate::rpc::{request_handler, MethodHandler};

    #[tokio::test]
    async fn unknown_and_missing_methods() {
        let (local, _remote) = MessageChannel::new();
        let ports = BTreeMap::from([("notAMethod".to_string(), local)]);
        let api = SandboxRemoteApi::from_ports(ports, None);
        assert!(api.methods().is_empty());

        let err = api.stop().await.unwrap_err();
        assert!(matches!(err, RpcError::UnknownMethod(name) if name == "stop"));
    }

    #[tokio::test]
    async fn calls_reach_the_serving_side() {
        let (local, remote) = MessageChannel::new();
        let _served = MethodEndpoint::serving(
            remote,
            MethodHandler::Request(request_handler(|_ctx, _args| async {
                Ok(RpcValue::from("/settings#tab"))
            })),
        );
        let ports = BTreeMap::from([("getCurrentPath".to_string(), local)]);
        let api = SandboxRemoteApi::from_ports(ports, Some(Duration::from_secs(1)));

        assert_eq!(api.get_current_path().await.unwrap().as_deref(), Some("/settings#tab"));

        api.close();
        assert!(matches!(api.get_current_path().await, Err(RpcError::Disconnected)));
    }
}
