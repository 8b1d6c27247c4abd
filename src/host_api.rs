//! The host capabilities sandboxed code may call, with the privileged ones
//! gated behind a live user gesture.

use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use tracing::warn;

use crate::methods::HostMethod;
use crate::navigation::NavigationNotification;
use crate::rpc::{RemoteGenerator, RpcError};
use crate::value::RpcValue;
use crate::window::UserActivation;

/// Raw transport to the host, one entry per handshake method.
pub trait HostApi: Send + Sync {
    fn has_method(&self, method: HostMethod) -> bool;

    fn call(&self, method: HostMethod, args: Vec<RpcValue>) -> BoxFuture<'_, Result<RpcValue, RpcError>>;

    fn stream(&self, method: HostMethod, args: Vec<RpcValue>) -> Result<RemoteGenerator, RpcError>;
}

/// Admission rule for one method.
#[derive(Debug, Clone, Copy)]
pub struct Gate {
    method: HostMethod,
    is_gated: bool,
}

pub fn gate(method: HostMethod, is_gated: bool) -> Gate {
    Gate { method, is_gated }
}

impl Gate {
    /// Whether a call may go out right now. Environments without a
    /// user-activation API count as active.
    pub fn admit(&self, activation: &dyn UserActivation) -> bool {
        if !self.is_gated {
            return true;
        }
        match activation.is_active() {
            Some(false) => {
                warn!(
                    target = "host_api",
                    method = %self.method,
                    "ignoring call made without an active user gesture"
                );
                false
            }
            Some(true) | None => true,
        }
    }
}

/// Environments with no `navigator.userActivation`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUserActivationApi;

impl UserActivation for NoUserActivationApi {
    fn is_active(&self) -> Option<bool> {
        None
    }
}

/// Typed, gated view over a [`HostApi`]. Denied and missing methods resolve
/// to `Ok(None)` instead of failing.
pub struct HostApiGateway {
    api: Arc<dyn HostApi>,
    activation: Arc<dyn UserActivation>,
}

impl HostApiGateway {
    pub fn new(api: Arc<dyn HostApi>, activation: Arc<dyn UserActivation>) -> Self {
        Self { api, activation }
    }

    fn admitted(&self, method: HostMethod) -> bool {
        if !gate(method, method.requires_user_gesture()).admit(self.activation.as_ref()) {
            return false;
        }
        if !self.api.has_method(method) {
            warn!(target = "host_api", %method, "host does not provide this method");
            return false;
        }
        true
    }

    pub async fn invoke(
        &self,
        method: HostMethod,
        args: Vec<RpcValue>,
    ) -> Result<Option<RpcValue>, RpcError> {
        if !self.admitted(method) {
            return Ok(None);
        }
        self.api.call(method, args).await.map(Some)
    }

    pub fn invoke_stream(
        &self,
        method: HostMethod,
        args: Vec<RpcValue>,
    ) -> Result<Option<RemoteGenerator>, RpcError> {
        if !self.admitted(method) {
            return Ok(None);
        }
        self.api.stream(method, args).map(Some)
    }

    pub async fn log_telemetry(&self, event: RpcValue) -> Result<Option<RpcValue>, RpcError> {
        self.invoke(HostMethod::LogTelemetry, vec![event]).await
    }

    pub async fn notify_error(&self, error: RpcValue) -> Result<Option<RpcValue>, RpcError> {
        self.invoke(HostMethod::NotifyError, vec![error]).await
    }

    pub async fn notify_security_policy_violation(
        &self,
        report: RpcValue,
    ) -> Result<Option<RpcValue>, RpcError> {
        self.invoke(HostMethod::NotifySecurityPolicyViolation, vec![report])
            .await
    }

    pub async fn notify_intrinsic_height(&self, height: f64) -> Result<Option<RpcValue>, RpcError> {
        self.invoke(HostMethod::NotifyIntrinsicHeight, vec![RpcValue::Number(height)])
            .await
    }

    pub async fn notify_background_color(&self, color: &str) -> Result<Option<RpcValue>, RpcError> {
        self.invoke(HostMethod::NotifyBackgroundColor, vec![RpcValue::from(color)])
            .await
    }

    pub async fn notify_escape_key(&self) -> Result<Option<RpcValue>, RpcError> {
        self.invoke(HostMethod::NotifyEscapeKey, Vec::new()).await
    }

    pub async fn notify_navigation(
        &self,
        notification: &NavigationNotification,
    ) -> Result<Option<RpcValue>, RpcError> {
        let payload = RpcValue::from_serialize(notification).unwrap_or_default();
        self.invoke(HostMethod::NotifyNavigation, vec![payload]).await
    }

    pub async fn open_external(&self, href: &str) -> Result<Option<RpcValue>, RpcError> {
        let payload = RpcValue::object([("href", RpcValue::from(href))]);
        self.invoke(HostMethod::OpenExternal, vec![payload]).await
    }

    /// Resolve a custom-protocol asset URI to a fetchable URL.
    pub async fn resolve_download_url(&self, uri: &str) -> Result<Option<String>, RpcError> {
        let resolved = self
            .invoke(HostMethod::ResolveDownloadUrl, vec![RpcValue::from(uri)])
            .await?;
        Ok(resolved.and_then(|value| match value {
            RpcValue::String(url) => Some(url),
            other => other.get("url").and_then(RpcValue::as_str).map(str::to_string),
        }))
    }

    pub async fn set_widget_state(&self, state: RpcValue) -> Result<Option<RpcValue>, RpcError> {
        self.invoke(HostMethod::SetWidgetState, vec![state]).await
    }

    pub async fn request_display_mode(&self, mode: &str) -> Result<Option<RpcValue>, RpcError> {
        let payload = RpcValue::object([("mode", RpcValue::from(mode))]);
        self.invoke(HostMethod::RequestDisplayMode, vec![payload]).await
    }

    pub async fn call_completion(&self, request: RpcValue) -> Result<Option<RpcValue>, RpcError> {
        self.invoke(HostMethod::CallCompletion, vec![request]).await
    }

    pub fn stream_completion(&self, request: RpcValue) -> Result<Option<RemoteGenerator>, RpcError> {
        self.invoke_stream(HostMethod::StreamCompletion, vec![request])
    }

    pub async fn send_follow_up_message(&self, prompt: &str) -> Result<Option<RpcValue>, RpcError> {
        let payload = RpcValue::object([("prompt", RpcValue::from(prompt))]);
        self.invoke(HostMethod::SendFollowUpMessage, vec![payload])
            .await
    }
}

/// Where a session publishes its gateway once the handshake finishes.
#[derive(Clone, Default)]
pub struct HostApiSlot {
    inner: Arc<OnceLock<Arc<HostApiGateway>>>,
}

impl HostApiSlot {
    /// First publication wins; returns whether this one did.
    pub fn publish(&self, gateway: Arc<HostApiGateway>) -> bool {
        self.inner.set(gateway).is_ok()
    }

    pub fn get(&self) -> Option<Arc<HostApiGateway>> {
        self.inner.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingApi {
        methods: BTreeSet<HostMethod>,
        calls: Mutex<Vec<HostMethod>>,
    }

    impl RecordingApi {
        fn with(methods: &[HostMethod]) -> Self {
            Self {
                methods: methods.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl HostApi for RecordingApi {
        fn has_method(&self, method: HostMethod) -> bool {
            self.methods.contains(&method)
        }

        fn call(&self, method: HostMethod, _args: Vec<RpcValue>) -> BoxFuture<'_, Result<RpcValue, RpcError>> {
            self.calls.lock().unwrap().push(method);
            Box::pin(async { Ok(RpcValue::from("ok")) })
        }

        fn stream(&self, _method: HostMethod, _args: Vec<RpcValue>) -> Result<RemoteGenerator, RpcError> {
            Err(RpcError::Disconnected)
        }
    }

    struct Activation(Option<bool>);

    impl UserActivation for Activation {
        fn is_active(&self) -> Option<bool> {
            self.0
        }
    }

    #[tokio::test]
    async fn gated_call_without_gesture_never_reaches_transport() {
        let api = Arc::new(RecordingApi::with(&HostMethod::ALL));
        let gateway = HostApiGateway::new(api.clone(), Arc::new(Activation(Some(false))));

        let result = gateway.request_display_mode("fullscreen").await.unwrap();
        assert_eq!(result, None);
        assert!(api.calls.lock().unwrap().is_empty());

        // ungated methods still go through
        gateway.notify_escape_key().await.unwrap();
        assert_eq!(*api.calls.lock().unwrap(), vec![HostMethod::NotifyEscapeKey]);
    }

    #[tokio::test]
    async fn missing_activation_api_counts_as_active() {
        let api = Arc::new(RecordingApi::with(&HostMethod::ALL));
        let gateway = HostApiGateway::new(api.clone(), Arc::new(NoUserActivationApi));
        let result = gateway.send_follow_up_message("more").await.unwrap();
        assert_eq!(result, Some(RpcValue::from("ok")));
    }

    #[tokio::test]
    async fn missing_methods_resolve_to_none() {
        let api = Arc::new(RecordingApi::with(&[HostMethod::LogTelemetry]));
        let gateway = HostApiGateway::new(api.clone(), Arc::new(Activation(Some(true))));
        assert_eq!(gateway.open_external("https://x.example").await.unwrap(), None);
        assert_eq!(gateway.stream_completion(RpcValue::Null).unwrap().map(|_| ()), None);
        assert!(api.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn slot_publishes_once() {
        let slot = HostApiSlot::default();
        let gateway = || {
            Arc::new(HostApiGateway::new(
                Arc::new(RecordingApi::default()),
                Arc::new(NoUserActivationApi),
            ))
        };
        assert!(slot.get().is_none());
        assert!(slot.publish(gateway()));
        assert!(!slot.publish(gateway()));
        assert!(slot.get().is_some());
    }
}
