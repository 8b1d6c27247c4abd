//! Per-frame sessions. Everything a frame needs lives on its session, so
//! two frames never share handshake, CSP, cache or host API state.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{BridgeConfig, ConfigError};
use crate::frame::{FrameWindow, SandboxFrame, WindowMessage};
use crate::handshake::{self, accept_init, HandshakeError, InitMessage};
use crate::host_api::{HostApiGateway, HostApiSlot};
use crate::host_callbacks::{HostCallbackRegistry, ServedCallbacks};
use crate::orchestrator::WidgetOrchestrator;
use crate::remote::SandboxRemoteApi;
use crate::rpc::MethodEndpoint;
use crate::window::{InstrumentableWindow, UserActivation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Disposed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session has been disposed")]
    Disposed,
    #[error("another listener owns the frame's messages")]
    InboxTaken,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn within<T>(
    limit: Option<Duration>,
    future: impl Future<Output = Result<T, HandshakeError>>,
) -> Result<T, HandshakeError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| HandshakeError::Timeout(limit))?,
        None => future.await,
    }
}

/// The host's side of one sandbox frame.
pub struct HostSession {
    frame: SandboxFrame,
    registry: HostCallbackRegistry,
    inbox: tokio::sync::Mutex<Option<UnboundedReceiver<WindowMessage>>>,
    remote: OnceCell<Arc<SandboxRemoteApi>>,
    served: Mutex<Option<ServedCallbacks>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<SessionState>,
    rpc_timeout: Option<Duration>,
    handshake_timeout: Option<Duration>,
}

impl HostSession {
    /// Create the frame for `app` and return the window the sandbox runs in.
    pub fn create(
        config: &BridgeConfig,
        app: &str,
        registry: HostCallbackRegistry,
        host_origin: &str,
    ) -> Result<(Self, FrameWindow), SessionError> {
        let session_id = Uuid::new_v4();
        let src = handshake::sandbox_src(
            &config.sandbox_base_url()?,
            &session_id.to_string(),
            app,
            &config.locale,
        );
        let (frame, window) = SandboxFrame::create(src, host_origin);
        let inbox = frame.take_inbox();
        info!(target = "handshake", frame = %frame.id(), src = %frame.src(), "sandbox frame created");
        let session = Self {
            frame,
            registry,
            inbox: tokio::sync::Mutex::new(inbox),
            remote: OnceCell::new(),
            served: Mutex::new(None),
            drain: Mutex::new(None),
            state: Mutex::new(SessionState::Created),
            rpc_timeout: config.rpc_timeout(),
            handshake_timeout: config.handshake_timeout(),
        };
        Ok((session, window))
    }

    pub fn frame(&self) -> &SandboxFrame {
        &self.frame
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn remote(&self) -> Option<Arc<SandboxRemoteApi>> {
        self.remote.get().cloned()
    }

    /// Complete the handshake, once. Concurrent callers share the same
    /// attempt; a failed attempt may be retried.
    pub async fn connect(&self) -> Result<Arc<SandboxRemoteApi>, SessionError> {
        if self.state() == SessionState::Disposed {
            return Err(SessionError::Disposed);
        }
        let remote = self.remote.get_or_try_init(|| self.handshake()).await?;
        Ok(Arc::clone(remote))
    }

    async fn handshake(&self) -> Result<Arc<SandboxRemoteApi>, SessionError> {
        let mut slot = self.inbox.lock().await;
        let inbox = slot.as_mut().ok_or(SessionError::InboxTaken)?;
        let (remote, served) = within(
            self.handshake_timeout,
            accept_init(inbox, self.frame.origin(), &self.registry, self.rpc_timeout),
        )
        .await?;

        if let Some(mut inbox) = slot.take() {
            *lock(&self.drain) = Some(tokio::spawn(async move {
                while let Some(message) = inbox.recv().await {
                    if InitMessage::is_init(&message.data) {
                        warn!(target = "handshake", "ignoring init after the handshake completed");
                    }
                }
            }));
        }
        *lock(&self.served) = Some(served);

        let mut state = lock(&self.state);
        if *state == SessionState::Disposed {
            remote.close();
            return Err(SessionError::Disposed);
        }
        *state = SessionState::Active;
        Ok(Arc::new(remote))
    }

    pub fn dispose(&self) {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Disposed {
                return;
            }
            *state = SessionState::Disposed;
        }
        if let Some(remote) = self.remote.get() {
            remote.close();
        }
        if let Some(drain) = lock(&self.drain).take() {
            drain.abort();
        }
        lock(&self.served).take();
        info!(target = "handshake", frame = %self.frame.id(), "sandbox session disposed");
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct WindowActivation(Arc<dyn InstrumentableWindow>);

impl UserActivation for WindowActivation {
    fn is_active(&self) -> Option<bool> {
        self.0.is_active()
    }
}

/// The sandbox's side: its orchestrator and the host API published to it.
pub struct SandboxSession {
    frame: FrameWindow,
    window: Arc<dyn InstrumentableWindow>,
    target_origin: String,
    orchestrator: Arc<WidgetOrchestrator>,
    host_api: HostApiSlot,
    served: Mutex<Vec<MethodEndpoint>>,
    state: Mutex<SessionState>,
    rpc_timeout: Option<Duration>,
    handshake_timeout: Option<Duration>,
}

impl SandboxSession {
    pub fn new(
        frame: FrameWindow,
        window: Arc<dyn InstrumentableWindow>,
        app: &str,
        config: &BridgeConfig,
    ) -> Self {
        let host_api = HostApiSlot::default();
        let orchestrator = Arc::new(WidgetOrchestrator::new(
            Arc::clone(&window),
            host_api.clone(),
            config.orchestrator_options(),
        ));
        Self {
            frame,
            window,
            target_origin: handshake::target_origin(app, &config.app_origins),
            orchestrator,
            host_api,
            served: Mutex::new(Vec::new()),
            state: Mutex::new(SessionState::Created),
            rpc_timeout: config.rpc_timeout(),
            handshake_timeout: config.handshake_timeout(),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn orchestrator(&self) -> &Arc<WidgetOrchestrator> {
        &self.orchestrator
    }

    /// Serve the sandbox methods, announce them to the parent and publish
    /// the host API from the reply.
    pub async fn announce(&self) -> Result<Arc<HostApiGateway>, SessionError> {
        match self.state() {
            SessionState::Disposed => return Err(SessionError::Disposed),
            SessionState::Active => {
                if let Some(gateway) = self.host_api() {
                    return Ok(gateway);
                }
            }
            SessionState::Created => {}
        }
        let announced = within(
            self.handshake_timeout,
            handshake::announce(
                &self.frame,
                self.orchestrator.handlers(),
                &self.target_origin,
                self.rpc_timeout,
            ),
        )
        .await?;

        let gateway = Arc::new(HostApiGateway::new(
            Arc::new(announced.host),
            Arc::new(WindowActivation(Arc::clone(&self.window))),
        ));
        if !self.publish_host_api(Arc::clone(&gateway)) {
            warn!(target = "host_api", "host api already published for this sandbox");
        }
        *lock(&self.served) = announced.served;
        *lock(&self.state) = SessionState::Active;
        Ok(self.host_api().unwrap_or(gateway))
    }

    /// First publication wins.
    pub fn publish_host_api(&self, gateway: Arc<HostApiGateway>) -> bool {
        self.host_api.publish(gateway)
    }

    pub fn host_api(&self) -> Option<Arc<HostApiGateway>> {
        self.host_api.get()
    }

    pub fn dispose(&self) {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Disposed {
                return;
            }
            *state = SessionState::Disposed;
        }
        self.orchestrator.dispose();
        lock(&self.served).clear();
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

