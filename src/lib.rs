// Library exports for embedders and tests

pub mod abort;
pub mod config;
pub mod csp;
pub mod dom;
pub mod frame;
pub mod handshake;
pub mod host_api;
pub mod host_callbacks;
pub mod iterator;
pub mod methods;
pub mod navigation;
pub mod orchestrator;
pub mod port;
pub mod remote;
pub mod rpc;
pub mod session;
pub mod telemetry;
pub mod value;
pub mod window;

// Re-export commonly used types
pub use abort::{AbortController, AbortSignal};
pub use config::BridgeConfig;
pub use host_api::{HostApi, HostApiGateway};
pub use host_callbacks::HostCallbackRegistry;
pub use methods::{HostMethod, SandboxMethod};
pub use orchestrator::{HtmlRunEvent, WidgetOrchestrator, WidgetRunParams};
pub use port::{MessageChannel, MessagePort};
pub use rpc::{CallOptions, RpcError};
pub use session::{HostSession, SandboxSession};
pub use value::RpcValue;
pub use window::{HeadlessWindow, InstrumentableWindow};
