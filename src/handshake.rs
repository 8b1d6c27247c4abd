//! The `init` exchange that wires one sandbox frame to its host.
//!
//! The sandbox opens one channel per method it serves and posts
//! `{type: "init", ports, replyPort}` to its parent. The host answers on
//! `replyPort` with the ports for its own methods. Ports travel in the
//! transfer list; the message body refers to them by index.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use url::Url;

use crate::frame::{FrameWindow, WindowMessage, ANY_ORIGIN};
use crate::host_api::HostApi;
use crate::host_callbacks::{HostCallbackRegistry, ServedCallbacks};
use crate::methods::{HostMethod, SandboxMethod};
use crate::port::{MessageChannel, MessagePort, PortError};
use crate::remote::SandboxRemoteApi;
use crate::rpc::{CallOptions, MethodEndpoint, MethodHandler, RemoteGenerator, RpcError};
use crate::value::RpcValue;

pub const INIT_TYPE: &str = "init";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("frame went away before the handshake completed")]
    FrameClosed,
    #[error("malformed handshake message: {0}")]
    Malformed(String),
    #[error(transparent)]
    Port(#[from] PortError),
}

/// The frame URL for one session: `base` plus `sessionId`, `app` and
/// `locale` query parameters.
pub fn sandbox_src(base: &Url, session_id: &str, app: &str, locale: &str) -> Url {
    let mut src = base.clone();
    src.query_pairs_mut()
        .append_pair("sessionId", session_id)
        .append_pair("app", app)
        .append_pair("locale", locale);
    src
}

/// Origin the sandbox addresses its `init` to. Unknown apps fall back to
/// `"*"`.
pub fn target_origin(app: &str, app_origins: &BTreeMap<String, String>) -> String {
    app_origins
        .get(app)
        .cloned()
        .unwrap_or_else(|| ANY_ORIGIN.to_string())
}

/// Replace named ports with their index in the transfer list.
pub fn encode_port_map(ports: Vec<(String, MessagePort)>) -> (RpcValue, Vec<MessagePort>) {
    let mut names = BTreeMap::new();
    let mut transfer = Vec::with_capacity(ports.len());
    for (name, port) in ports {
        names.insert(name, RpcValue::Number(transfer.len() as f64));
        transfer.push(port);
    }
    (RpcValue::Object(names), transfer)
}

fn take_port(
    transfer: &mut [Option<MessagePort>],
    index: &RpcValue,
    what: &str,
) -> Result<MessagePort, HandshakeError> {
    let slot = index
        .as_f64()
        .filter(|index| index.fract() == 0.0 && *index >= 0.0)
        .and_then(|index| transfer.get_mut(index as usize))
        .ok_or_else(|| HandshakeError::Malformed(format!("{what} does not name a transferred port")))?;
    slot.take()
        .ok_or_else(|| HandshakeError::Malformed(format!("{what} reuses a transferred port")))
}

pub fn decode_port_map(
    map: &RpcValue,
    transfer: &mut [Option<MessagePort>],
) -> Result<BTreeMap<String, MessagePort>, HandshakeError> {
    let RpcValue::Object(entries) = map else {
        return Err(HandshakeError::Malformed("port map is not an object".into()));
    };
    entries
        .iter()
        .map(|(name, index)| Ok((name.clone(), take_port(transfer, index, name)?)))
        .collect()
}

/// The sandbox's opening message.
#[derive(Debug)]
pub struct InitMessage {
    pub ports: BTreeMap<String, MessagePort>,
    pub reply_port: MessagePort,
}

impl InitMessage {
    pub fn is_init(data: &RpcValue) -> bool {
        data.get("type").and_then(RpcValue::as_str) == Some(INIT_TYPE)
    }

    pub fn encode(ports: Vec<(String, MessagePort)>, reply_port: MessagePort) -> (RpcValue, Vec<MessagePort>) {
        let (names, mut transfer) = encode_port_map(ports);
        let reply_index = transfer.len() as f64;
        transfer.push(reply_port);
        let data = RpcValue::object([
            ("type", RpcValue::from(INIT_TYPE)),
            ("ports", names),
            ("replyPort", RpcValue::Number(reply_index)),
        ]);
        (data, transfer)
    }

    /// `Ok(None)` for messages that are not an `init`.
    pub fn decode(data: &RpcValue, transfer: Vec<MessagePort>) -> Result<Option<Self>, HandshakeError> {
        if !Self::is_init(data) {
            return Ok(None);
        }
        let mut transfer: Vec<Option<MessagePort>> = transfer.into_iter().map(Some).collect();
        let reply_index = data
            .get("replyPort")
            .ok_or_else(|| HandshakeError::Malformed("init without replyPort".into()))?;
        let reply_port = take_port(&mut transfer, reply_index, "replyPort")?;
        let ports = match data.get("ports") {
            Some(map) => decode_port_map(map, &mut transfer)?,
            None => BTreeMap::new(),
        };
        Ok(Some(Self { ports, reply_port }))
    }
}

/// Wait for the frame's `init`, answer it with the host's ports and wrap the
/// sandbox's ports. Messages from other origins and other message types are
/// skipped.
pub async fn accept_init(
    inbox: &mut UnboundedReceiver<WindowMessage>,
    frame_origin: &str,
    registry: &HostCallbackRegistry,
    rpc_timeout: Option<Duration>,
) -> Result<(SandboxRemoteApi, ServedCallbacks), HandshakeError> {
    loop {
        let WindowMessage { origin, data, ports } =
            inbox.recv().await.ok_or(HandshakeError::FrameClosed)?;
        if origin != frame_origin {
            debug!(target = "handshake", %origin, "ignoring message from another origin");
            continue;
        }
        let init = match InitMessage::decode(&data, ports) {
            Ok(Some(init)) => init,
            Ok(None) => continue,
            Err(err) => {
                warn!(target = "handshake", error = %err, "ignoring malformed init");
                continue;
            }
        };

        let mut served = registry.serve();
        let (descriptor, transfer) = encode_port_map(std::mem::take(&mut served.ports));
        init.reply_port.post_message(&descriptor, transfer)?;

        let remote = SandboxRemoteApi::from_ports(init.ports, rpc_timeout);
        info!(
            target = "handshake",
            sandbox_methods = remote.methods().len(),
            host_methods = served.endpoints.len(),
            "sandbox connected"
        );
        return Ok((remote, served));
    }
}

/// The sandbox's client for the methods the host offered.
pub struct HostClient {
    endpoints: BTreeMap<HostMethod, MethodEndpoint>,
}

impl HostClient {
    pub fn from_ports(ports: BTreeMap<String, MessagePort>, rpc_timeout: Option<Duration>) -> Self {
        let mut endpoints = BTreeMap::new();
        for (name, port) in ports {
            match name.parse::<HostMethod>() {
                Ok(method) => {
                    endpoints.insert(
                        method,
                        MethodEndpoint::caller(port, method.is_generator(), rpc_timeout),
                    );
                }
                Err(err) => warn!(target = "handshake", error = %err, "ignoring unknown host method"),
            }
        }
        Self { endpoints }
    }

    pub fn methods(&self) -> Vec<HostMethod> {
        self.endpoints.keys().copied().collect()
    }

    fn endpoint(&self, method: HostMethod) -> Result<&MethodEndpoint, RpcError> {
        self.endpoints
            .get(&method)
            .ok_or_else(|| RpcError::UnknownMethod(method.to_string()))
    }
}

impl HostApi for HostClient {
    fn has_method(&self, method: HostMethod) -> bool {
        self.endpoints.contains_key(&method)
    }

    fn call(&self, method: HostMethod, args: Vec<RpcValue>) -> BoxFuture<'_, Result<RpcValue, RpcError>> {
        Box::pin(async move { self.endpoint(method)?.call(args).await })
    }

    fn stream(&self, method: HostMethod, args: Vec<RpcValue>) -> Result<RemoteGenerator, RpcError> {
        self.endpoint(method)?.stream(args, CallOptions::default())
    }
}

/// Guest half of a finished handshake. `served` must stay alive for the
/// sandbox's methods to keep answering.
pub struct Announced {
    pub host: HostClient,
    pub served: Vec<MethodEndpoint>,
}

/// Serve `handlers`, post `init` to the parent and wait for the host's
/// reply.
pub async fn announce(
    frame: &FrameWindow,
    handlers: BTreeMap<SandboxMethod, MethodHandler>,
    target_origin: &str,
    rpc_timeout: Option<Duration>,
) -> Result<Announced, HandshakeError> {
    let mut served = Vec::with_capacity(handlers.len());
    let mut ports = Vec::with_capacity(handlers.len());
    for (method, handler) in handlers {
        let (local, remote) = MessageChannel::new();
        served.push(MethodEndpoint::serving(local, handler));
        ports.push((method.name().to_string(), remote));
    }

    let (mut reply, remote_reply) = MessageChannel::new();
    let (data, transfer) = InitMessage::encode(ports, remote_reply);
    frame.post_to_parent(&data, target_origin, transfer)?;
    debug!(target = "handshake", %target_origin, "init posted");

    let descriptor = reply.recv().await.ok_or(HandshakeError::FrameClosed)?;
    let mut transfer: Vec<Option<MessagePort>> = descriptor.ports.into_iter().map(Some).collect();
    let host_ports = decode_port_map(&descriptor.data, &mut transfer)?;
    let host = HostClient::from_ports(host_ports, rpc_timeout);
    info!(
        target = "handshake",
        host_methods = host.endpoints.len(),
        "host descriptor received"
    );
    Ok(Announced { host, served })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn src_carries_session_parameters() {
        let base = Url::parse("https://sandbox.example/frame?v=2").unwrap();
        let src = sandbox_src(&base, "abc", "chatgpt", "fr-FR");
        assert_eq!(
            src.as_str(),
            "https://sandbox.example/frame?v=2&sessionId=abc&app=chatgpt&locale=fr-FR"
        );
    }

    #[test]
    fn unknown_apps_target_any_origin() {
        let table = BTreeMap::from([("chatgpt".to_string(), "https://chatgpt.com".to_string())]);
        assert_eq!(target_origin("chatgpt", &table), "https://chatgpt.com");
        assert_eq!(target_origin("elsewhere", &table), "*");
    }

    #[tokio::test]
    async fn init_messages_reference_ports_by_index() {
        let (a, _a) = MessageChannel::new();
        let (b, _b) = MessageChannel::new();
        let (reply, _reply) = MessageChannel::new();
        let (data, transfer) = InitMessage::encode(
            vec![("navigate".into(), a), ("stop".into(), b)],
            reply,
        );
        assert_eq!(data.get("replyPort"), Some(&RpcValue::Number(2.0)));
        assert_eq!(transfer.len(), 3);

        let init = InitMessage::decode(&data, transfer).unwrap().unwrap();
        assert_eq!(init.ports.keys().collect::<Vec<_>>(), ["navigate", "stop"]);
    }

    #[test]
    fn non_init_messages_are_not_decoded() {
        let data = RpcValue::object([("type", RpcValue::from("resize"))]);
        assert!(InitMessage::decode(&data, Vec::new()).unwrap().is_none());
    }

    #[test]
    fn dangling_port_indices_are_malformed() {
        let data = RpcValue::object([
            ("type", RpcValue::from(INIT_TYPE)),
            ("replyPort", RpcValue::Number(4.0)),
        ]);
        assert!(matches!(
            InitMessage::decode(&data, Vec::new()),
            Err(HandshakeError::Malformed(_))
        ));
    }
}
