use std::sync::Mutex;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::port::{MessagePort, PortError};
use crate::value::RpcValue;

pub const ANY_ORIGIN: &str = "*";

/// A `window.postMessage` delivery.
#[derive(Debug)]
pub struct WindowMessage {
    /// Origin of the sending window.
    pub origin: String,
    pub data: RpcValue,
    pub ports: Vec<MessagePort>,
}

/// Host-side handle on a sandbox frame element.
pub struct SandboxFrame {
    id: Uuid,
    src: Url,
    frame_origin: String,
    to_frame: UnboundedSender<WindowMessage>,
    inbox: Mutex<Option<UnboundedReceiver<WindowMessage>>>,
}

/// The sandbox's view of its embedding: its own origin and `window.parent`.
pub struct FrameWindow {
    frame_id: Uuid,
    origin: String,
    parent_origin: String,
    to_parent: UnboundedSender<WindowMessage>,
    inbox: UnboundedReceiver<WindowMessage>,
}

pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

impl SandboxFrame {
    /// Create a frame pointing at `src`, embedded by a page at `host_origin`.
    pub fn create(src: Url, host_origin: &str) -> (SandboxFrame, FrameWindow) {
        let id = Uuid::new_v4();
        let (to_parent, parent_inbox) = unbounded_channel();
        let (to_frame, frame_inbox) = unbounded_channel();
        let frame_origin = origin_of(&src);
        let frame = SandboxFrame {
            id,
            src,
            frame_origin: frame_origin.clone(),
            to_frame,
            inbox: Mutex::new(Some(parent_inbox)),
        };
        let window = FrameWindow {
            frame_id: id,
            origin: frame_origin,
            parent_origin: host_origin.to_string(),
            to_parent,
            inbox: frame_inbox,
        };
        (frame, window)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn src(&self) -> &Url {
        &self.src
    }

    pub fn origin(&self) -> &str {
        &self.frame_origin
    }

    /// Messages the frame posted to its parent. Only one listener may take
    /// them.
    pub fn take_inbox(&self) -> Option<UnboundedReceiver<WindowMessage>> {
        self.inbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// `iframe.contentWindow.postMessage(data, targetOrigin, transfer)`.
    pub fn post_to_frame(
        &self,
        host_origin: &str,
        data: &RpcValue,
        target_origin: &str,
        transfer: Vec<MessagePort>,
    ) -> Result<(), PortError> {
        post_window_message(
            &self.to_frame,
            host_origin,
            &self.frame_origin,
            data,
            target_origin,
            transfer,
        )
    }
}

impl FrameWindow {
    pub fn frame_id(&self) -> Uuid {
        self.frame_id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// `window.parent.postMessage(data, targetOrigin, transfer)`.
    pub fn post_to_parent(
        &self,
        data: &RpcValue,
        target_origin: &str,
        transfer: Vec<MessagePort>,
    ) -> Result<(), PortError> {
        post_window_message(
            &self.to_parent,
            &self.origin,
            &self.parent_origin,
            data,
            target_origin,
            transfer,
        )
    }

    pub async fn recv(&mut self) -> Option<WindowMessage> {
        self.inbox.recv().await
    }
}

/// Deliver unless `target_origin` rules the receiver out, in which case the
/// message is silently dropped, as browsers do.
fn post_window_message(
    outbound: &UnboundedSender<WindowMessage>,
    sender_origin: &str,
    receiver_origin: &str,
    data: &RpcValue,
    target_origin: &str,
    transfer: Vec<MessagePort>,
) -> Result<(), PortError> {
    let data = data.structured_clone()?;
    if target_origin != ANY_ORIGIN && target_origin != receiver_origin {
        warn!(
            target = "handshake",
            %target_origin,
            %receiver_origin,
            "dropping postMessage for mismatched target origin"
        );
        return Ok(());
    }
    outbound
        .send(WindowMessage {
            origin: sender_origin.to_string(),
            data,
            ports: transfer,
        })
        .map_err(|_| PortError::Closed)
}
