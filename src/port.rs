use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::value::{DataCloneError, RpcValue};

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum PortError {
    #[error(transparent)]
    DataClone(#[from] DataCloneError),
    #[error("message port is closed")]
    Closed,
}

/// A single delivery on a port: the cloned payload plus any ports whose
/// ownership moved along with it.
#[derive(Debug)]
pub struct PortMessage {
    pub data: RpcValue,
    pub ports: Vec<MessagePort>,
}

/// One end of an entangled pair. Delivery is FIFO per port; dropping or
/// closing an end disentangles both.
pub struct MessagePort {
    id: u64,
    outbound: Option<UnboundedSender<PortMessage>>,
    inbound: UnboundedReceiver<PortMessage>,
}

impl fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePort")
            .field("id", &self.id)
            .field("closed", &self.outbound.is_none())
            .finish()
    }
}

/// Send half of a port, cloneable so several callers can share one
/// request port.
#[derive(Debug, Clone)]
pub struct PortSender {
    port_id: u64,
    outbound: UnboundedSender<PortMessage>,
}

#[derive(Debug)]
pub struct PortReceiver {
    port_id: u64,
    inbound: UnboundedReceiver<PortMessage>,
}

/// Creates an entangled port pair, like `new MessageChannel()`.
pub struct MessageChannel;

impl MessageChannel {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MessagePort, MessagePort) {
        let (to_second, second_inbound) = unbounded_channel();
        let (to_first, first_inbound) = unbounded_channel();
        let first = MessagePort {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            outbound: Some(to_second),
            inbound: first_inbound,
        };
        let second = MessagePort {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            outbound: Some(to_first),
            inbound: second_inbound,
        };
        (first, second)
    }
}

fn deliver(
    outbound: &UnboundedSender<PortMessage>,
    data: &RpcValue,
    transfer: Vec<MessagePort>,
) -> Result<(), PortError> {
    let data = data.structured_clone()?;
    outbound
        .send(PortMessage {
            data,
            ports: transfer,
        })
        .map_err(|_| PortError::Closed)
}

impl MessagePort {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_none()
    }

    /// Clone `data` and queue it for the entangled port. Transferred ports
    /// move with the message.
    pub fn post_message(&self, data: &RpcValue, transfer: Vec<MessagePort>) -> Result<(), PortError> {
        let outbound = self.outbound.as_ref().ok_or(PortError::Closed)?;
        deliver(outbound, data, transfer)
    }

    /// Next message, or `None` once the peer is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<PortMessage> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PortMessage> {
        self.inbound.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }

    pub fn sender(&self) -> Option<PortSender> {
        self.outbound.as_ref().map(|outbound| PortSender {
            port_id: self.id,
            outbound: outbound.clone(),
        })
    }

    pub fn split(self) -> (Option<PortSender>, PortReceiver) {
        let sender = self.outbound.map(|outbound| PortSender {
            port_id: self.id,
            outbound,
        });
        (
            sender,
            PortReceiver {
                port_id: self.id,
                inbound: self.inbound,
            },
        )
    }
}

impl PortSender {
    pub fn port_id(&self) -> u64 {
        self.port_id
    }

    pub fn post_message(&self, data: &RpcValue, transfer: Vec<MessagePort>) -> Result<(), PortError> {
        deliver(&self.outbound, data, transfer)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl PortReceiver {
    pub fn port_id(&self) -> u64 {
        self.port_id
    }

    pub async fn recv(&mut self) -> Option<PortMessage> {
        self.inbound.recv().await
    }
}
