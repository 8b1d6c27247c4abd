//! Push-to-pull bridge: producers call `push`/`complete`/`error` whenever they
//! like, consumers poll a `Stream`.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

type Slot<T> = Arc<Mutex<Option<UnboundedSender<anyhow::Result<T>>>>>;

/// Producer handle. Clones feed the same iterator; terminating through any
/// clone closes the channel for all of them.
pub struct IteratorController<T> {
    sender: Slot<T>,
}

impl<T> Clone for IteratorController<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

/// Consumer side. Yields buffered values in push order, then at most one
/// error, then ends.
pub struct AsyncIter<T> {
    receiver: UnboundedReceiverStream<anyhow::Result<T>>,
    finished: bool,
}

pub fn create_async_iterator<T, F>(producer: F) -> AsyncIter<T>
where
    F: FnOnce(IteratorController<T>),
{
    let (sender, receiver) = unbounded_channel();
    producer(IteratorController {
        sender: Arc::new(Mutex::new(Some(sender))),
    });
    AsyncIter {
        receiver: UnboundedReceiverStream::new(receiver),
        finished: false,
    }
}

impl<T> IteratorController<T> {
    fn slot(&self) -> MutexGuard<'_, Option<UnboundedSender<anyhow::Result<T>>>> {
        self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a value. Ignored once the iterator has terminated.
    pub fn push(&self, value: T) {
        if let Some(sender) = self.slot().as_ref() {
            // a dropped consumer just discards the value
            let _ = sender.send(Ok(value));
        }
    }

    /// End the stream after whatever is already buffered.
    pub fn complete(&self) {
        self.slot().take();
    }

    pub fn error(&self, error: anyhow::Error) {
        if let Some(sender) = self.slot().take() {
            let _ = sender.send(Err(error));
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.slot().is_none()
    }
}

impl<T> Stream for AsyncIter<T> {
    type Item = anyhow::Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let item = std::task::ready!(Pin::new(&mut this.receiver).poll_next(cx));
        if !matches!(item, Some(Ok(_))) {
            this.finished = true;
        }
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn buffers_values_pushed_before_consumption() {
        let mut iter = create_async_iterator(|controller| {
            controller.push(1);
            controller.push(2);
            controller.complete();
            controller.push(3);
        });
        assert_eq!(iter.next().await.unwrap().unwrap(), 1);
        assert_eq!(iter.next().await.unwrap().unwrap(), 2);
        assert!(iter.next().await.is_none());
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn pending_next_resolves_on_push() {
        let mut slot = None;
        let mut iter = create_async_iterator(|controller| slot = Some(controller));
        let controller = slot.unwrap();

        let consumer = tokio::spawn(async move { iter.next().await.map(|item| item.unwrap()) });
        tokio::time::sleep(Duration::from_millis(5)).await;
        controller.push("ready");
        assert_eq!(consumer.await.unwrap(), Some("ready"));
    }

    #[tokio::test]
    async fn error_is_delivered_once_then_done() {
        let mut iter = create_async_iterator::<u8, _>(|controller| {
            controller.error(anyhow!("producer failed"));
            controller.complete();
        });
        let err = iter.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "producer failed");
        assert!(iter.next().await.is_none());
    }
}
