use tokio_util::sync::CancellationToken;

/// Owner side of a cooperative cancellation flag.
#[derive(Debug, Default)]
pub struct AbortController {
    token: CancellationToken,
}

/// Observer side. Cheap to clone; every clone sees the same abort.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            token: self.token.clone(),
        }
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        AbortController::new().signal()
    }

    /// A controller of its own that is also aborted when this signal fires.
    /// Aborting the child leaves this signal untouched.
    pub fn child(&self) -> AbortController {
        AbortController {
            token: self.token.child_token(),
        }
    }

    pub fn aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once aborted. Pends forever if the controller is dropped
    /// without aborting.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_resolves_after_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.aborted());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });
        controller.abort();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("abort observed")
            .unwrap();
        assert!(signal.aborted());
    }

    #[test]
    fn children_follow_their_parent_only() {
        let parent = AbortController::new();
        let child = parent.signal().child();
        child.abort();
        assert!(!parent.is_aborted());

        let child = parent.signal().child();
        parent.abort();
        assert!(child.is_aborted());
    }

    #[tokio::test]
    async fn dropped_controller_never_fires() {
        let signal = AbortController::new().signal();
        let result = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
