// Consumer cancellation signal

use tokio::sync::watch;

/// Observed by a consumer's dispatch task
#[derive(Clone)]
pub(crate) struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Check if cancellation was requested
    pub(crate) fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested (or the sender is gone)
    pub(crate) async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Held by whoever may cancel the consumer (channel, queue deletion)
pub(crate) struct CancelSender {
    tx: watch::Sender<bool>,
}

impl CancelSender {
    pub(crate) fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Create a cancellation pair
pub(crate) fn cancel_channel() -> (CancelSender, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSender { tx }, CancelToken { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let (sender, token) = cancel_channel();
        assert!(!token.is_cancelled());

        let mut waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        sender.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let (sender, mut token) = cancel_channel();
        sender.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled");
    }

    #[tokio::test]
    async fn test_dropped_sender_releases_waiter() {
        let (sender, mut token) = cancel_channel();
        drop(sender);
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("sender dropped");
    }
}
