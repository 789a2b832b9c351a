use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative shutdown handle shared by all long-running broker tasks.
///
/// Cloning is cheap; every clone observes the same signal. Once initiated
/// the signal is permanent for the life of the handle.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Begin shutdown. Idempotent.
    pub fn initiate(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_initiated(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been initiated.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_initiate_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        assert!(!shutdown.is_initiated());
        shutdown.initiate();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .expect("waiter task should not panic");
        assert!(shutdown.is_initiated());
    }

    #[tokio::test]
    async fn test_cancelled_after_initiate_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.initiate();
        shutdown.cancelled().await;
    }
}
