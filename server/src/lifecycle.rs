//! Shared shutdown signal observed by every long-running loop.

use std::time::Duration;

use tokio::sync::watch;

pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_pair() -> (ShutdownController, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownController { tx }, Shutdown { rx })
}

impl ShutdownController {
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the shutdown signal fires.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Interruptible sleep. Returns false when cut short by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_is_interruptible() {
        let (ctl, shutdown) = shutdown_pair();
        let handle = tokio::spawn(async move {
            shutdown.sleep(Duration::from_secs(60)).await
        });
        ctl.signal();
        let completed = handle.await.unwrap();
        assert!(!completed);
    }

    #[tokio::test]
    async fn sleep_completes_without_signal() {
        let (_ctl, shutdown) = shutdown_pair();
        assert!(shutdown.sleep(Duration::from_millis(5)).await);
    }
}
