use tokio::sync::watch;
use tracing::info;

/// Open/closed gate; controllers only dequeue while it is open.
///
/// Typically closed while the process does not hold its leader lease, or
/// when controllers are paused by configuration.
#[derive(Debug)]
pub struct Plug {
    tx: watch::Sender<bool>,
}

impl Plug {
    pub fn new(open: bool) -> Self {
        let (tx, _rx) = watch::channel(open);
        Self { tx }
    }

    pub fn open(&self) {
        if !self.tx.send_replace(true) {
            info!("plug: opened");
        }
    }

    pub fn close(&self) {
        if self.tx.send_replace(false) {
            info!("plug: closed");
        }
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the plug is open (immediately if it already is).
    pub async fn wait_open(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Resolve once the plug is closed (immediately if it already is).
    pub async fn wait_closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| !*open).await;
    }
}

impl Default for Plug {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_open_resolves_on_open() {
        let plug = Arc::new(Plug::new(false));
        assert!(!plug.is_open());
        let waiter = tokio::spawn({
            let plug = plug.clone();
            async move { plug.wait_open().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        plug.open();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(plug.is_open());
        plug.close();
        assert!(!plug.is_open());
    }

    #[tokio::test]
    async fn wait_closed_resolves_on_close() {
        let plug = Arc::new(Plug::new(true));
        let waiter = tokio::spawn({
            let plug = plug.clone();
            async move { plug.wait_closed().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        plug.close();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        // Already closed: resolves at once.
        tokio::time::timeout(Duration::from_millis(50), plug.wait_closed()).await.unwrap();
    }
}
