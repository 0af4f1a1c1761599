//! One-shot readiness handshake.

use tokio::sync::watch;

/// Fires once when a connection (or the engine) becomes usable.
///
/// Marking ready a second time is a no-op. Listeners that subscribe after
/// the transition see it immediately.
#[derive(Debug)]
pub struct Readiness {
    tx: watch::Sender<bool>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Returns true only for the call that performed the transition.
    pub fn mark_ready(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ReadyListener {
        ReadyListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of [`Readiness`].
#[derive(Debug, Clone)]
pub struct ReadyListener {
    rx: watch::Receiver<bool>,
}

impl ReadyListener {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once ready. Never resolves if the sender is dropped first.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|ready| *ready).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn late_listener_sees_ready_immediately() {
        let readiness = Readiness::new();
        assert!(readiness.mark_ready());
        let mut listener = readiness.listener();
        tokio::time::timeout(Duration::from_millis(50), listener.wait())
            .await
            .expect("already ready");
    }

    #[tokio::test]
    async fn second_mark_is_a_noop() {
        let readiness = Readiness::new();
        assert!(readiness.mark_ready());
        assert!(!readiness.mark_ready());
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn waiting_listener_wakes_on_transition() {
        let readiness = Readiness::new();
        let mut listener = readiness.listener();
        let waiter = tokio::spawn(async move {
            listener.wait().await;
            true
        });
        tokio::task::yield_now().await;
        readiness.mark_ready();
        assert!(waiter.await.unwrap());
    }
}
