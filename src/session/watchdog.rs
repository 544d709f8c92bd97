//! Per-session abandonment timer.
//!
//! Arms once per session and requests abandonment through the session's event
//! queue if no terminal event occurs within the budget. Expiry is a request,
//! not a forced mutation: the state machine still runs its single terminal
//! path, so resource release is never duplicated.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::SessionEvent;

/// Owned handle to one armed timer.
#[derive(Debug)]
pub struct Watchdog {
    cancel: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Arm a timer that sends [`SessionEvent::WatchdogFired`] into `queue`
    /// after `budget`, unless cancelled first.
    pub fn arm(budget: Duration, queue: mpsc::Sender<SessionEvent>) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(budget) => {
                    tracing::debug!(budget_ms = budget.as_millis() as u64, "watchdog fired");
                    let _ = queue.send(SessionEvent::WatchdogFired).await;
                }
                _ = cancel_rx => {}
            }
        });
        Self {
            cancel: Some(cancel_tx),
            handle: Some(handle),
        }
    }

    /// Cancel the timer. Idempotent; a no-op if it already fired.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether the timer is still armed.
    pub fn is_armed(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_budget() {
        let (tx, mut rx) = mpsc::channel(4);
        let _watchdog = Watchdog::arm(Duration::from_secs(75), tx);

        tokio::time::advance(Duration::from_secs(76)).await;
        let event = rx.recv().await;
        assert!(matches!(event, Some(SessionEvent::WatchdogFired)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut watchdog = Watchdog::arm(Duration::from_secs(75), tx);
        assert!(watchdog.is_armed());

        watchdog.cancel();
        assert!(!watchdog.is_armed());

        tokio::time::advance(Duration::from_secs(100)).await;
        // Sender dropped without sending.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (tx, _rx) = mpsc::channel(4);
        let mut watchdog = Watchdog::arm(Duration::from_secs(10), tx);
        watchdog.cancel();
        watchdog.cancel();
    }
}
