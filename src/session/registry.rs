//! Single-flight session registry.
//!
//! Maps a normalized number to at most one live session. Inserting for an
//! occupied key first drives the existing session to a terminal state and
//! waits for its resources to be released, so working directories are never
//! shared across attempts. No business logic lives here; transitions belong
//! to the state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use uuid::Uuid;

use super::{SessionEvent, SessionState};

/// How long eviction waits for the old session to release its resources.
const EVICTION_WAIT: Duration = Duration::from_secs(5);

/// Registry entry for one live session.
#[derive(Debug, Clone)]
pub struct SessionSlot {
    /// Identifies which session owns this slot; release is a no-op for any
    /// other session id.
    pub session_id: Uuid,
    /// Lifecycle requests (eviction, watchdog) are sent here.
    pub control: mpsc::Sender<SessionEvent>,
    /// Becomes `true` once the session's resources are fully released.
    pub released: watch::Receiver<bool>,
    /// Observes the session's current state.
    pub state: watch::Receiver<SessionState>,
}

/// In-memory single-flight registry keyed by normalized number.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    live: Arc<RwLock<HashMap<String, SessionSlot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the slot for `key`, evicting any live session first.
    ///
    /// Returns only after the previous session for this key (if any) has
    /// released its socket and working directory.
    pub async fn acquire(&self, key: &str, slot: SessionSlot) {
        self.evict(key).await;
        self.live.write().await.insert(key.to_string(), slot);
    }

    /// Drive the live session for `key` (if any) to a terminal state and wait
    /// for its resources to be released.
    pub async fn evict(&self, key: &str) {
        let slot = self.live.write().await.remove(key);
        let Some(mut slot) = slot else { return };

        if slot.control.send(SessionEvent::Evicted).await.is_err() {
            // The session task is already gone.
            return;
        }

        let released = slot.released.wait_for(|done| *done);
        match tokio::time::timeout(EVICTION_WAIT, released).await {
            Ok(_) => {
                tracing::info!(key, "evicted previous session");
            }
            Err(_) => {
                tracing::warn!(key, "evicted session did not release within {EVICTION_WAIT:?}");
            }
        }
    }

    /// Remove the entry for `key` if it is still owned by `session_id`.
    /// Idempotent; a stale release never removes a newer session.
    pub async fn release(&self, key: &str, session_id: Uuid) {
        let mut live = self.live.write().await;
        if live.get(key).is_some_and(|slot| slot.session_id == session_id) {
            live.remove(key);
        }
    }

    /// Observe the state of the live session for `key`.
    pub async fn watch(&self, key: &str) -> Option<watch::Receiver<SessionState>> {
        self.live.read().await.get(key).map(|slot| slot.state.clone())
    }

    /// Whether a live session exists for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        self.live.read().await.contains_key(key)
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.live.read().await.len()
    }

    /// Whether no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.live.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(session_id: Uuid) -> (SessionSlot, mpsc::Receiver<SessionEvent>, watch::Sender<bool>) {
        let (control, control_rx) = mpsc::channel(4);
        let (released_tx, released) = watch::channel(false);
        let (_state_tx, state) = watch::channel(SessionState::Created);
        (
            SessionSlot {
                session_id,
                control,
                released,
                state,
            },
            control_rx,
            released_tx,
        )
    }

    #[tokio::test]
    async fn acquire_then_release_removes_entry() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (s, _rx, _released) = slot(id);

        registry.acquire("94712345678", s).await;
        assert!(registry.contains("94712345678").await);

        registry.release("94712345678", id).await;
        assert!(!registry.contains("94712345678").await);

        // Idempotent.
        registry.release("94712345678", id).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn stale_release_does_not_remove_newer_session() {
        let registry = SessionRegistry::new();
        let old_id = Uuid::new_v4();
        let new_id = Uuid::new_v4();
        let (s, _rx, _released) = slot(new_id);

        registry.acquire("94712345678", s).await;
        registry.release("94712345678", old_id).await;
        assert!(registry.contains("94712345678").await);
    }

    #[tokio::test]
    async fn evict_signals_old_session_and_waits_for_release() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (s, mut control_rx, released_tx) = slot(id);
        registry.acquire("94712345678", s).await;

        // Old session task: release resources when told to.
        let old = tokio::spawn(async move {
            let event = control_rx.recv().await;
            assert!(matches!(event, Some(SessionEvent::Evicted)));
            released_tx.send(true).unwrap();
        });

        let new_id = Uuid::new_v4();
        let (s2, _rx2, _released2) = slot(new_id);
        registry.acquire("94712345678", s2).await;

        old.await.unwrap();
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn evict_tolerates_dead_session_task() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (s, control_rx, _released) = slot(id);
        registry.acquire("94712345678", s).await;
        drop(control_rx);

        // Must not hang or panic.
        registry.evict("94712345678").await;
        assert!(registry.is_empty().await);
    }
}
