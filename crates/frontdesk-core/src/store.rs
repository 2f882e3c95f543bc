//! Session store with atomic per-key updates.
//!
//! A call has two concurrent producers (the audio-frame path and the control
//! path); both funnel their session mutations through here. DashMap's entry
//! lock serializes updates per key while independent calls proceed in
//! parallel.

use crate::error::{CallError, CallResult};
use crate::session::{CallSession, Outcome};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Registry of live call sessions, keyed by telephony session id.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, CallSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a snapshot, creating the session on first inbound signal.
    /// Exactly one session exists per live id.
    pub fn get_or_create(&self, session_id: &str) -> CallSession {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(session_id, "Session created");
                CallSession::new(session_id)
            })
            .clone()
    }

    /// Fetch a snapshot without creating.
    pub fn get(&self, session_id: &str) -> Option<CallSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Run `f` against the live session under the per-key lock. This is the
    /// only mutation path; concurrent callers for the same id serialize here.
    pub fn with_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut CallSession) -> R,
    ) -> CallResult<R> {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => Ok(f(entry.value_mut())),
            None => Err(CallError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Atomic update returning the post-update snapshot. Sessions with a
    /// terminal outcome refuse further mutation and return unchanged.
    pub fn update(
        &self,
        session_id: &str,
        mutator: impl FnOnce(&mut CallSession),
    ) -> CallResult<CallSession> {
        self.with_session(session_id, |session| {
            if session.outcome().is_none() {
                mutator(session);
                session.touch();
            }
            session.clone()
        })
    }

    /// Remove a session. Idempotent: removing a missing id is a no-op.
    pub fn remove(&self, session_id: &str) -> Option<CallSession> {
        let removed = self.sessions.remove(session_id).map(|(_, s)| s);
        if removed.is_some() {
            info!(session_id, "Session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Evict sessions idle past `timeout`. Evicted sessions are marked
    /// abandoned (unless already terminal) and returned for teardown.
    pub fn evict_idle(&self, timeout: Duration) -> Vec<CallSession> {
        let now = Utc::now();
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.idle_for(now) > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for id in stale {
            // Re-check under the entry lock: the session may have seen
            // activity between the scan and the removal.
            let removed = self
                .sessions
                .remove_if(&id, |_, session| session.idle_for(now) > timeout);
            if let Some((_, mut session)) = removed {
                session.set_outcome(Outcome::Abandoned);
                debug!(session_id = %id, "Idle session evicted");
                evicted.push(session);
            }
        }
        evicted
    }

    /// Background eviction sweep. Evicted sessions are handed to the caller
    /// over the returned channel so the runtime can release the audio path.
    /// Send `true` on the watch sender to stop the task.
    pub fn start_eviction_task(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
    ) -> (watch::Sender<bool>, mpsc::Receiver<CallSession>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (evicted_tx, evicted_rx) = mpsc::channel(32);
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for session in store.evict_idle(timeout) {
                            if evicted_tx.send(session).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Session eviction task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        (shutdown_tx, evicted_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CallState;

    #[test]
    fn get_or_create_is_single_per_id() {
        let store = SessionStore::new();
        let a = store.get_or_create("CA1");
        let b = store.get_or_create("CA1");
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_missing_session_fails() {
        let store = SessionStore::new();
        let err = store.update("CA404", |_| {}).unwrap_err();
        assert!(matches!(err, CallError::SessionNotFound(_)));
    }

    #[test]
    fn update_refuses_terminal_sessions() {
        let store = SessionStore::new();
        store.get_or_create("CA1");
        store
            .update("CA1", |s| {
                s.set_outcome(Outcome::Resolved);
            })
            .unwrap();

        let snapshot = store
            .update("CA1", |s| {
                s.state = CallState::Greeting;
                s.pending_query = Some("should not land".to_string());
            })
            .unwrap();
        assert_eq!(snapshot.state, CallState::Ended);
        assert!(snapshot.pending_query.is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let store = SessionStore::new();
        store.get_or_create("CA1");
        assert!(store.remove("CA1").is_some());
        assert!(store.remove("CA1").is_none());
    }

    #[test]
    fn evict_idle_marks_abandoned() {
        let store = SessionStore::new();
        store.get_or_create("CA1");
        let evicted = store.evict_idle(Duration::ZERO);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].outcome(), Some(Outcome::Abandoned));
        assert!(store.is_empty());
    }

    #[test]
    fn evict_idle_keeps_active_sessions() {
        let store = SessionStore::new();
        store.get_or_create("CA1");
        let evicted = store.evict_idle(Duration::from_secs(3600));
        assert!(evicted.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn evict_measures_last_activity_not_creation() {
        let store = SessionStore::new();
        store.get_or_create("CA1");
        let past = Utc::now() - chrono::Duration::seconds(600);
        store
            .with_session("CA1", |s| {
                s.created_at = past;
                s.last_activity_at = past;
            })
            .unwrap();
        store.with_session("CA1", |s| s.touch()).unwrap();

        // An old call the caller is still talking on stays alive.
        assert!(store.evict_idle(Duration::from_secs(90)).is_empty());
        assert_eq!(store.len(), 1);
    }
}
