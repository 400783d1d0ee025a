//! Session identity and the auth-event glue.
//!
//! `SessionHandle` is the one place the current user id lives. Every
//! transition bumps a generation counter; any async completion that
//! captured an older generation discards its result instead of applying
//! stale data to a session that no longer exists.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::realtime::Reconciler;
use crate::sync::SyncEngine;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEventKind {
    SignedIn,
    SessionFound,
    SignedOut,
}

#[derive(Clone, Debug)]
pub struct AuthEvent {
    pub kind: SessionEventKind,
    pub user_id: Option<String>,
}

#[derive(Default)]
struct SessionInner {
    user: Mutex<Option<String>>,
    generation: AtomicU64,
}

#[derive(Clone, Default)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_user(&self, user_id: &str) -> u64 {
        let mut user = self.inner.user.lock().unwrap();
        *user = Some(user_id.to_string());
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn clear(&self) -> u64 {
        let mut user = self.inner.user.lock().unwrap();
        *user = None;
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn user(&self) -> Option<String> {
        self.inner.user.lock().unwrap().clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Current user and the generation it was observed at, or `None` when
    /// signed out. Capture this before starting async work and re-check
    /// the generation before applying the result.
    pub fn snapshot(&self) -> Option<(String, u64)> {
        let user = self.inner.user.lock().unwrap();
        user.as_ref()
            .map(|u| (u.clone(), self.inner.generation.load(Ordering::SeqCst)))
    }
}

/// Drives the sync lifecycle from auth-provider events: pull before
/// subscribe on sign-in, unsubscribe and clear on sign-out. The loop ends
/// when the event sender is dropped, tearing the subscription down with it.
pub struct SessionBinder {
    engine: Arc<SyncEngine>,
    reconciler: Arc<Reconciler>,
    events: mpsc::UnboundedReceiver<AuthEvent>,
}

impl SessionBinder {
    pub fn new(
        engine: Arc<SyncEngine>,
        reconciler: Arc<Reconciler>,
        events: mpsc::UnboundedReceiver<AuthEvent>,
    ) -> Self {
        Self {
            engine,
            reconciler,
            events,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event).await;
        }
        self.reconciler.unsubscribe();
    }

    async fn handle(&self, event: AuthEvent) {
        match event.kind {
            SessionEventKind::SignedIn | SessionEventKind::SessionFound => {
                let Some(user_id) = event.user_id else {
                    tracing::warn!("session event without a user id, ignoring");
                    return;
                };
                tracing::info!(user = %user_id, "session active, starting sync");
                {
                    let mut store = self.engine.store().lock().unwrap();
                    store.set_user(&user_id);
                }
                self.engine.session().set_user(&user_id);

                // Pull must complete before the realtime channel opens, so
                // a change notification is never mistaken for the dataset.
                let report = self.engine.initial_sync_async().await;
                tracing::info!(
                    user = %user_id,
                    applied = report.applied.len(),
                    failed = report.failed.len(),
                    "initial sync finished"
                );
                self.reconciler.subscribe(Arc::clone(&self.engine));
            }
            SessionEventKind::SignedOut => {
                tracing::info!("signed out, stopping sync");
                self.reconciler.unsubscribe();
                self.engine.session().clear();
                let mut store = self.engine.store().lock().unwrap();
                store.clear_user();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Table;
    use crate::gateway::mock::MockGateway;
    use crate::store::Store;
    use crate::sync::SyncPolicy;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn generation_moves_on_every_transition() {
        let session = SessionHandle::new();
        assert!(session.snapshot().is_none());

        let first = session.set_user("user-a");
        assert!(session.is_current(first));
        assert_eq!(session.snapshot(), Some(("user-a".to_string(), first)));

        let second = session.clear();
        assert!(second > first);
        assert!(!session.is_current(first));
        assert!(session.user().is_none());
    }

    #[tokio::test]
    async fn binder_drives_the_full_session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::new(dir.path().join("mirror.json"));
        store.initialize().unwrap();
        let store = Arc::new(Mutex::new(store));

        let gateway = Arc::new(MockGateway::new());
        gateway.seed(
            Table::Goals,
            vec![json!({ "id": "g1", "user_id": "u1", "title": "Read", "default_duration": 60 })],
        );

        let session = SessionHandle::new();
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            gateway.clone(),
            session.clone(),
            SyncPolicy::RemoteWins,
        ));
        let reconciler = Arc::new(Reconciler::new(
            store,
            gateway.clone(),
            session.clone(),
            None,
            Duration::from_millis(40),
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let binder = SessionBinder::new(Arc::clone(&engine), Arc::clone(&reconciler), rx);
        let handle = tokio::spawn(binder.run());

        tx.send(AuthEvent {
            kind: SessionEventKind::SessionFound,
            user_id: Some("u1".to_string()),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(session.user().as_deref(), Some("u1"));
        assert!(reconciler.is_subscribed());
        {
            let store = engine.store().lock().unwrap();
            assert_eq!(store.user_id().as_deref(), Some("u1"));
            assert_eq!(store.goal("g1").unwrap().title, "Read");
        }
        assert!(gateway.calls().iter().any(|c| c == "select goals u1"));

        tx.send(AuthEvent {
            kind: SessionEventKind::SignedOut,
            user_id: None,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(session.user().is_none());
        assert!(!reconciler.is_subscribed());
        assert!(engine.store().lock().unwrap().user_id().is_none());

        // No remote traffic after teardown: the watchdog is dead and no
        // call referencing the old user may appear.
        let settled = gateway.call_count();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(gateway.call_count(), settled);

        drop(tx);
        handle.await.unwrap();
    }
}
