//! Keeps the local store converged with the backend between full pulls.
//!
//! Two independent paths: a websocket change feed (latency optimization)
//! and a fixed-interval watchdog pull (correctness backstop). Either one
//! alone is sufficient for eventual convergence; both end in idempotent
//! replace operations, so interleaving is safe and the last write to
//! complete wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::gateway::{RemoteGateway, Table};
use crate::session::SessionHandle;
use crate::sync::{SharedStore, SyncEngine};
use crate::wire::{DateEntryRow, EventRow, GoalRow, ScoreRow, SettingsRow};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change notification as it appears on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    #[serde(rename = "event")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub new_row: Option<Value>,
    #[serde(default)]
    pub old_row: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Subscribed,
}

pub struct Reconciler {
    store: SharedStore,
    gateway: Arc<dyn RemoteGateway>,
    session: SessionHandle,
    realtime_url: Option<String>,
    poll_interval: Duration,
    subscribed: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
    status_tx: watch::Sender<ChannelStatus>,
    status_rx: watch::Receiver<ChannelStatus>,
}

impl Reconciler {
    pub fn new(
        store: SharedStore,
        gateway: Arc<dyn RemoteGateway>,
        session: SessionHandle,
        realtime_url: Option<String>,
        poll_interval: Duration,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Disconnected);
        Self {
            store,
            gateway,
            session,
            realtime_url,
            poll_interval,
            subscribed: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            status_tx,
            status_rx,
        }
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status_rx.borrow()
    }

    pub fn status_rx(&self) -> watch::Receiver<ChannelStatus> {
        self.status_rx.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: ChannelStatus) {
        let _ = self.status_tx.send(status);
    }

    /// Start the change-feed reader and the watchdog. Idempotent: while a
    /// subscription is live, further calls return `false` and change
    /// nothing, so the channel can never be doubled up.
    pub fn subscribe(self: &Arc<Self>, engine: Arc<SyncEngine>) -> bool {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap() = Some(token.clone());

        let this = Arc::clone(self);
        let watchdog_token = token.clone();
        tokio::spawn(async move {
            this.run_watchdog(engine, watchdog_token).await;
        });

        if let Some(url) = self.realtime_url.clone() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_channel(url, token).await;
            });
        }
        true
    }

    /// Tear down the channel and the watchdog. Safe to call at any time,
    /// subscribed or not.
    pub fn unsubscribe(&self) {
        self.subscribed.store(false, Ordering::SeqCst);
        if let Some(token) = self.shutdown.lock().unwrap().take() {
            token.cancel();
        }
        self.set_status(ChannelStatus::Disconnected);
    }

    /// Poll-based safety net: a full pull on a short fixed interval for as
    /// long as a session is active, so a silently stalled push channel
    /// cannot stop convergence.
    async fn run_watchdog(&self, engine: Arc<SyncEngine>, token: CancellationToken) {
        let start = tokio::time::Instant::now() + self.poll_interval;
        let mut ticker = tokio::time::interval_at(start, self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if self.session.user().is_none() {
                        continue;
                    }
                    let report = engine.pull_async().await;
                    if !report.failed.is_empty() {
                        tracing::debug!(failed = report.failed.len(), "watchdog pull partially failed");
                    }
                }
            }
        }
    }

    async fn run_channel(self: Arc<Self>, url: String, token: CancellationToken) {
        self.set_status(ChannelStatus::Connecting);
        let (stream, _) = match connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                tracing::warn!(url = %url, "realtime connect failed: {e}");
                self.set_status(ChannelStatus::Disconnected);
                return;
            }
        };
        self.set_status(ChannelStatus::Subscribed);
        tracing::info!(url = %url, "realtime channel subscribed");

        let (_write, mut read) = stream.split();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<ChangeEvent>(text.as_str()) {
                                Ok(event) => {
                                    let this = Arc::clone(&self);
                                    let join = tokio::task::spawn_blocking(move || this.apply(&event)).await;
                                    if let Err(e) = join {
                                        tracing::warn!("reconcile task failed: {e}");
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!("ignoring undecodable realtime frame: {e}");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            tracing::info!("realtime channel closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("realtime channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }
        self.set_status(ChannelStatus::Disconnected);
    }

    /// Merge one change notification into the local store.
    ///
    /// Duplicate inserts and deletes of already-absent rows are no-ops:
    /// the feed may deliver a change the watchdog already pulled in, or
    /// echo back this client's own write.
    pub fn apply(&self, event: &ChangeEvent) {
        match event.table {
            Table::Goals => self.apply_goal(event),
            Table::Events => self.apply_event(event),
            Table::UserSettings => self.apply_settings(event),
            Table::JournalEntries | Table::MemoEntries | Table::DailyScores => {
                self.apply_date_keyed(event)
            }
        }
    }

    fn apply_goal(&self, event: &ChangeEvent) {
        if event.kind == ChangeKind::Delete {
            if let Some(id) = row_id(event.old_row.as_ref()) {
                self.store.lock().unwrap().remove_goal(&id);
            }
            return;
        }
        let Some(id) = row_id(event.new_row.as_ref()) else {
            return;
        };
        if event.kind == ChangeKind::Insert && self.store.lock().unwrap().goal(&id).is_some() {
            return;
        }

        // Never trust the goal payload's field set: the feed can lag the
        // schema and drop newly added columns. Re-fetch the row, and keep
        // the known duration if even the re-fetch lacks that column.
        match self.gateway.fetch_row(Table::Goals, &id) {
            Ok(Some(value)) => {
                if let Some(row) = GoalRow::from_value(&value) {
                    let mut store = self.store.lock().unwrap();
                    let known = store.goal(&id).map(|g| g.default_duration);
                    store.upsert_goal(row.into_goal(known));
                }
            }
            Ok(None) => {
                tracing::debug!(id = %id, "goal vanished before re-fetch, skipping");
            }
            Err(e) => {
                tracing::warn!(id = %id, "goal re-fetch failed: {e}");
            }
        }
    }

    fn apply_event(&self, event: &ChangeEvent) {
        match event.kind {
            ChangeKind::Delete => {
                if let Some(id) = row_id(event.old_row.as_ref()) {
                    self.store.lock().unwrap().remove_event(&id);
                }
            }
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(row) = event.new_row.as_ref().and_then(EventRow::from_value) else {
                    return;
                };
                let mut store = self.store.lock().unwrap();
                if event.kind == ChangeKind::Insert && store.event(&row.id).is_some() {
                    return;
                }
                store.upsert_event(row.into_event());
            }
        }
    }

    fn apply_settings(&self, event: &ChangeEvent) {
        match event.kind {
            ChangeKind::Delete => {
                self.store.lock().unwrap().replace_objective(Default::default());
            }
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(row) = event.new_row.as_ref().and_then(SettingsRow::from_value) else {
                    return;
                };
                if !self.row_belongs_to_session(row.user_id.as_deref()) {
                    return;
                }
                self.store.lock().unwrap().replace_objective(row.into_objective());
            }
        }
    }

    fn apply_date_keyed(&self, event: &ChangeEvent) {
        // These feeds are not filtered server-side by user; drop anything
        // that does not belong to the active session.
        let row = match event.kind {
            ChangeKind::Delete => event.old_row.as_ref(),
            _ => event.new_row.as_ref(),
        };
        let Some(row) = row else { return };
        let owner = row.get("user_id").and_then(Value::as_str);
        if !self.row_belongs_to_session(owner) {
            tracing::debug!(table = %event.table, "dropping change for foreign user");
            return;
        }

        let mut store = self.store.lock().unwrap();
        match (event.table, event.kind) {
            (Table::JournalEntries, ChangeKind::Delete) => {
                if let Some(entry) = DateEntryRow::from_value(row) {
                    store.remove_journal_entry(&entry.date);
                }
            }
            (Table::JournalEntries, _) => {
                if let Some(entry) = DateEntryRow::from_value(row) {
                    store.set_journal_entry(&entry.date, &entry.content.unwrap_or_default());
                }
            }
            (Table::MemoEntries, ChangeKind::Delete) => {
                if let Some(entry) = DateEntryRow::from_value(row) {
                    store.remove_memo_entry(&entry.date);
                }
            }
            (Table::MemoEntries, _) => {
                if let Some(entry) = DateEntryRow::from_value(row) {
                    store.set_memo_entry(&entry.date, &entry.content.unwrap_or_default());
                }
            }
            (Table::DailyScores, ChangeKind::Delete) => {
                if let Some(score) = ScoreRow::from_value(row) {
                    store.remove_daily_score(&score.date);
                }
            }
            (Table::DailyScores, _) => {
                if let Some(score) = ScoreRow::from_value(row) {
                    store.set_daily_score(&score.date, score.score_u8());
                }
            }
            _ => {}
        }
    }

    fn row_belongs_to_session(&self, owner: Option<&str>) -> bool {
        match (owner, self.session.user()) {
            (Some(owner), Some(current)) => owner == current,
            _ => false,
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        if let Some(token) = self.shutdown.lock().unwrap().take() {
            token.cancel();
        }
    }
}

fn row_id(row: Option<&Value>) -> Option<String> {
    row.and_then(|r| r.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
