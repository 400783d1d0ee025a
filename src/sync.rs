//! Pull, push, and the optimistic mutation facade.
//!
//! Sync policy is server-authoritative: a full pull replaces each local
//! collection with the remote rows, including replacing with empty when the
//! backend returns zero rows. Only a failed fetch retains local data. Push
//! is a blunt whole-state upsert and stays gated behind the configured
//! policy, because running it against a stale cache clobbers newer rows on
//! the server.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::{SyncError, SyncResult};
use crate::gateway::{RemoteGateway, Table};
use crate::session::SessionHandle;
use crate::store::Store;
use crate::types::{
    CalendarEvent, EventPatch, Goal, GoalPatch, Message, NewEvent, NewGoal, Role,
};
use crate::wire;
use crate::wire::{DateEntryRow, EventRow, GoalRow, ScoreRow, SettingsRow};
use crate::writes::{WriteOp, WriteOutcome, WriteQueue};

pub type SharedStore = Arc<Mutex<Store>>;

/// Who wins on first login. `RemoteWins` (the default) pulls only and
/// refuses push; `LocalWins` pushes local state up before pulling, for the
/// offline-edits-then-first-login case.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    #[default]
    RemoteWins,
    LocalWins,
}

impl SyncPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPolicy::RemoteWins => "remote_wins",
            SyncPolicy::LocalWins => "local_wins",
        }
    }
}

/// What a pull actually did. Pull never errors to the caller; partial
/// failure shows up here and in the log.
#[derive(Debug, Default)]
pub struct PullReport {
    pub applied: Vec<Table>,
    pub failed: Vec<(Table, String)>,
    /// The session changed while the fetch was in flight and the whole
    /// result was thrown away.
    pub discarded: bool,
}

#[derive(Debug, Default)]
pub struct PushReport {
    pub rows: usize,
}

pub struct SyncEngine {
    store: SharedStore,
    gateway: Arc<dyn RemoteGateway>,
    session: SessionHandle,
    policy: SyncPolicy,
    writes: WriteQueue,
}

impl SyncEngine {
    pub fn new(
        store: SharedStore,
        gateway: Arc<dyn RemoteGateway>,
        session: SessionHandle,
        policy: SyncPolicy,
    ) -> Self {
        let writes = WriteQueue::new(Arc::clone(&gateway));
        Self {
            store,
            gateway,
            session,
            policy,
            writes,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn take_write_outcomes(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<WriteOutcome>> {
        self.writes.take_outcomes()
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.pending()
    }

    /// Full resynchronization, remote replacing local table by table.
    ///
    /// Each table fetch is independent: one failing does not stop the
    /// others, and a failed table keeps its local data. All fetches happen
    /// before the store lock is taken, and the result is dropped wholesale
    /// if the session moved underneath the fetch.
    pub fn pull(&self) -> PullReport {
        let mut report = PullReport::default();
        let Some((user_id, generation)) = self.session.snapshot() else {
            tracing::debug!("pull skipped, no active session");
            return report;
        };

        let mut fetched: Vec<(Table, Vec<Value>)> = Vec::new();
        for table in Table::ALL {
            match self.gateway.select(table, &user_id) {
                Ok(rows) => fetched.push((table, rows)),
                Err(e) => {
                    tracing::warn!(table = %table, user = %user_id, "pull fetch failed: {e}");
                    report.failed.push((table, e.to_string()));
                }
            }
        }

        if !self.session.is_current(generation) {
            tracing::info!(user = %user_id, "session changed during pull, discarding result");
            report.discarded = true;
            return report;
        }

        let mut store = self.store.lock().unwrap();
        for (table, rows) in fetched {
            match table {
                Table::Goals => {
                    let goals: Vec<Goal> = rows
                        .iter()
                        .filter_map(GoalRow::from_value)
                        .map(|row| {
                            let known = store.goal(&row.id).map(|g| g.default_duration);
                            row.into_goal(known)
                        })
                        .collect();
                    store.replace_goals(goals);
                }
                Table::Events => {
                    let events: Vec<CalendarEvent> = rows
                        .iter()
                        .filter_map(EventRow::from_value)
                        .map(EventRow::into_event)
                        .collect();
                    store.replace_events(events);
                }
                Table::UserSettings => {
                    let objective = rows
                        .first()
                        .and_then(SettingsRow::from_value)
                        .map(SettingsRow::into_objective)
                        .unwrap_or_default();
                    store.replace_objective(objective);
                }
                Table::JournalEntries => {
                    store.replace_journal(date_entry_map(&rows));
                }
                Table::MemoEntries => {
                    store.replace_memos(date_entry_map(&rows));
                }
                Table::DailyScores => {
                    let scores: BTreeMap<String, u8> = rows
                        .iter()
                        .filter_map(ScoreRow::from_value)
                        .map(|row| {
                            let score = row.score_u8();
                            (row.date, score)
                        })
                        .collect();
                    store.replace_scores(scores);
                }
            }
            report.applied.push(table);
        }
        report
    }

    pub async fn pull_async(self: &Arc<Self>) -> PullReport {
        let engine = Arc::clone(self);
        match tokio::task::spawn_blocking(move || engine.pull()).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("pull task failed: {e}");
                PullReport::default()
            }
        }
    }

    /// Upsert every local row to the backend. Whole-state overwrite, only
    /// safe when local data is known newer than remote, so it is refused
    /// unless the policy says local wins.
    pub fn push(&self) -> SyncResult<PushReport> {
        if self.policy != SyncPolicy::LocalWins {
            return Err(SyncError::PushDisabled);
        }
        let Some((user_id, _)) = self.session.snapshot() else {
            return Err(SyncError::NoSession);
        };

        let snapshot = self.store.lock().unwrap().snapshot();
        let mut report = PushReport::default();

        for goal in snapshot.goals.values() {
            self.gateway.upsert(
                Table::Goals,
                Table::Goals.conflict_target(),
                wire::goal_row(goal, &user_id),
            )?;
            report.rows += 1;
        }
        for event in snapshot.events.values() {
            self.gateway.upsert(
                Table::Events,
                Table::Events.conflict_target(),
                wire::event_row(event, &user_id),
            )?;
            report.rows += 1;
        }
        self.gateway.upsert(
            Table::UserSettings,
            Table::UserSettings.conflict_target(),
            wire::settings_row(&snapshot.objective, &user_id),
        )?;
        report.rows += 1;
        for (date, content) in &snapshot.journal {
            self.gateway.upsert(
                Table::JournalEntries,
                Table::JournalEntries.conflict_target(),
                wire::date_entry_row(&user_id, date, content),
            )?;
            report.rows += 1;
        }
        for (date, content) in &snapshot.memos {
            self.gateway.upsert(
                Table::MemoEntries,
                Table::MemoEntries.conflict_target(),
                wire::date_entry_row(&user_id, date, content),
            )?;
            report.rows += 1;
        }
        for (date, score) in &snapshot.scores {
            self.gateway.upsert(
                Table::DailyScores,
                Table::DailyScores.conflict_target(),
                wire::score_row_value(&user_id, date, *score),
            )?;
            report.rows += 1;
        }
        Ok(report)
    }

    /// Session-start bootstrap, ordered by policy. Pull always runs; under
    /// `LocalWins` the local state is pushed up first.
    pub fn initial_sync(&self) -> PullReport {
        if self.policy == SyncPolicy::LocalWins {
            match self.push() {
                Ok(report) => tracing::info!(rows = report.rows, "pushed local state"),
                Err(e) => tracing::warn!("initial push failed: {e}"),
            }
        }
        self.pull()
    }

    pub async fn initial_sync_async(self: &Arc<Self>) -> PullReport {
        let engine = Arc::clone(self);
        match tokio::task::spawn_blocking(move || engine.initial_sync()).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("initial sync task failed: {e}");
                PullReport::default()
            }
        }
    }

    // Optimistic mutation facade. Each call commits the local mutation
    // synchronously (memory + mirror) and then fires the remote write
    // without waiting on it. Signed out, the mutation is local-only.

    fn remote_write(&self, op: WriteOp) {
        if self.session.user().is_some() {
            self.writes.enqueue(op);
        }
    }

    pub fn add_goal(&self, new: NewGoal) -> Goal {
        let goal = Goal {
            id: Ulid::new().to_string(),
            title: new.title,
            color: new.color,
            icon: new.icon,
            default_duration: new.default_duration,
            description: new.description,
            deadline: new.deadline,
            created_at: Utc::now().to_rfc3339(),
        };
        self.store.lock().unwrap().upsert_goal(goal.clone());
        if let Some(user_id) = self.session.user() {
            self.remote_write(WriteOp::Insert {
                table: Table::Goals,
                id: goal.id.clone(),
                row: wire::goal_row(&goal, &user_id),
            });
        }
        goal
    }

    pub fn update_goal(&self, id: &str, patch: GoalPatch) {
        self.store.lock().unwrap().update_goal(id, patch.clone());
        let value = wire::goal_patch_value(&patch);
        if value.as_object().is_some_and(|o| !o.is_empty()) {
            self.remote_write(WriteOp::Update {
                table: Table::Goals,
                id: id.to_string(),
                patch: value,
            });
        }
    }

    pub fn delete_goal(&self, id: &str) {
        self.store.lock().unwrap().remove_goal(id);
        self.remote_write(WriteOp::Delete {
            table: Table::Goals,
            id: id.to_string(),
        });
    }

    pub fn schedule_event(&self, new: NewEvent) -> CalendarEvent {
        let event = CalendarEvent {
            id: Ulid::new().to_string(),
            title: new.title,
            start_time: new.start_time,
            end_time: new.end_time,
            goal_id: new.goal_id,
            completed_duration: 0,
        };
        self.store.lock().unwrap().upsert_event(event.clone());
        if let Some(user_id) = self.session.user() {
            self.remote_write(WriteOp::Insert {
                table: Table::Events,
                id: event.id.clone(),
                row: wire::event_row(&event, &user_id),
            });
        }
        event
    }

    pub fn update_event(&self, id: &str, patch: EventPatch) {
        self.store.lock().unwrap().update_event(id, patch.clone());
        let value = wire::event_patch_value(&patch);
        if value.as_object().is_some_and(|o| !o.is_empty()) {
            self.remote_write(WriteOp::Update {
                table: Table::Events,
                id: id.to_string(),
                patch: value,
            });
        }
    }

    pub fn set_event_progress(&self, id: &str, minutes: u32) {
        self.store.lock().unwrap().set_progress(id, minutes);
        self.remote_write(WriteOp::Update {
            table: Table::Events,
            id: id.to_string(),
            patch: wire::progress_patch_value(minutes),
        });
    }

    pub fn delete_event(&self, id: &str) {
        self.store.lock().unwrap().remove_event(id);
        self.remote_write(WriteOp::Delete {
            table: Table::Events,
            id: id.to_string(),
        });
    }

    pub fn set_main_goal(&self, goal: &str) {
        self.store.lock().unwrap().set_main_goal(goal);
        if let Some(user_id) = self.session.user() {
            self.remote_write(WriteOp::Upsert {
                table: Table::UserSettings,
                id: user_id.clone(),
                row: serde_json::json!({ "user_id": user_id, "main_goal": goal }),
            });
        }
    }

    pub fn set_main_goal_deadline(&self, date: Option<String>) {
        self.store.lock().unwrap().set_main_goal_deadline(date.clone());
        if let Some(user_id) = self.session.user() {
            self.remote_write(WriteOp::Upsert {
                table: Table::UserSettings,
                id: user_id.clone(),
                row: serde_json::json!({ "user_id": user_id, "main_goal_deadline": date }),
            });
        }
    }

    pub fn set_main_goal_start_date(&self, date: Option<String>) {
        self.store
            .lock()
            .unwrap()
            .set_main_goal_start_date(date.clone());
        if let Some(user_id) = self.session.user() {
            self.remote_write(WriteOp::Upsert {
                table: Table::UserSettings,
                id: user_id.clone(),
                row: serde_json::json!({ "user_id": user_id, "main_goal_start_date": date }),
            });
        }
    }

    pub fn set_journal_entry(&self, date: &str, content: &str) {
        self.store.lock().unwrap().set_journal_entry(date, content);
        if let Some(user_id) = self.session.user() {
            self.remote_write(WriteOp::Upsert {
                table: Table::JournalEntries,
                id: date.to_string(),
                row: wire::date_entry_row(&user_id, date, content),
            });
        }
    }

    pub fn set_memo_entry(&self, date: &str, content: &str) {
        self.store.lock().unwrap().set_memo_entry(date, content);
        if let Some(user_id) = self.session.user() {
            self.remote_write(WriteOp::Upsert {
                table: Table::MemoEntries,
                id: date.to_string(),
                row: wire::date_entry_row(&user_id, date, content),
            });
        }
    }

    pub fn set_daily_score(&self, date: &str, score: u8) {
        let clamped = score.min(10);
        self.store.lock().unwrap().set_daily_score(date, clamped);
        if let Some(user_id) = self.session.user() {
            self.remote_write(WriteOp::Upsert {
                table: Table::DailyScores,
                id: date.to_string(),
                row: wire::score_row_value(&user_id, date, clamped),
            });
        }
    }

    /// Chat stays local: append to the mirror, never to the backend.
    pub fn add_chat_message(&self, role: Role, content: &str) -> Message {
        self.store.lock().unwrap().add_message(role, content)
    }
}

fn date_entry_map(rows: &[Value]) -> BTreeMap<String, String> {
    rows.iter()
        .filter_map(DateEntryRow::from_value)
        .map(|row| (row.date, row.content.unwrap_or_default()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use serde_json::json;

    fn engine_with(
        gateway: Arc<MockGateway>,
        policy: SyncPolicy,
    ) -> (tempfile::TempDir, Arc<SyncEngine>) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::new(dir.path().join("mirror.json"));
        store.initialize().unwrap();
        let store = Arc::new(Mutex::new(store));
        let session = SessionHandle::new();
        let engine = Arc::new(SyncEngine::new(store, gateway, session, policy));
        (dir, engine)
    }

    fn goal_row_json(id: &str, user: &str, title: &str, duration: i64) -> Value {
        json!({
            "id": id,
            "user_id": user,
            "title": title,
            "color": "bg-red-500",
            "default_duration": duration,
            "created_at": "2026-01-01T00:00:00+00:00",
        })
    }

    fn event_row_json(id: &str, user: &str, goal_id: Option<&str>, done: i64) -> Value {
        json!({
            "id": id,
            "user_id": user,
            "title": "session",
            "start_time": "2026-03-01T20:00:00+00:00",
            "end_time": "2026-03-01T21:00:00+00:00",
            "goal_id": goal_id,
            "completed_duration": done,
        })
    }

    #[test]
    fn pull_replaces_local_collections_with_remote_rows() {
        let gateway = Arc::new(MockGateway::new());
        gateway.seed(Table::Goals, vec![goal_row_json("g1", "u1", "Read", 60)]);
        gateway.seed(Table::Events, vec![event_row_json("e1", "u1", Some("g1"), 30)]);
        gateway.seed(
            Table::JournalEntries,
            vec![json!({ "user_id": "u1", "date": "2026-03-01", "content": "good day" })],
        );
        gateway.seed(
            Table::DailyScores,
            vec![json!({ "user_id": "u1", "date": "2026-03-01", "score": 8 })],
        );
        let (_dir, engine) = engine_with(gateway, SyncPolicy::RemoteWins);
        engine.session().set_user("u1");

        // Stale local row that the pull must wipe out.
        engine.store().lock().unwrap().upsert_goal(Goal {
            id: "stale".to_string(),
            title: "Old".to_string(),
            color: String::new(),
            icon: None,
            default_duration: 5,
            description: None,
            deadline: None,
            created_at: String::new(),
        });

        let report = engine.pull();
        assert_eq!(report.applied.len(), 6);
        assert!(report.failed.is_empty());
        assert!(!report.discarded);

        let store = engine.store().lock().unwrap();
        assert!(store.goal("stale").is_none());
        assert_eq!(store.goal("g1").unwrap().default_duration, 60);
        assert_eq!(store.event("e1").unwrap().completed_duration, 30);
        assert_eq!(store.journal_entry("2026-03-01"), "good day");
        assert_eq!(store.daily_score("2026-03-01"), Some(8));
    }

    #[test]
    fn pull_twice_with_identical_remote_data_is_idempotent() {
        let gateway = Arc::new(MockGateway::new());
        gateway.seed(Table::Goals, vec![goal_row_json("g1", "u1", "Read", 60)]);
        gateway.seed(Table::Events, vec![event_row_json("e1", "u1", Some("g1"), 30)]);
        let (_dir, engine) = engine_with(gateway, SyncPolicy::RemoteWins);
        engine.session().set_user("u1");

        engine.pull();
        let first = engine.store().lock().unwrap().snapshot();
        engine.pull();
        let second = engine.store().lock().unwrap().snapshot();

        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn pull_with_zero_rows_replaces_with_empty() {
        let gateway = Arc::new(MockGateway::new());
        let (_dir, engine) = engine_with(gateway, SyncPolicy::RemoteWins);
        engine.session().set_user("u1");
        engine.store().lock().unwrap().set_journal_entry("2026-03-01", "local only");

        let report = engine.pull();
        assert_eq!(report.applied.len(), 6);
        assert_eq!(engine.store().lock().unwrap().journal_entry("2026-03-01"), "");
    }

    #[test]
    fn failed_table_retains_local_while_others_apply() {
        let gateway = Arc::new(MockGateway::new());
        gateway.seed(Table::Events, vec![event_row_json("e1", "u1", None, 10)]);
        gateway.fail_table(Table::Goals);
        let (_dir, engine) = engine_with(gateway, SyncPolicy::RemoteWins);
        engine.session().set_user("u1");

        engine.store().lock().unwrap().upsert_goal(Goal {
            id: "local".to_string(),
            title: "Keep me".to_string(),
            color: String::new(),
            icon: None,
            default_duration: 45,
            description: None,
            deadline: None,
            created_at: String::new(),
        });

        let report = engine.pull();
        assert!(report.failed.iter().any(|(t, _)| *t == Table::Goals));
        assert!(report.applied.contains(&Table::Events));

        let store = engine.store().lock().unwrap();
        assert_eq!(store.goal("local").unwrap().title, "Keep me");
        assert!(store.event("e1").is_some());
    }

    #[test]
    fn pull_falls_back_to_known_duration_when_column_is_absent() {
        let gateway = Arc::new(MockGateway::new());
        // Row predating the duration migration: no default_duration key.
        gateway.seed(
            Table::Goals,
            vec![json!({ "id": "g1", "user_id": "u1", "title": "Read" })],
        );
        let (_dir, engine) = engine_with(gateway, SyncPolicy::RemoteWins);
        engine.session().set_user("u1");

        engine.store().lock().unwrap().upsert_goal(Goal {
            id: "g1".to_string(),
            title: "Read".to_string(),
            color: String::new(),
            icon: None,
            default_duration: 75,
            description: None,
            deadline: None,
            created_at: String::new(),
        });

        engine.pull();
        assert_eq!(engine.store().lock().unwrap().goal("g1").unwrap().default_duration, 75);
    }

    #[test]
    fn pull_discards_result_when_session_changes_mid_flight() {
        let gateway = Arc::new(MockGateway::new());
        gateway.seed(Table::Goals, vec![goal_row_json("g1", "u1", "Read", 60)]);
        let (_dir, engine) = engine_with(Arc::clone(&gateway), SyncPolicy::RemoteWins);
        engine.session().set_user("u1");

        let session = engine.session().clone();
        gateway.set_select_hook(move |table| {
            if table == Table::DailyScores {
                session.clear();
            }
        });

        let report = engine.pull();
        assert!(report.discarded);
        assert!(engine.store().lock().unwrap().goal("g1").is_none());
    }

    #[test]
    fn push_is_refused_under_remote_wins() {
        let gateway = Arc::new(MockGateway::new());
        let (_dir, engine) = engine_with(Arc::clone(&gateway), SyncPolicy::RemoteWins);
        engine.session().set_user("u1");
        assert!(matches!(engine.push(), Err(SyncError::PushDisabled)));
        assert_eq!(gateway.call_count(), 0);
    }

    #[test]
    fn local_wins_pushes_before_pulling() {
        let gateway = Arc::new(MockGateway::new());
        let (_dir, engine) = engine_with(Arc::clone(&gateway), SyncPolicy::LocalWins);
        engine.session().set_user("u1");
        engine.store().lock().unwrap().set_daily_score("2026-03-01", 6);

        let report = engine.initial_sync();
        assert_eq!(report.applied.len(), 6);

        let calls = gateway.calls();
        let first_select = calls.iter().position(|c| c.starts_with("select")).unwrap();
        let last_upsert = calls.iter().rposition(|c| c.starts_with("upsert")).unwrap();
        assert!(last_upsert < first_select, "push must precede pull: {calls:?}");

        // The pushed score survives the subsequent pull.
        assert_eq!(engine.store().lock().unwrap().daily_score("2026-03-01"), Some(6));
    }

    #[tokio::test]
    async fn mutations_apply_locally_and_issue_remote_writes() {
        let gateway = Arc::new(MockGateway::new());
        let (_dir, engine) = engine_with(Arc::clone(&gateway), SyncPolicy::RemoteWins);
        engine.session().set_user("u1");
        let mut outcomes = engine.take_write_outcomes().unwrap();

        let goal = engine.add_goal(NewGoal {
            title: "Read".to_string(),
            color: "bg-blue-500".to_string(),
            icon: None,
            default_duration: 60,
            description: None,
            deadline: None,
        });
        assert!(engine.store().lock().unwrap().goal(&goal.id).is_some());

        let outcome = outcomes.recv().await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(gateway.table_rows(Table::Goals).len(), 1);

        let event = engine.schedule_event(NewEvent {
            title: "evening read".to_string(),
            start_time: "2026-03-01T20:00:00+00:00".to_string(),
            end_time: "2026-03-01T21:00:00+00:00".to_string(),
            goal_id: Some(goal.id.clone()),
        });
        outcomes.recv().await.unwrap();
        engine.set_event_progress(&event.id, 60);
        outcomes.recv().await.unwrap();

        assert_eq!(engine.store().lock().unwrap().goal_progress(&goal.id), 100);
        let date = chrono::NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(engine.store().lock().unwrap().day_progress(date), 100);
    }

    #[tokio::test]
    async fn remote_write_failure_keeps_local_mutation() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_table(Table::Goals);
        let (_dir, engine) = engine_with(gateway, SyncPolicy::RemoteWins);
        engine.session().set_user("u1");
        let mut outcomes = engine.take_write_outcomes().unwrap();

        let goal = engine.add_goal(NewGoal {
            title: "Read".to_string(),
            color: "bg-blue-500".to_string(),
            icon: None,
            default_duration: 60,
            description: None,
            deadline: None,
        });

        let outcome = outcomes.recv().await.unwrap();
        assert!(!outcome.succeeded());
        assert!(engine.store().lock().unwrap().goal(&goal.id).is_some());
    }

    #[test]
    fn mutations_while_signed_out_stay_local() {
        let gateway = Arc::new(MockGateway::new());
        let (_dir, engine) = engine_with(Arc::clone(&gateway), SyncPolicy::RemoteWins);

        engine.set_journal_entry("2026-03-01", "offline note");
        assert_eq!(engine.store().lock().unwrap().journal_entry("2026-03-01"), "offline note");
        assert_eq!(gateway.call_count(), 0);
    }
}
