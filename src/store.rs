use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use thiserror::Error;
use ulid::Ulid;

use crate::types::{
    CalendarEvent, EventPatch, Goal, GoalPatch, Message, Objective, Role, StoreData,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Single authoritative in-process state container.
///
/// Holds every domain entity plus a durable mirror on disk. Mutations are
/// synchronous and never await, so behind a mutex they are atomic with
/// respect to readers. The mirror is a cache: it is rewritten after every
/// mutation and always subordinate to a successful pull.
pub struct Store {
    mirror_path: PathBuf,
    data: StoreData,
}

impl Store {
    pub fn new(mirror_path: PathBuf) -> Self {
        Self {
            mirror_path,
            data: StoreData::default(),
        }
    }

    /// Load the mirror if one exists, otherwise write an empty snapshot.
    /// A mirror that fails to parse is abandoned (logged) rather than
    /// blocking startup; the next pull repopulates it.
    pub fn initialize(&mut self) -> Result<(), StoreError> {
        if let Some(parent) = self.mirror_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if self.mirror_path.exists() {
            let mut file = File::open(&self.mirror_path)?;
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            match serde_json::from_str(&contents) {
                Ok(data) => self.data = data,
                Err(e) => {
                    tracing::warn!(
                        path = %self.mirror_path.display(),
                        "local mirror is unreadable, starting empty: {e}"
                    );
                    self.data = StoreData::default();
                }
            }
        } else {
            self.save()?;
        }

        Ok(())
    }

    /// Persist the current snapshot synchronously using a temporary file
    /// and an atomic rename to avoid partial writes.
    pub fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.mirror_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp = self.mirror_path.with_extension("tmp");
        let mut f = File::create(&temp)?;
        let content = serde_json::to_string_pretty(&self.data)?;
        f.write_all(content.as_bytes())?;
        f.sync_all()?;
        fs::rename(temp, &self.mirror_path)?;
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!(path = %self.mirror_path.display(), "mirror write failed: {e}");
        }
    }

    // Session scoping

    pub fn user_id(&self) -> Option<String> {
        self.data.user_id.clone()
    }

    /// Bind the store to a user. Switching to a *different* user wipes all
    /// previously held data first so sessions never merge.
    pub fn set_user(&mut self, user_id: &str) {
        if self
            .data
            .user_id
            .as_deref()
            .is_some_and(|current| current != user_id)
        {
            self.data = StoreData::default();
        }
        self.data.user_id = Some(user_id.to_string());
        self.persist();
    }

    /// Drop the user binding but keep local data, so unsynced work survives
    /// a sign-out on a flaky network.
    pub fn clear_user(&mut self) {
        self.data.user_id = None;
        self.persist();
    }

    // Goals

    pub fn upsert_goal(&mut self, goal: Goal) {
        self.data.goals.insert(goal.id.clone(), goal);
        self.persist();
    }

    /// Merge the supplied fields into a goal. A title change cascades to the
    /// denormalized title of every event referencing the goal within this
    /// same call, so no reader can observe half of the rename. Unknown ids
    /// are a no-op (duplicate deletes and late updates are tolerated).
    pub fn update_goal(&mut self, id: &str, patch: GoalPatch) {
        let Some(goal) = self.data.goals.get_mut(id) else {
            return;
        };
        if let Some(title) = &patch.title {
            goal.title = title.clone();
        }
        if let Some(color) = patch.color {
            goal.color = color;
        }
        if let Some(icon) = patch.icon {
            goal.icon = icon;
        }
        if let Some(duration) = patch.default_duration {
            goal.default_duration = duration;
        }
        if let Some(description) = patch.description {
            goal.description = description;
        }
        if let Some(deadline) = patch.deadline {
            goal.deadline = deadline;
        }

        if let Some(title) = patch.title {
            for event in self.data.events.values_mut() {
                if event.goal_id.as_deref() == Some(id) {
                    event.title = title.clone();
                }
            }
        }
        self.persist();
    }

    /// Remove a goal. Events referencing it keep their (now dangling)
    /// `goal_id`; consumers treat that as an unlinked event.
    pub fn remove_goal(&mut self, id: &str) {
        if self.data.goals.remove(id).is_some() {
            self.persist();
        }
    }

    pub fn goal(&self, id: &str) -> Option<Goal> {
        self.data.goals.get(id).cloned()
    }

    pub fn goals(&self) -> Vec<Goal> {
        self.data.goals.values().cloned().collect()
    }

    // Events

    pub fn upsert_event(&mut self, event: CalendarEvent) {
        self.data.events.insert(event.id.clone(), event);
        self.persist();
    }

    pub fn update_event(&mut self, id: &str, patch: EventPatch) {
        let Some(event) = self.data.events.get_mut(id) else {
            return;
        };
        if let Some(title) = patch.title {
            event.title = title;
        }
        if let Some(start) = patch.start_time {
            event.start_time = start;
        }
        if let Some(end) = patch.end_time {
            event.end_time = end;
        }
        if let Some(goal_id) = patch.goal_id {
            event.goal_id = goal_id;
        }
        self.persist();
    }

    /// Set the completed minutes for an event. The store accepts any value;
    /// clamping against the scheduled window is a UI concern and the
    /// progress queries cap at 100% regardless.
    pub fn set_progress(&mut self, event_id: &str, minutes: u32) {
        let Some(event) = self.data.events.get_mut(event_id) else {
            return;
        };
        event.completed_duration = minutes;
        self.persist();
    }

    pub fn remove_event(&mut self, id: &str) {
        if self.data.events.remove(id).is_some() {
            self.persist();
        }
    }

    pub fn event(&self, id: &str) -> Option<CalendarEvent> {
        self.data.events.get(id).cloned()
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        self.data.events.values().cloned().collect()
    }

    pub fn day_events(&self, date: NaiveDate) -> Vec<CalendarEvent> {
        self.data
            .events
            .values()
            .filter(|e| starts_on(e, date))
            .cloned()
            .collect()
    }

    // Main objective

    pub fn objective(&self) -> Objective {
        self.data.objective.clone()
    }

    pub fn set_main_goal(&mut self, goal: &str) {
        self.data.objective.goal = Some(goal.to_string());
        self.persist();
    }

    pub fn set_main_goal_deadline(&mut self, date: Option<String>) {
        self.data.objective.deadline = date;
        self.persist();
    }

    pub fn set_main_goal_start_date(&mut self, date: Option<String>) {
        self.data.objective.start_date = date;
        self.persist();
    }

    // Date-keyed entries (one value per date per kind, overwrite on rewrite)

    pub fn set_journal_entry(&mut self, date: &str, content: &str) {
        self.data
            .journal
            .insert(date.to_string(), content.to_string());
        self.persist();
    }

    pub fn journal_entry(&self, date: &str) -> String {
        self.data.journal.get(date).cloned().unwrap_or_default()
    }

    pub fn set_memo_entry(&mut self, date: &str, content: &str) {
        self.data
            .memos
            .insert(date.to_string(), content.to_string());
        self.persist();
    }

    pub fn memo_entry(&self, date: &str) -> String {
        self.data.memos.get(date).cloned().unwrap_or_default()
    }

    pub fn set_daily_score(&mut self, date: &str, score: u8) {
        self.data.scores.insert(date.to_string(), score.min(10));
        self.persist();
    }

    pub fn daily_score(&self, date: &str) -> Option<u8> {
        self.data.scores.get(date).copied()
    }

    // Removals driven by remote delete notifications; absent keys are fine.

    pub fn remove_journal_entry(&mut self, date: &str) {
        if self.data.journal.remove(date).is_some() {
            self.persist();
        }
    }

    pub fn remove_memo_entry(&mut self, date: &str) {
        if self.data.memos.remove(date).is_some() {
            self.persist();
        }
    }

    pub fn remove_daily_score(&mut self, date: &str) {
        if self.data.scores.remove(date).is_some() {
            self.persist();
        }
    }

    // Chat (local-only, append-only)

    pub fn add_message(&mut self, role: Role, content: &str) -> Message {
        let msg = Message {
            id: Ulid::new().to_string(),
            role,
            content: content.to_string(),
        };
        self.data.messages.push(msg.clone());
        self.persist();
        msg
    }

    pub fn messages(&self) -> Vec<Message> {
        self.data.messages.clone()
    }

    /// Full copy of the current state, for push and for diagnostics.
    pub fn snapshot(&self) -> StoreData {
        self.data.clone()
    }

    // Replace operations used by pull. Each is one whole-collection
    // assignment so a reader sees either the old table or the new one.

    pub fn replace_goals(&mut self, goals: Vec<Goal>) {
        self.data.goals = goals.into_iter().map(|g| (g.id.clone(), g)).collect();
        self.persist();
    }

    pub fn replace_events(&mut self, events: Vec<CalendarEvent>) {
        self.data.events = events.into_iter().map(|e| (e.id.clone(), e)).collect();
        self.persist();
    }

    pub fn replace_objective(&mut self, objective: Objective) {
        self.data.objective = objective;
        self.persist();
    }

    pub fn replace_journal(&mut self, entries: BTreeMap<String, String>) {
        self.data.journal = entries;
        self.persist();
    }

    pub fn replace_memos(&mut self, entries: BTreeMap<String, String>) {
        self.data.memos = entries;
        self.persist();
    }

    pub fn replace_scores(&mut self, scores: BTreeMap<String, u8>) {
        self.data.scores = scores.into_iter().map(|(d, s)| (d, s.min(10))).collect();
        self.persist();
    }

    // Derived queries

    /// Percentage of goal-linked scheduled minutes completed on a day.
    /// Events with unparseable timestamps contribute nothing; a zero
    /// scheduled sum yields 0 rather than a division error.
    pub fn day_progress(&self, date: NaiveDate) -> u8 {
        let mut scheduled: i64 = 0;
        let mut completed: i64 = 0;
        for event in self.data.events.values() {
            if event.goal_id.is_none() || !starts_on(event, date) {
                continue;
            }
            let (Some(start), Some(end)) = (parse_instant(&event.start_time), parse_instant(&event.end_time)) else {
                continue;
            };
            scheduled += (end - start).num_minutes();
            completed += i64::from(event.completed_duration);
        }
        if scheduled <= 0 {
            return 0;
        }
        percentage(completed, scheduled)
    }

    /// Completed minutes across every event referencing the goal, against
    /// the goal's default duration. A missing goal or a zero duration
    /// yields 0.
    pub fn goal_progress(&self, goal_id: &str) -> u8 {
        let Some(goal) = self.data.goals.get(goal_id) else {
            return 0;
        };
        if goal.default_duration == 0 {
            return 0;
        }
        let completed: i64 = self
            .data
            .events
            .values()
            .filter(|e| e.goal_id.as_deref() == Some(goal_id))
            .map(|e| i64::from(e.completed_duration))
            .sum();
        percentage(completed, i64::from(goal.default_duration))
    }
}

fn percentage(completed: i64, total: i64) -> u8 {
    let pct = (completed as f64 / total as f64) * 100.0;
    pct.round().min(100.0).max(0.0) as u8
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn starts_on(event: &CalendarEvent, date: NaiveDate) -> bool {
    parse_instant(&event.start_time).is_some_and(|dt| dt.date_naive() == date)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::new(dir.path().join("mirror.json"));
        store.initialize().unwrap();
        (dir, store)
    }

    fn goal(id: &str, title: &str, duration: u32) -> Goal {
        Goal {
            id: id.to_string(),
            title: title.to_string(),
            color: "bg-blue-500".to_string(),
            icon: None,
            default_duration: duration,
            description: None,
            deadline: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    fn event(id: &str, goal_id: Option<&str>, start: &str, end: &str, done: u32) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            title: "session".to_string(),
            start_time: start.to_string(),
            end_time: end.to_string(),
            goal_id: goal_id.map(str::to_string),
            completed_duration: done,
        }
    }

    #[test]
    fn title_update_cascades_to_linked_events_only() {
        let (_dir, mut store) = temp_store();
        store.upsert_goal(goal("g1", "Read", 60));
        store.upsert_goal(goal("g2", "Run", 30));
        store.upsert_event(event(
            "e1",
            Some("g1"),
            "2026-03-01T09:00:00+00:00",
            "2026-03-01T10:00:00+00:00",
            0,
        ));
        store.upsert_event(event(
            "e2",
            Some("g1"),
            "2026-03-02T09:00:00+00:00",
            "2026-03-02T10:00:00+00:00",
            0,
        ));
        store.upsert_event(event(
            "e3",
            Some("g2"),
            "2026-03-01T11:00:00+00:00",
            "2026-03-01T12:00:00+00:00",
            0,
        ));

        store.update_goal(
            "g1",
            GoalPatch {
                title: Some("Read Books".to_string()),
                ..GoalPatch::default()
            },
        );

        assert_eq!(store.goal("g1").unwrap().title, "Read Books");
        assert_eq!(store.event("e1").unwrap().title, "Read Books");
        assert_eq!(store.event("e2").unwrap().title, "Read Books");
        assert_eq!(store.event("e3").unwrap().title, "session");
    }

    #[test]
    fn update_and_remove_of_unknown_ids_are_noops() {
        let (_dir, mut store) = temp_store();
        store.update_goal("missing", GoalPatch::default());
        store.remove_goal("missing");
        store.update_event("missing", EventPatch::default());
        store.remove_event("missing");
        store.set_progress("missing", 30);
        assert!(store.goals().is_empty());
        assert!(store.events().is_empty());
    }

    #[test]
    fn day_progress_without_goal_linked_events_is_zero() {
        let (_dir, mut store) = temp_store();
        store.upsert_event(event(
            "e1",
            None,
            "2026-03-01T09:00:00+00:00",
            "2026-03-01T10:00:00+00:00",
            45,
        ));
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(store.day_progress(date), 0);
    }

    #[test]
    fn day_progress_counts_completed_against_scheduled() {
        let (_dir, mut store) = temp_store();
        store.upsert_goal(goal("g1", "Read", 60));
        store.upsert_event(event(
            "e1",
            Some("g1"),
            "2026-03-01T09:00:00+00:00",
            "2026-03-01T10:00:00+00:00",
            30,
        ));
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(store.day_progress(date), 50);
    }

    #[test]
    fn progress_clamps_at_hundred_when_over_completed() {
        let (_dir, mut store) = temp_store();
        store.upsert_goal(goal("g1", "Read", 60));
        // Completed beyond the scheduled window is stored as given.
        store.upsert_event(event(
            "e1",
            Some("g1"),
            "2026-03-01T09:00:00+00:00",
            "2026-03-01T10:00:00+00:00",
            90,
        ));
        assert_eq!(store.event("e1").unwrap().completed_duration, 90);
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(store.day_progress(date), 100);
        assert_eq!(store.goal_progress("g1"), 100);
    }

    #[test]
    fn goal_progress_with_zero_duration_is_zero() {
        let (_dir, mut store) = temp_store();
        store.upsert_goal(goal("g1", "Read", 0));
        store.upsert_event(event(
            "e1",
            Some("g1"),
            "2026-03-01T09:00:00+00:00",
            "2026-03-01T10:00:00+00:00",
            120,
        ));
        assert_eq!(store.goal_progress("g1"), 0);
        assert_eq!(store.goal_progress("missing"), 0);
    }

    #[test]
    fn full_completion_reads_hundred_on_both_queries() {
        let (_dir, mut store) = temp_store();
        store.upsert_goal(goal("g1", "Read", 60));
        store.upsert_event(event(
            "e1",
            Some("g1"),
            "2026-03-01T20:00:00+00:00",
            "2026-03-01T21:00:00+00:00",
            60,
        ));
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(store.goal_progress("g1"), 100);
        assert_eq!(store.day_progress(date), 100);
    }

    #[test]
    fn deleting_a_goal_leaves_dependent_events_behind() {
        let (_dir, mut store) = temp_store();
        store.upsert_goal(goal("g1", "Read", 60));
        store.upsert_event(event(
            "e1",
            Some("g1"),
            "2026-03-01T09:00:00+00:00",
            "2026-03-01T10:00:00+00:00",
            10,
        ));
        store.remove_goal("g1");
        let orphan = store.event("e1").unwrap();
        assert_eq!(orphan.goal_id.as_deref(), Some("g1"));
        assert!(store.goal("g1").is_none());
    }

    #[test]
    fn date_keyed_entries_overwrite_per_date() {
        let (_dir, mut store) = temp_store();
        store.set_journal_entry("2026-03-01", "first draft");
        store.set_journal_entry("2026-03-01", "revised");
        store.set_memo_entry("2026-03-01", "call mom");
        store.set_daily_score("2026-03-01", 7);
        store.set_daily_score("2026-03-01", 9);

        assert_eq!(store.journal_entry("2026-03-01"), "revised");
        assert_eq!(store.memo_entry("2026-03-01"), "call mom");
        assert_eq!(store.daily_score("2026-03-01"), Some(9));
        assert_eq!(store.daily_score("2026-03-02"), None);
        assert_eq!(store.journal_entry("2026-03-02"), "");
    }

    #[test]
    fn daily_score_clamps_to_ten() {
        let (_dir, mut store) = temp_store();
        store.set_daily_score("2026-03-01", 200);
        assert_eq!(store.daily_score("2026-03-01"), Some(10));
    }

    #[test]
    fn switching_users_clears_previous_session_data() {
        let (_dir, mut store) = temp_store();
        store.set_user("user-a");
        store.upsert_goal(goal("g1", "Read", 60));
        store.set_journal_entry("2026-03-01", "private");

        // Same user again: nothing is lost.
        store.set_user("user-a");
        assert_eq!(store.goals().len(), 1);

        store.set_user("user-b");
        assert!(store.goals().is_empty());
        assert_eq!(store.journal_entry("2026-03-01"), "");
        assert_eq!(store.user_id().as_deref(), Some("user-b"));
    }

    #[test]
    fn clear_user_keeps_local_data() {
        let (_dir, mut store) = temp_store();
        store.set_user("user-a");
        store.upsert_goal(goal("g1", "Read", 60));
        store.clear_user();
        assert!(store.user_id().is_none());
        assert_eq!(store.goals().len(), 1);
    }

    #[test]
    fn mirror_round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.json");
        {
            let mut store = Store::new(path.clone());
            store.initialize().unwrap();
            store.set_user("user-a");
            store.upsert_goal(goal("g1", "Read", 60));
            store.set_daily_score("2026-03-01", 8);
        }
        let mut reopened = Store::new(path);
        reopened.initialize().unwrap();
        assert_eq!(reopened.user_id().as_deref(), Some("user-a"));
        assert_eq!(reopened.goal("g1").unwrap().title, "Read");
        assert_eq!(reopened.daily_score("2026-03-01"), Some(8));
    }

    #[test]
    fn corrupt_mirror_starts_empty_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.json");
        fs::write(&path, "{ not json").unwrap();
        let mut store = Store::new(path);
        store.initialize().unwrap();
        assert!(store.goals().is_empty());
    }

    #[test]
    fn messages_append_locally() {
        let (_dir, mut store) = temp_store();
        store.add_message(Role::User, "hello");
        let reply = store.add_message(Role::Assistant, "hi there");
        assert_eq!(store.messages().len(), 2);
        assert_eq!(reply.role, Role::Assistant);
    }
}
