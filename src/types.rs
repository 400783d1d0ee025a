use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A user-defined target activity with a default time budget in minutes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub color: String,
    pub icon: Option<String>,
    pub default_duration: u32,
    pub description: Option<String>,
    pub deadline: Option<String>,
    pub created_at: String,
}

/// A scheduled time block, optionally linked to a goal.
///
/// `start_time`/`end_time` are RFC 3339 instants kept as strings so the
/// mirror blob and the wire rows share one representation; they are parsed
/// only where arithmetic is needed. `goal_id` is a weak reference: the goal
/// may have been deleted and lookups must tolerate that.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start_time: String,
    pub end_time: String,
    pub goal_id: Option<String>,
    pub completed_duration: u32,
}

/// Singleton main objective, per-field nullable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Objective {
    pub goal: Option<String>,
    pub deadline: Option<String>,
    pub start_date: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Chat message. Stored in the local mirror only, never synced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
}

/// Creation payload for a goal; the engine assigns id and creation time.
#[derive(Clone, Debug)]
pub struct NewGoal {
    pub title: String,
    pub color: String,
    pub icon: Option<String>,
    pub default_duration: u32,
    pub description: Option<String>,
    pub deadline: Option<String>,
}

/// Creation payload for a scheduled event; progress always starts at zero.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub title: String,
    pub start_time: String,
    pub end_time: String,
    pub goal_id: Option<String>,
}

/// Partial goal update; `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct GoalPatch {
    pub title: Option<String>,
    pub color: Option<String>,
    pub icon: Option<Option<String>>,
    pub default_duration: Option<u32>,
    pub description: Option<Option<String>>,
    pub deadline: Option<Option<String>>,
}

/// Partial event update; `goal_id` uses a nested option so reassignment to
/// "no goal" is distinguishable from "leave as is".
#[derive(Clone, Debug, Default)]
pub struct EventPatch {
    pub title: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub goal_id: Option<Option<String>>,
}

/// Full local state snapshot. This is exactly what the durable mirror
/// serializes: one blob, read once at startup, rewritten after every
/// mutation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreData {
    pub user_id: Option<String>,
    pub goals: HashMap<String, Goal>,
    pub events: HashMap<String, CalendarEvent>,
    pub objective: Objective,
    pub journal: BTreeMap<String, String>,
    pub memos: BTreeMap<String, String>,
    pub scores: BTreeMap<String, u8>,
    pub messages: Vec<Message>,
}
