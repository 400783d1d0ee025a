//! Row shapes for the six remote tables.
//!
//! Wire rows are tolerant by construction: every column that has ever been
//! added by a schema migration is optional, so a replica that lags behind
//! the latest migration still produces decodable rows. The goal row keeps
//! "column absent" and "column null" apart, because the two mean different
//! things during a migration race (see `GoalRow::into_goal`).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

use crate::types::{CalendarEvent, EventPatch, Goal, GoalPatch, Objective};

/// Absent key -> `None`, explicit null -> `Some(None)`, value -> `Some(Some(v))`.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalRow {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub default_duration: Option<Option<i64>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl GoalRow {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Convert to the entity. An explicitly null duration is authoritative
    /// zero; an *absent* duration column means the row came from a replica
    /// that predates the migration, and the previously known local value
    /// wins over silently resetting a duration the user can see.
    pub fn into_goal(self, known_duration: Option<u32>) -> Goal {
        let default_duration = match self.default_duration {
            Some(Some(d)) => u32::try_from(d).unwrap_or(0),
            Some(None) => 0,
            None => known_duration.unwrap_or(0),
        };
        Goal {
            id: self.id,
            title: self.title,
            color: self.color.unwrap_or_default(),
            icon: self.icon,
            default_duration,
            description: self.description,
            deadline: self.deadline,
            created_at: self.created_at.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub title: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub goal_id: Option<String>,
    #[serde(default)]
    pub completed_duration: Option<i64>,
}

impl EventRow {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn into_event(self) -> CalendarEvent {
        CalendarEvent {
            id: self.id,
            title: self.title,
            start_time: self.start_time,
            end_time: self.end_time,
            goal_id: self.goal_id,
            completed_duration: self
                .completed_duration
                .and_then(|d| u32::try_from(d).ok())
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsRow {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub main_goal: Option<String>,
    #[serde(default)]
    pub main_goal_deadline: Option<String>,
    #[serde(default)]
    pub main_goal_start_date: Option<String>,
}

impl SettingsRow {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn into_objective(self) -> Objective {
        Objective {
            goal: self.main_goal,
            deadline: self.main_goal_deadline,
            start_date: self.main_goal_start_date,
        }
    }
}

/// Journal and memo rows share a shape: unique on `(user_id, date)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateEntryRow {
    #[serde(default)]
    pub user_id: Option<String>,
    pub date: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl DateEntryRow {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRow {
    #[serde(default)]
    pub user_id: Option<String>,
    pub date: String,
    #[serde(default)]
    pub score: Option<i64>,
}

impl ScoreRow {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn score_u8(&self) -> u8 {
        self.score
            .and_then(|s| u8::try_from(s).ok())
            .unwrap_or(0)
            .min(10)
    }
}

// Outbound builders. Writes always carry the full wire field set for their
// table, scoped to the owning user.

pub fn goal_row(goal: &Goal, user_id: &str) -> Value {
    json!({
        "id": goal.id,
        "user_id": user_id,
        "title": goal.title,
        "color": goal.color,
        "icon": goal.icon,
        "default_duration": goal.default_duration,
        "description": goal.description,
        "deadline": goal.deadline,
        "created_at": goal.created_at,
    })
}

pub fn event_row(event: &CalendarEvent, user_id: &str) -> Value {
    json!({
        "id": event.id,
        "user_id": user_id,
        "title": event.title,
        "start_time": event.start_time,
        "end_time": event.end_time,
        "goal_id": event.goal_id,
        "completed_duration": event.completed_duration,
    })
}

pub fn settings_row(objective: &Objective, user_id: &str) -> Value {
    json!({
        "user_id": user_id,
        "main_goal": objective.goal,
        "main_goal_deadline": objective.deadline,
        "main_goal_start_date": objective.start_date,
    })
}

pub fn date_entry_row(user_id: &str, date: &str, content: &str) -> Value {
    json!({ "user_id": user_id, "date": date, "content": content })
}

pub fn score_row_value(user_id: &str, date: &str, score: u8) -> Value {
    json!({ "user_id": user_id, "date": date, "score": score })
}

/// Only the supplied patch fields become wire columns, mirroring the
/// merge-only-given-fields contract of the local update.
pub fn goal_patch_value(patch: &GoalPatch) -> Value {
    let mut out = serde_json::Map::new();
    if let Some(title) = &patch.title {
        out.insert("title".into(), json!(title));
    }
    if let Some(color) = &patch.color {
        out.insert("color".into(), json!(color));
    }
    if let Some(icon) = &patch.icon {
        out.insert("icon".into(), json!(icon));
    }
    if let Some(duration) = patch.default_duration {
        out.insert("default_duration".into(), json!(duration));
    }
    if let Some(description) = &patch.description {
        out.insert("description".into(), json!(description));
    }
    if let Some(deadline) = &patch.deadline {
        out.insert("deadline".into(), json!(deadline));
    }
    Value::Object(out)
}

pub fn event_patch_value(patch: &EventPatch) -> Value {
    let mut out = serde_json::Map::new();
    if let Some(title) = &patch.title {
        out.insert("title".into(), json!(title));
    }
    if let Some(start) = &patch.start_time {
        out.insert("start_time".into(), json!(start));
    }
    if let Some(end) = &patch.end_time {
        out.insert("end_time".into(), json!(end));
    }
    if let Some(goal_id) = &patch.goal_id {
        out.insert("goal_id".into(), json!(goal_id));
    }
    Value::Object(out)
}

pub fn progress_patch_value(minutes: u32) -> Value {
    json!({ "completed_duration": minutes })
}
