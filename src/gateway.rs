//! Row-oriented interface to the remote relational backend.
//!
//! The engine only ever talks to the trait; the HTTP implementation speaks
//! a PostgREST-style REST dialect (filter params like `user_id=eq.<id>`,
//! upsert via `Prefer: resolution=merge-duplicates`). Calls are blocking;
//! async callers bridge through `tokio::task::spawn_blocking`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Goals,
    Events,
    UserSettings,
    JournalEntries,
    MemoEntries,
    DailyScores,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Goals,
        Table::Events,
        Table::UserSettings,
        Table::JournalEntries,
        Table::MemoEntries,
        Table::DailyScores,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Goals => "goals",
            Table::Events => "events",
            Table::UserSettings => "user_settings",
            Table::JournalEntries => "journal_entries",
            Table::MemoEntries => "memo_entries",
            Table::DailyScores => "daily_scores",
        }
    }

    /// Upsert conflict target for the table.
    pub fn conflict_target(&self) -> &'static str {
        match self {
            Table::Goals | Table::Events => "id",
            Table::UserSettings => "user_id",
            Table::JournalEntries | Table::MemoEntries | Table::DailyScores => "user_id,date",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait RemoteGateway: Send + Sync {
    /// All rows of a table belonging to a user.
    fn select(&self, table: Table, user_id: &str) -> SyncResult<Vec<Value>>;
    /// A single row by primary id, `None` when it does not exist.
    fn fetch_row(&self, table: Table, id: &str) -> SyncResult<Option<Value>>;
    fn insert(&self, table: Table, row: Value) -> SyncResult<()>;
    fn update(&self, table: Table, id: &str, patch: Value) -> SyncResult<()>;
    fn upsert(&self, table: Table, on_conflict: &str, row: Value) -> SyncResult<()>;
    fn delete(&self, table: Table, id: &str) -> SyncResult<()>;
}

/// REST gateway. One struct per backend project: base url plus the project
/// api key, both attached to every request.
pub struct HttpGateway {
    base_url: String,
    api_key: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, request: ureq::Request) -> ureq::Request {
        request
            .set("apikey", &self.api_key)
            .set("Authorization", &format!("Bearer {}", self.api_key))
    }

    fn map_err(table: Table, err: ureq::Error) -> SyncError {
        match err {
            ureq::Error::Status(code, _) => {
                SyncError::Api(format!("{table}: backend returned HTTP {code}"))
            }
            other => SyncError::Network(format!("{table}: {other}")),
        }
    }
}

impl RemoteGateway for HttpGateway {
    fn select(&self, table: Table, user_id: &str) -> SyncResult<Vec<Value>> {
        let request = self
            .authed(ureq::get(&self.table_url(table)))
            .query("select", "*")
            .query("user_id", &format!("eq.{user_id}"));
        let response = request.call().map_err(|e| Self::map_err(table, e))?;
        response
            .into_json::<Vec<Value>>()
            .map_err(|e| SyncError::Network(format!("{table}: failed to read response: {e}")))
    }

    fn fetch_row(&self, table: Table, id: &str) -> SyncResult<Option<Value>> {
        let request = self
            .authed(ureq::get(&self.table_url(table)))
            .query("select", "*")
            .query("id", &format!("eq.{id}"));
        let response = request.call().map_err(|e| Self::map_err(table, e))?;
        let rows = response
            .into_json::<Vec<Value>>()
            .map_err(|e| SyncError::Network(format!("{table}: failed to read response: {e}")))?;
        Ok(rows.into_iter().next())
    }

    fn insert(&self, table: Table, row: Value) -> SyncResult<()> {
        self.authed(ureq::post(&self.table_url(table)))
            .set("Prefer", "return=minimal")
            .send_json(row)
            .map_err(|e| Self::map_err(table, e))?;
        Ok(())
    }

    fn update(&self, table: Table, id: &str, patch: Value) -> SyncResult<()> {
        self.authed(ureq::request("PATCH", &self.table_url(table)))
            .query("id", &format!("eq.{id}"))
            .send_json(patch)
            .map_err(|e| Self::map_err(table, e))?;
        Ok(())
    }

    fn upsert(&self, table: Table, on_conflict: &str, row: Value) -> SyncResult<()> {
        self.authed(ureq::post(&self.table_url(table)))
            .query("on_conflict", on_conflict)
            .set("Prefer", "resolution=merge-duplicates,return=minimal")
            .send_json(row)
            .map_err(|e| Self::map_err(table, e))?;
        Ok(())
    }

    fn delete(&self, table: Table, id: &str) -> SyncResult<()> {
        self.authed(ureq::delete(&self.table_url(table)))
            .query("id", &format!("eq.{id}"))
            .call()
            .map_err(|e| Self::map_err(table, e))?;
        Ok(())
    }
}
