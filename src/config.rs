use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::sync::SyncPolicy;

/// Persisted client settings, kept as `settings.json` in the data dir.
/// CLI flags and environment variables layer on top at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_url: String,
    pub api_key: String,
    pub realtime_url: Option<String>,
    pub user_id: Option<String>,
    pub poll_interval_secs: u64,
    pub sync_policy: SyncPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            realtime_url: None,
            user_id: None,
            poll_interval_secs: 5,
            sync_policy: SyncPolicy::default(),
        }
    }
}

pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ELEVATE_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let home = dirs::home_dir().expect("couldn't find home dir");
    home.join(".elevate-sync")
}

pub fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

/// The durable mirror blob holding the full local state snapshot.
pub fn mirror_path() -> PathBuf {
    data_dir().join("state.json")
}

impl Settings {
    /// Read settings from disk; a missing file yields defaults.
    pub fn load(path: &PathBuf) -> SyncResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(SyncError::from)
    }

    pub fn save(&self, path: &PathBuf) -> SyncResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_and_default_on_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let defaults = Settings::load(&path).unwrap();
        assert_eq!(defaults.poll_interval_secs, 5);
        assert_eq!(defaults.sync_policy, SyncPolicy::RemoteWins);

        let mut settings = defaults;
        settings.api_url = "https://project.example.co".to_string();
        settings.sync_policy = SyncPolicy::LocalWins;
        settings.save(&path).unwrap();

        let reloaded = Settings::load(&path).unwrap();
        assert_eq!(reloaded.api_url, "https://project.example.co");
        assert_eq!(reloaded.sync_policy, SyncPolicy::LocalWins);
    }
}
