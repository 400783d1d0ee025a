use clap::{Args, Parser, Subcommand};

use crate::config::Settings;
use crate::metadata::{PKG_DESCRIPTION, PKG_NAME, PKG_VERSION};
use crate::sync::SyncPolicy;

#[derive(Parser, Debug, Clone)]
#[command(name = PKG_NAME)]
#[command(version = PKG_VERSION)]
#[command(about = PKG_DESCRIPTION, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the sync client for the configured user
    Start(CommandArguments),
    /// Show the resolved configuration and local mirror summary
    Status,
    /// Open an interactive config editor for settings.json
    Config,
    /// Print version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct CommandArguments {
    /// Backend REST base url
    #[arg(long, env = "ELEVATE_API_URL")]
    pub api_url: Option<String>,

    /// Backend api key (sent as apikey + bearer token)
    #[arg(long, env = "ELEVATE_API_KEY")]
    pub api_key: Option<String>,

    /// Realtime change-feed websocket url (optional; polling covers
    /// convergence without it)
    #[arg(long, env = "ELEVATE_REALTIME_URL")]
    pub realtime_url: Option<String>,

    /// User id to bind the session to
    #[arg(long, env = "ELEVATE_USER_ID")]
    pub user_id: Option<String>,

    /// Watchdog poll interval in seconds
    #[arg(long, env = "ELEVATE_POLL_INTERVAL_SECS")]
    pub poll_interval_secs: Option<u64>,

    /// Bootstrap policy: remote_wins or local_wins
    #[arg(long, env = "ELEVATE_SYNC_POLICY")]
    pub sync_policy: Option<String>,
}

impl CommandArguments {
    /// Layer CLI/environment overrides over the persisted settings and
    /// validate the result.
    pub fn merged(&self, mut base: Settings) -> Result<Settings, String> {
        if let Some(url) = &self.api_url {
            base.api_url = url.clone();
        }
        if let Some(key) = &self.api_key {
            base.api_key = key.clone();
        }
        if let Some(url) = &self.realtime_url {
            base.realtime_url = Some(url.clone());
        }
        if let Some(user) = &self.user_id {
            base.user_id = Some(user.clone());
        }
        if let Some(secs) = self.poll_interval_secs {
            base.poll_interval_secs = secs;
        }
        if let Some(policy) = &self.sync_policy {
            base.sync_policy = parse_policy(policy)?;
        }

        if base.api_url.trim().is_empty() {
            return Err(
                "No backend url configured. Set ELEVATE_API_URL or run `elevate-sync config`"
                    .to_string(),
            );
        }
        if base.poll_interval_secs == 0 {
            return Err("ELEVATE_POLL_INTERVAL_SECS must be at least 1".to_string());
        }
        Ok(base)
    }
}

pub fn parse_policy(value: &str) -> Result<SyncPolicy, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "remote_wins" | "remote-wins" => Ok(SyncPolicy::RemoteWins),
        "local_wins" | "local-wins" => Ok(SyncPolicy::LocalWins),
        other => Err(format!(
            "Invalid sync policy '{other}' (expected remote_wins or local_wins)"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_args() -> CommandArguments {
        CommandArguments {
            api_url: None,
            api_key: None,
            realtime_url: None,
            user_id: None,
            poll_interval_secs: None,
            sync_policy: None,
        }
    }

    #[test]
    fn merged_layers_overrides_and_validates() {
        let mut args = bare_args();
        args.api_url = Some("https://project.example.co".to_string());
        args.sync_policy = Some("local_wins".to_string());

        let settings = args.merged(Settings::default()).unwrap();
        assert_eq!(settings.api_url, "https://project.example.co");
        assert_eq!(settings.sync_policy, SyncPolicy::LocalWins);
        assert_eq!(settings.poll_interval_secs, 5);

        assert!(bare_args().merged(Settings::default()).is_err());

        let mut bad = bare_args();
        bad.api_url = Some("https://project.example.co".to_string());
        bad.sync_policy = Some("merge".to_string());
        assert!(bad.merged(Settings::default()).is_err());
    }
}
