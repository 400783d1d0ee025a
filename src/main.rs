use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use elevate_sync_rs::cli::{Cli, Command, CommandArguments, parse_policy};
use elevate_sync_rs::config::{self, Settings};
use elevate_sync_rs::gateway::HttpGateway;
use elevate_sync_rs::metadata;
use elevate_sync_rs::realtime::Reconciler;
use elevate_sync_rs::session::{AuthEvent, SessionBinder, SessionEventKind, SessionHandle};
use elevate_sync_rs::store::Store;
use elevate_sync_rs::sync::{SyncEngine, SyncPolicy};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Start(args) => run_start(args).await,
        Command::Status => run_status(),
        Command::Config => run_config(),
        Command::Version => {
            println!("{} {}", metadata::PKG_NAME, metadata::PKG_VERSION);
            Ok(())
        }
    }
}

async fn run_start(args: CommandArguments) -> Result<(), Box<dyn std::error::Error>> {
    let settings = args.merged(Settings::load(&config::settings_path())?)?;
    let Some(user_id) = settings.user_id.clone() else {
        return Err("No user id configured. Set ELEVATE_USER_ID or run `elevate-sync config`".into());
    };

    tracing::info!("Starting Elevate sync client");

    let mut store = Store::new(config::mirror_path());
    store.initialize()?;
    let store = Arc::new(Mutex::new(store));

    let session = SessionHandle::new();
    let gateway = Arc::new(HttpGateway::new(&settings.api_url, &settings.api_key));
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        gateway.clone(),
        session.clone(),
        settings.sync_policy,
    ));
    let reconciler = Arc::new(Reconciler::new(
        store,
        gateway,
        session,
        settings.realtime_url.clone(),
        Duration::from_secs(settings.poll_interval_secs),
    ));

    let (auth_tx, auth_rx) = mpsc::unbounded_channel();
    let binder = SessionBinder::new(Arc::clone(&engine), Arc::clone(&reconciler), auth_rx);
    let binder_handle = tokio::spawn(binder.run());

    auth_tx.send(AuthEvent {
        kind: SessionEventKind::SessionFound,
        user_id: Some(user_id),
    })?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    auth_tx.send(AuthEvent {
        kind: SessionEventKind::SignedOut,
        user_id: None,
    })?;
    drop(auth_tx);
    let _ = binder_handle.await;

    Ok(())
}

fn run_status() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load(&config::settings_path())?;
    let mut store = Store::new(config::mirror_path());
    store.initialize()?;
    let snapshot = store.snapshot();

    println!("{} {}", metadata::PKG_NAME.bold(), metadata::PKG_VERSION);
    println!("data dir:      {}", config::data_dir().display());
    println!(
        "backend:       {}",
        if settings.api_url.is_empty() {
            "(unconfigured)".yellow().to_string()
        } else {
            settings.api_url.clone()
        }
    );
    println!(
        "realtime:      {}",
        settings.realtime_url.as_deref().unwrap_or("(polling only)")
    );
    println!("poll interval: {}s", settings.poll_interval_secs);
    println!("sync policy:   {}", settings.sync_policy.as_str());
    println!(
        "user:          {}",
        snapshot.user_id.as_deref().unwrap_or("(signed out)")
    );
    println!();
    println!(
        "{}: {} goals, {} events, {} journal entries, {} memos, {} scores, {} messages",
        "local mirror".green(),
        snapshot.goals.len(),
        snapshot.events.len(),
        snapshot.journal.len(),
        snapshot.memos.len(),
        snapshot.scores.len(),
        snapshot.messages.len(),
    );
    Ok(())
}

fn run_config() -> Result<(), Box<dyn std::error::Error>> {
    let path = config::settings_path();
    let mut settings = Settings::load(&path)?;

    settings.api_url = dialoguer::Input::new()
        .with_prompt("Backend REST url")
        .with_initial_text(settings.api_url)
        .allow_empty(true)
        .interact_text()?;
    settings.api_key = dialoguer::Input::new()
        .with_prompt("Api key")
        .with_initial_text(settings.api_key)
        .allow_empty(true)
        .interact_text()?;
    let realtime: String = dialoguer::Input::new()
        .with_prompt("Realtime websocket url (empty for polling only)")
        .with_initial_text(settings.realtime_url.unwrap_or_default())
        .allow_empty(true)
        .interact_text()?;
    settings.realtime_url = (!realtime.trim().is_empty()).then_some(realtime);
    let user: String = dialoguer::Input::new()
        .with_prompt("User id")
        .with_initial_text(settings.user_id.unwrap_or_default())
        .allow_empty(true)
        .interact_text()?;
    settings.user_id = (!user.trim().is_empty()).then_some(user);
    settings.poll_interval_secs = dialoguer::Input::new()
        .with_prompt("Watchdog poll interval (seconds)")
        .default(settings.poll_interval_secs)
        .interact_text()?;

    let policies = ["remote_wins", "local_wins"];
    let current = if settings.sync_policy == SyncPolicy::LocalWins { 1 } else { 0 };
    let chosen = dialoguer::Select::new()
        .with_prompt("Sync policy on session start")
        .items(&policies)
        .default(current)
        .interact()?;
    settings.sync_policy = parse_policy(policies[chosen])?;

    settings.save(&path)?;
    println!("Saved {}", path.display());
    Ok(())
}
