use std::sync::Arc;
use tracing::{error, info, warn};

mod activity;
mod bus;
mod cache;
mod chat;
mod config;
mod error;
mod health;
mod interface;
mod player;
mod policy;
mod provider;
mod scheduler;
mod store;
mod sync;
#[cfg(test)]
mod testing;
mod track;
mod transport;

use scheduler::Job;
use store::PersistentStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine
    let dotenv = dotenvy::dotenv();

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = dotenv {
        info!("No .env file found or failed to load: {}", e);
    }
    info!("Tunedeck starting...");

    let config = config::Config::from_env()?;
    let bus = Arc::new(bus::EventBus::new());

    info!("Initializing store at {}", config.database_path.display());
    let sqlite = store::SqliteStore::new(&config.database_path).await?;
    sqlite.init().await?;
    let store: Arc<dyn PersistentStore> = Arc::new(sqlite);

    // Rehydrate before anything can touch the cache
    let cache = cache::ChatCache::new();
    let tracker = activity::ActivityTracker::new();
    let sessions = cache.rehydrate(store.load_sessions().await?);
    let tracked = tracker.rehydrate(store.load_activity().await?);
    info!(sessions, tracked_chats = tracked, "Restored state from store");

    let gateway = provider::ProviderGateway::new(config.fetch_timeout)
        .register(Arc::new(provider::DirectUrlProvider::new(config.fetch_timeout)?))
        .with_default(config.default_provider.clone());
    info!(sources = ?gateway.sources(), default = %config.default_provider, "Providers registered");

    let transport: Arc<dyn transport::VoiceTransport> = Arc::new(transport::DetachedTransport::new());
    let completions = transport.take_completions();

    let player = Arc::new(player::Player::new(
        cache,
        tracker,
        Arc::new(gateway),
        transport,
        store.clone(),
        bus.clone(),
        config.player_settings(),
    ));

    match completions {
        Some(rx) => {
            tokio::spawn(player::relay_completions(player.clone(), rx));
        }
        None => warn!("Voice transport reports no completions, tracks advance only on skip"),
    }

    let restored = player.restore_playback().await;
    if restored > 0 {
        info!(restored, "Resumed playback for restored sessions");
    }

    // Background jobs
    let flush = Arc::new(scheduler::FlushJob::new(player.clone(), config.flush_interval));
    let mut jobs = scheduler::Scheduler::new(store.clone()).with_job(flush.clone());
    if config.auto_leave.enabled {
        jobs = jobs.with_job(Arc::new(scheduler::SweepJob::new(
            player.clone(),
            config.auto_leave_policy(),
            config.auto_leave.sweep_interval,
        )));
    } else {
        info!("Auto-leave disabled");
    }
    if config.auto_end.enabled {
        jobs = jobs.with_job(Arc::new(scheduler::AutoEndJob::new(
            player.clone(),
            config.unattended_rule(),
            config.auto_end.interval,
        )));
    }
    let scheduler_handle = jobs.start();

    // Status server
    let app = health::router(health::StatusState {
        player: player.clone(),
        started_at: chrono::Utc::now(),
    });
    let port = config.http_port;
    info!("Starting status server on port {}", port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    // Initialize Telegram Interface if token is present
    let telegram_interface = match &config.telegram_token {
        Some(token) => Some(
            interface::telegram::TelegramInterface::new(bus.clone(), player.clone(), token.clone())
                .with_admin_only(config.admin_only_controls),
        ),
        None => {
            info!("No Telegram token found, skipping Telegram bot startup.");
            None
        }
    };

    let telegram_handle = tokio::spawn(async move {
        if let Some(telegram) = telegram_interface {
            if let Err(e) = telegram.run().await {
                error!("Telegram bot stopped with error: {}", e);
            }
        } else {
            std::future::pending::<()>().await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
        _ = telegram_handle => {
            info!("Telegram bot finished, shutting down...");
        }
    }

    scheduler_handle.shutdown().await;
    let report = flush.run(chrono::Utc::now()).await;
    info!(%report, "Final flush complete");

    Ok(())
}
