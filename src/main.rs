use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};

mod api;
mod config;
mod engine;
mod models;
mod services;
mod workers;

use crate::api::errors::ApiError;
use crate::api::ServiceClient;
use crate::config::Config;
use crate::engine::errors::EngineError;
use crate::workers::control_loop::ControlLoop;
use crate::workers::matchmaker::Matchmaker;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = match Config::load(Path::new(&config_path)) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    let watchdog = Duration::from_secs(config.stream_watchdog_secs);
    let client = match ServiceClient::new(&config.url, &config.token, watchdog) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Building the HTTP client failed: {}", e);
            return 1;
        }
    };

    // The account must carry the bot marker before anything else happens.
    let account = match client.profile().await {
        Ok(account) => account,
        Err(ApiError::Unauthorized) => {
            error!("The service rejected the configured token");
            return 2;
        }
        Err(e) => {
            error!("Fetching our profile failed: {}", e);
            return 2;
        }
    };
    if !account.is_bot() {
        error!(
            "Account {} is not a bot account (title: {:?})",
            account.username, account.title
        );
        return 4;
    }
    info!("Connected as {}", account.username);

    // Probe the engine once up front so a broken setup fails fast instead
    // of in the middle of someone's game.
    match engine::spawn(&config.engine).await {
        Ok(mut engine) => {
            info!("Engine ready: {} ({})", engine.name(), engine.dialect());
            engine.quit().await;
        }
        Err(EngineError::Unsupported) => {
            error!("Engine {} speaks neither UCI nor XBoard", config.engine.path);
            return 3;
        }
        Err(EngineError::Spawn(msg)) => {
            error!("Engine could not be started: {}", msg);
            return 1;
        }
        Err(e) => {
            error!("Engine startup failed: {}", e);
            return 3;
        }
    }

    let (archive_tx, archive_rx) = mpsc::unbounded_channel();
    let archiver = workers::archiver::spawn(config.archive.path.clone(), archive_rx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (matchmaker_tx, matchmaker_rx) = mpsc::channel(32);
    let (challenging_tx, challenging_rx) = watch::channel(None);

    let matchmaker = Matchmaker::new(
        client.clone(),
        config.matchmaking.clone(),
        config.max_games,
        matchmaker_rx,
        challenging_tx,
        shutdown_rx.clone(),
    );
    let matchmaker_handle = tokio::spawn(matchmaker.run());

    let control = ControlLoop::new(
        client.clone(),
        config.clone(),
        account,
        archive_tx.clone(),
        matchmaker_tx,
        challenging_rx,
        shutdown_rx,
    );
    let mut control_handle = tokio::spawn(control.run());

    let mut control_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = &mut control_handle => {
            error!("Control loop exited on its own: {:?}", result);
            control_done = true;
        }
    }

    // Graceful shutdown: stop accepting games, let workers resign and
    // flush their archive records, then close the queue behind them.
    let _ = shutdown_tx.send(true);

    let drain = Duration::from_secs(config.shutdown_drain_secs + 10);
    if !control_done && tokio::time::timeout(drain, &mut control_handle).await.is_err() {
        error!("Control loop ignored shutdown, aborting it");
        control_handle.abort();
    }
    if tokio::time::timeout(Duration::from_secs(5), matchmaker_handle)
        .await
        .is_err()
    {
        error!("Matchmaker ignored shutdown");
    }

    drop(archive_tx);
    if tokio::time::timeout(Duration::from_secs(10), archiver)
        .await
        .is_err()
    {
        error!("Archiver did not drain its queue in time");
    }

    info!("Shutdown complete");
    0
}
