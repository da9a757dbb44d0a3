use backend_lib::{config::Settings, storage::FlatFileStorage, ws_router, AppState};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Pika! live-session backend
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a TOML config file; defaults to config.{toml,yaml,json}
    /// in the working directory plus PIKA_* environment overrides
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let storage = FlatFileStorage::new(&settings.data_dir)?;
    let state = Arc::new(AppState::new(storage, &settings));

    // periodic sweep of listeners that disconnected and never came back
    let sweeper = state.clone();
    let sweep_interval = Duration::from_secs(settings.sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await; // first tick is immediate, skip it
        loop {
            ticker.tick().await;
            let removed = sweeper.listeners.cleanup_stale();
            if removed > 0 {
                tracing::debug!(removed, "swept stale listener entries");
            }
        }
    });

    let app = ws_router::create_router(state);

    let listener = TcpListener::bind(settings.bind_addr).await?;
    tracing::info!(addr = %settings.bind_addr, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}
