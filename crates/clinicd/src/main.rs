use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod checkin;
mod config;
mod dbus_interface;
mod engine;
mod state;

use config::Config;
use dbus_interface::{CheckInService, BUS_NAME, OBJECT_PATH};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "clinicd starting");

    let config = Config::load()?;
    tracing::info!(
        camera = %config.camera_device,
        models = %config.model_dir.display(),
        threshold = config.similarity_threshold,
        interval_secs = config.recognition_interval_secs,
        "configuration loaded"
    );

    let cipher = clinic_store::EmbeddingCipher::load_or_create(&config.key_path)
        .with_context(|| format!("loading key {}", config.key_path.display()))?;
    let db = state::open_database(&config.db_path).await?;

    let engine = engine::spawn_engine(&config).context("starting recognition engine")?;

    let state = Arc::new(AppState::new(config, engine, db, cipher));
    let count = state.reload_gallery().await?;
    if count == 0 {
        tracing::warn!("no registered faces; register patients with `clinic register`");
    }

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, CheckInService::new(Arc::clone(&state)))?
        .build()
        .await
        .context("registering on the session bus")?;
    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "D-Bus service ready");

    let check_in = tokio::spawn(checkin::run_loop(Arc::clone(&state)));

    tokio::signal::ctrl_c().await?;
    tracing::info!("clinicd shutting down");
    check_in.abort();

    Ok(())
}
