use anyhow::{Context, Result};
use faceid_core::{SqliteKv, TemplateStore};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod detection_loop;
mod engine;
mod replay;
#[cfg(test)]
mod testing;

use config::Config;
use dbus_interface::FaceIdService;
use engine::Engine;
use replay::ReplayExtractor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceidd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        tick_ms = config.tick_interval_ms,
        scope = ?config.gallery_scope,
        "configuration loaded"
    );

    let kv = SqliteKv::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    let store = Arc::new(TemplateStore::open(Box::new(kv)));

    let detections = config
        .detections_path
        .as_deref()
        .context("no extractor configured (set FACEID_DETECTIONS_PATH)")?;
    let extractor = ReplayExtractor::load(detections)?;
    let opener = config.source_opener()?;

    let engine = Arc::new(Engine::new(
        Arc::new(Mutex::new(extractor)),
        Arc::clone(&store),
        opener,
        config.settings(),
    ));

    let service = FaceIdService {
        engine: Arc::clone(&engine),
        verify_timeout: config.verify_timeout(),
    };

    let conn = zbus::connection::Builder::session()?
        .name("org.faceid.FaceId1")?
        .serve_at("/org/faceid/FaceId1", service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!("faceidd ready on org.faceid.FaceId1");

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceidd shutting down");

    drop(conn);
    drop(engine);
    match Arc::try_unwrap(store) {
        Ok(store) => store.close()?,
        Err(_) => tracing::warn!("template store still in use at shutdown; skipping close"),
    }

    Ok(())
}
