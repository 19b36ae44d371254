use anyhow::{Context, Result};
use facegraph_sync::{spawn_engine, DirectoryLibrary, FaceStore, SqliteStore, SyncJob, SyncScheduler, TaskQueue};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegraphd starting");

    let config = config::Config::from_env()?;
    if let Some(path) = &config.tunables_path {
        tracing::info!(path = %path.display(), "loaded tunables");
    }

    let engine = spawn_engine(
        &config.blazeface_model_path(),
        &config.mobilefacenet_model_path(),
        &config.sync,
    )
    .context("loading models")?;

    let store: Arc<dyn FaceStore> = Arc::new(SqliteStore::open(&config.db_path)?);
    let library = Arc::new(
        DirectoryLibrary::new(&config.library_root)
            .with_context(|| format!("opening library {}", config.library_root.display()))?,
    );
    let job = SyncJob::new(library, store, engine.clone(), TaskQueue::new(), config.sync.clone());
    let scheduler = Arc::new(SyncScheduler::new(Arc::new(job)));

    let service = dbus_interface::FaceGraphService::new(scheduler.clone(), engine.clone());
    let _conn = zbus::connection::Builder::session()?
        .name("org.freedesktop.FaceGraph1")?
        .serve_at("/org/freedesktop/FaceGraph1", service)?
        .build()
        .await
        .context("registering on the session bus")?;

    if config.schedule_on_start {
        scheduler.schedule_next_sync();
    }

    tracing::info!(
        library = %config.library_root.display(),
        db = %config.db_path.display(),
        "facegraphd ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegraphd shutting down");

    scheduler.stop_sync();
    engine.dispose().await?;

    Ok(())
}
