use facegraph_sync::{EngineHandle, SyncScheduler};
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the facegraph sync daemon.
///
/// Bus name: org.freedesktop.FaceGraph1
/// Object path: /org/freedesktop/FaceGraph1
pub struct FaceGraphService {
    scheduler: Arc<SyncScheduler>,
    engine: EngineHandle,
}

impl FaceGraphService {
    pub fn new(scheduler: Arc<SyncScheduler>, engine: EngineHandle) -> Self {
        Self { scheduler, engine }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.freedesktop.FaceGraph1")]
impl FaceGraphService {
    /// Arm the periodic sync timer. No-op if already armed.
    async fn schedule_next_sync(&self) -> zbus::fdo::Result<()> {
        tracing::info!("schedule_next_sync requested");
        self.scheduler.schedule_next_sync();
        Ok(())
    }

    /// Disarm the timer and pause a running sync after its current file.
    async fn stop_sync(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop_sync requested");
        self.scheduler.stop_sync();
        Ok(())
    }

    /// Latest clustering as JSON, or `null` before the first full pass.
    async fn clusters(&self) -> zbus::fdo::Result<String> {
        let result = self.scheduler.job().store().cluster_result().map_err(failed)?;
        serde_json::to_string(&result).map_err(failed)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let store = self.scheduler.job().store();
        let state = store.sync_state().map_err(failed)?;
        let files = store.all_files().map_err(failed)?;
        let faces: usize = files.iter().map(|f| f.faces.len()).sum();
        let clusters = store.cluster_result().map_err(failed)?;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_version": self.engine.model_version(),
            "scheduled": self.scheduler.is_scheduled(),
            "sync": state,
            "files": files.len(),
            "faces": faces,
            "clusters": clusters.as_ref().map(|c| c.clusters.len()),
            "noise": clusters.as_ref().map(|c| c.noise.len()),
        })
        .to_string())
    }
}
