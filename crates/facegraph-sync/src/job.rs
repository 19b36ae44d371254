//! Resumable library sync job.
//!
//! Walks the library in file-id order from a persisted cursor, runs each
//! unprocessed file through the engine via the task queue, and persists the
//! result, the crops and the advanced cursor after every file. A job stopped
//! or killed at any point resumes after the last completed file. When the
//! walk reaches the end of the library every stored embedding is clustered
//! and the cursor is reset for the next pass.

use crate::engine::{EngineError, EngineHandle};
use crate::library::{LibraryError, PhotoLibrary};
use crate::queue::{QueueError, TaskQueue};
use crate::store::{CachedCrop, FaceStore, StoreError};
use chrono::Utc;
use facegraph_core::bitmap::encode_png;
use facegraph_core::config::SyncConfig;
use facegraph_core::pipeline::ProcessedFile;
use facegraph_core::types::{ClusterResult, Embedding, FaceRef, FileId, SyncJobState, SyncStatus};
use facegraph_core::{CancelFlag, ClusterEngine, ClusterError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("library: {0}")]
    Library(#[from] LibraryError),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("clustering: {0}")]
    Cluster(#[from] ClusterError),
    #[error("encode crop: {0}")]
    Encode(#[from] image::ImageError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("task queue closed")]
    QueueClosed,
}

impl From<QueueError<SyncError>> for SyncError {
    fn from(e: QueueError<SyncError>) -> Self {
        match e {
            QueueError::Timeout(limit) => SyncError::Timeout(limit),
            QueueError::Task(inner) => inner,
            QueueError::Closed => SyncError::QueueClosed,
        }
    }
}

/// Summary of one [`SyncJob::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    /// Files processed successfully in this run.
    pub processed: usize,
    /// Files that failed in this run.
    pub failed: usize,
    /// Status the job was left in.
    pub status: SyncStatus,
    /// Set when the run reached the end of the library and re-clustered.
    pub clusters: Option<ClusterResult>,
}

impl SyncOutcome {
    /// Whether the run moved the library forward.
    pub fn is_productive(&self) -> bool {
        self.processed > 0
    }
}

/// Outcome of one file's attempt.
enum FileOutcome {
    Processed,
    Failed,
    Skipped,
}

pub struct SyncJob {
    library: Arc<dyn PhotoLibrary>,
    store: Arc<dyn FaceStore>,
    engine: EngineHandle,
    queue: TaskQueue,
    config: SyncConfig,
    /// Serialises runs started from different callers.
    running: tokio::sync::Mutex<()>,
}

impl SyncJob {
    pub fn new(
        library: Arc<dyn PhotoLibrary>,
        store: Arc<dyn FaceStore>,
        engine: EngineHandle,
        queue: TaskQueue,
        config: SyncConfig,
    ) -> Self {
        Self {
            library,
            store,
            engine,
            queue,
            config,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn FaceStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Process up to `batch_size` files from the cursor.
    ///
    /// `stop` is checked between files; once set the job persists status
    /// `Paused` and returns. Store failures abort the run with status
    /// `Failed`; per-file failures are counted and skipped.
    ///
    /// `retry_count` in the persisted state counts consecutive runs that
    /// processed nothing or failed; the scheduler backs off on it.
    pub async fn run(&self, stop: &CancelFlag) -> Result<SyncOutcome, SyncError> {
        let _running = self.running.lock().await;

        let mut state = self.store.sync_state()?;
        state.status = SyncStatus::Running;
        state.last_run_at = Some(Utc::now());
        self.store.set_sync_state(&state)?;

        match self.run_inner(&mut state, stop).await {
            Ok(outcome) => {
                if outcome.status != SyncStatus::Paused {
                    state.retry_count = if outcome.is_productive() { 0 } else { state.retry_count + 1 };
                    self.store.set_sync_state(&state)?;
                }
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(error = %e, "sync run failed");
                state.status = SyncStatus::Failed;
                state.retry_count += 1;
                if let Err(store_err) = self.store.set_sync_state(&state) {
                    tracing::error!(error = %store_err, "failed to record sync failure");
                }
                Err(e)
            }
        }
    }

    /// Run batches back to back until a pass reaches the end of the library.
    /// Returns `None` if `stop` paused the job first.
    pub async fn run_to_completion(&self, stop: &CancelFlag) -> Result<Option<ClusterResult>, SyncError> {
        loop {
            let outcome = self.run(stop).await?;
            if outcome.status == SyncStatus::Paused {
                return Ok(None);
            }
            if let Some(clusters) = outcome.clusters {
                return Ok(Some(clusters));
            }
        }
    }

    async fn run_inner(&self, state: &mut SyncJobState, stop: &CancelFlag) -> Result<SyncOutcome, SyncError> {
        let mut files = self.library.files()?;
        files.sort();

        let start = match &state.cursor {
            None => 0,
            Some(cursor) => match files.binary_search(cursor) {
                Ok(i) => i + 1,
                Err(_) => {
                    tracing::warn!(cursor = %cursor, "sync cursor not in library, restarting from the beginning");
                    state.cursor = None;
                    0
                }
            },
        };

        tracing::info!(total = files.len(), start, "sync run starting");

        let mut outcome = SyncOutcome::default();
        let mut attempted = 0;
        // an unvalidated zero would never make progress
        let batch_size = self.config.job.batch_size.max(1);

        for file_id in &files[start..] {
            if stop.is_cancelled() {
                tracing::info!(cursor = ?state.cursor, "sync stopped, pausing");
                state.status = SyncStatus::Paused;
                self.store.set_sync_state(state)?;
                outcome.status = SyncStatus::Paused;
                return Ok(outcome);
            }
            if attempted >= batch_size {
                tracing::info!(processed = outcome.processed, failed = outcome.failed, "sync batch complete");
                state.status = SyncStatus::Idle;
                self.store.set_sync_state(state)?;
                outcome.status = SyncStatus::Idle;
                return Ok(outcome);
            }

            match self.sync_file(file_id, state).await? {
                FileOutcome::Processed => {
                    outcome.processed += 1;
                    attempted += 1;
                }
                FileOutcome::Failed => {
                    outcome.failed += 1;
                    attempted += 1;
                }
                FileOutcome::Skipped => {}
            }

            state.cursor = Some(file_id.clone());
            self.store.set_sync_state(state)?;
        }

        let clusters = self.recluster().await?;
        state.cursor = None;
        state.status = SyncStatus::Idle;
        self.store.set_sync_state(state)?;

        tracing::info!(
            processed = outcome.processed,
            failed = outcome.failed,
            clusters = clusters.clusters.len(),
            "sync pass complete"
        );
        outcome.status = SyncStatus::Idle;
        outcome.clusters = Some(clusters);
        Ok(outcome)
    }

    /// Process one file unless it is already stored or out of retries.
    /// Store errors and a gone engine or queue propagate; anything else is
    /// charged to the file.
    async fn sync_file(&self, file_id: &FileId, state: &mut SyncJobState) -> Result<FileOutcome, SyncError> {
        if self.store.get_file(file_id)?.is_some() {
            return Ok(FileOutcome::Skipped);
        }
        let attempts = state.failed_files.get(file_id).copied().unwrap_or(0);
        if attempts >= self.config.job.max_retries {
            tracing::debug!(file = %file_id, attempts, "skipping file, retries exhausted");
            return Ok(FileOutcome::Skipped);
        }

        match self.process_file(file_id).await {
            Ok(processed) => {
                self.persist(&processed)?;
                state.failed_files.remove(file_id);
                tracing::info!(file = %file_id, faces = processed.faces.faces.len(), "file synced");
                Ok(FileOutcome::Processed)
            }
            Err(e @ (SyncError::Store(_) | SyncError::Engine(EngineError::ChannelClosed) | SyncError::QueueClosed)) => {
                Err(e)
            }
            Err(e) => {
                let attempts = attempts + 1;
                state.failed_files.insert(file_id.clone(), attempts);
                tracing::warn!(file = %file_id, attempts, error = %e, "file failed");
                Ok(FileOutcome::Failed)
            }
        }
    }

    /// Decode and run one file through the engine, under the queue and the
    /// per-file timeout.
    async fn process_file(&self, file_id: &FileId) -> Result<ProcessedFile, SyncError> {
        let library = self.library.clone();
        let engine = self.engine.clone();
        let file_id = file_id.clone();

        self.queue
            .run(Some(self.config.job.file_timeout()), move |cancel| async move {
                let decode_id = file_id.clone();
                let image = tokio::task::spawn_blocking(move || library.decode(&decode_id)).await??;
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                Ok(engine.process(file_id, image, cancel).await?)
            })
            .await
            .map_err(SyncError::from)
    }

    fn persist(&self, processed: &ProcessedFile) -> Result<(), SyncError> {
        for (face_index, crop) in &processed.crops {
            self.store.put_crop(&CachedCrop {
                face: FaceRef::new(processed.faces.file_id.clone(), *face_index),
                source_box: crop.source_box,
                rotation: crop.rotation,
                png: encode_png(&crop.image)?,
            })?;
        }
        // The record goes last: its presence marks the file as done.
        self.store.put_file(&processed.faces)?;
        Ok(())
    }

    /// Cluster every stored embedding of the current model, through the
    /// queue, and persist the result.
    async fn recluster(&self) -> Result<ClusterResult, SyncError> {
        let model_version = self.engine.model_version().to_string();
        let mut embeddings: Vec<Embedding> = Vec::new();
        let mut stale = 0;
        for file in self.store.all_files()? {
            if file.model_version == model_version {
                embeddings.extend(file.embeddings());
            } else {
                stale += file.faces.len();
            }
        }
        if stale > 0 {
            tracing::warn!(stale, model_version = %model_version, "ignoring faces embedded by another model");
        }

        let config = self.config.clustering.clone();
        let result = self
            .queue
            .run(None, move |_cancel| async move {
                let result = tokio::task::spawn_blocking(move || ClusterEngine::new(config).cluster(&embeddings)).await??;
                Ok::<_, SyncError>(result)
            })
            .await?;

        self.store.set_cluster_result(&result)?;
        Ok(result)
    }
}

/// Sync the whole library and return the fresh clustering.
///
/// Runs batches back to back until a pass reaches the end of the library.
pub async fn sync(
    library: Arc<dyn PhotoLibrary>,
    store: Arc<dyn FaceStore>,
    engine: EngineHandle,
    config: SyncConfig,
) -> Result<ClusterResult, SyncError> {
    SyncJob::new(library, store, engine, TaskQueue::new(), config)
        .run_to_completion(&CancelFlag::new())
        .await?
        .ok_or(SyncError::Cancelled)
}
