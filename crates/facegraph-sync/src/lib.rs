//! facegraph-sync - Library sync on top of facegraph-core.
//!
//! Walks a photo library, runs every file through the face pipeline on a
//! dedicated engine thread behind a single-slot task queue, persists faces
//! and crops to a store, and re-clusters once a pass completes. Passes are
//! resumable from a persisted cursor and can be driven by a backoff timer.

pub mod engine;
pub mod export;
pub mod job;
pub mod library;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use engine::{spawn_engine, spawn_with_processor, EngineError, EngineHandle};
pub use export::{DebugExport, ExportError};
pub use job::{sync, SyncError, SyncJob, SyncOutcome};
pub use library::{DirectoryLibrary, LibraryError, PhotoLibrary};
pub use queue::{QueueError, TaskQueue};
pub use scheduler::{backoff_interval, SyncScheduler};
pub use store::{CachedCrop, FaceStore, MemoryStore, SqliteStore, StoreError};
