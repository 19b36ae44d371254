//! Persistent face store: per-file records, cached crops, job state and the
//! latest clustering.
//!
//! Every operation is atomic per record; nothing spans several records, so a
//! job interrupted at any point leaves the store consistent.

use facegraph_core::geometry::BBox;
use facegraph_core::types::{ClusterResult, FaceRef, FileFaces, FileId, SyncJobState};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    file_id      TEXT PRIMARY KEY,
    record       TEXT NOT NULL,
    processed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crops (
    file_id    TEXT NOT NULL,
    face_index INTEGER NOT NULL,
    source_box TEXT NOT NULL,
    rotation   REAL NOT NULL,
    png        BLOB NOT NULL,
    PRIMARY KEY (file_id, face_index)
);

CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const KEY_SYNC_STATE: &str = "sync_state";
const KEY_CLUSTER_RESULT: &str = "cluster_result";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

/// A cached face crop: PNG bytes plus the geometry needed to re-derive the
/// canonical face from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCrop {
    pub face: FaceRef,
    pub source_box: BBox,
    pub rotation: f32,
    pub png: Vec<u8>,
}

pub trait FaceStore: Send + Sync {
    fn get_file(&self, file_id: &FileId) -> Result<Option<FileFaces>, StoreError>;

    /// Insert or replace the records of one file.
    fn put_file(&self, faces: &FileFaces) -> Result<(), StoreError>;

    /// All stored files, ordered by file id.
    fn all_files(&self) -> Result<Vec<FileFaces>, StoreError>;

    fn put_crop(&self, crop: &CachedCrop) -> Result<(), StoreError>;

    fn get_crop(&self, face: &FaceRef) -> Result<Option<CachedCrop>, StoreError>;

    /// All cached crops, ordered by face.
    fn all_crops(&self) -> Result<Vec<CachedCrop>, StoreError>;

    /// Persisted job state; a fresh store yields the default (idle, no cursor).
    fn sync_state(&self) -> Result<SyncJobState, StoreError>;

    fn set_sync_state(&self, state: &SyncJobState) -> Result<(), StoreError>;

    fn cluster_result(&self) -> Result<Option<ClusterResult>, StoreError>;

    fn set_cluster_result(&self, result: &ClusterResult) -> Result<(), StoreError>;
}

/// In-memory store, for tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    files: BTreeMap<FileId, FileFaces>,
    crops: BTreeMap<FaceRef, CachedCrop>,
    state: SyncJobState,
    clusters: Option<ClusterResult>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl FaceStore for MemoryStore {
    fn get_file(&self, file_id: &FileId) -> Result<Option<FileFaces>, StoreError> {
        Ok(self.lock()?.files.get(file_id).cloned())
    }

    fn put_file(&self, faces: &FileFaces) -> Result<(), StoreError> {
        self.lock()?.files.insert(faces.file_id.clone(), faces.clone());
        Ok(())
    }

    fn all_files(&self) -> Result<Vec<FileFaces>, StoreError> {
        Ok(self.lock()?.files.values().cloned().collect())
    }

    fn put_crop(&self, crop: &CachedCrop) -> Result<(), StoreError> {
        self.lock()?.crops.insert(crop.face.clone(), crop.clone());
        Ok(())
    }

    fn get_crop(&self, face: &FaceRef) -> Result<Option<CachedCrop>, StoreError> {
        Ok(self.lock()?.crops.get(face).cloned())
    }

    fn all_crops(&self) -> Result<Vec<CachedCrop>, StoreError> {
        Ok(self.lock()?.crops.values().cloned().collect())
    }

    fn sync_state(&self) -> Result<SyncJobState, StoreError> {
        Ok(self.lock()?.state.clone())
    }

    fn set_sync_state(&self, state: &SyncJobState) -> Result<(), StoreError> {
        self.lock()?.state = state.clone();
        Ok(())
    }

    fn cluster_result(&self) -> Result<Option<ClusterResult>, StoreError> {
        Ok(self.lock()?.clusters.clone())
    }

    fn set_cluster_result(&self, result: &ClusterResult) -> Result<(), StoreError> {
        self.lock()?.clusters = Some(result.clone());
        Ok(())
    }
}

/// SQLite-backed store. Records and state are stored as JSON text.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened face store");
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn get_kv<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let value: Option<String> = self
            .conn()?
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        value.map(|v| serde_json::from_str(&v)).transpose().map_err(Into::into)
    }

    fn set_kv<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        self.conn()?.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, json],
        )?;
        Ok(())
    }
}

fn crop_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, u32, String, f32, Vec<u8>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_crop(
    (file_id, face_index, source_box, rotation, png): (String, u32, String, f32, Vec<u8>),
) -> Result<CachedCrop, StoreError> {
    Ok(CachedCrop {
        face: FaceRef::new(FileId::new(file_id), face_index),
        source_box: serde_json::from_str(&source_box)?,
        rotation,
        png,
    })
}

impl FaceStore for SqliteStore {
    fn get_file(&self, file_id: &FileId) -> Result<Option<FileFaces>, StoreError> {
        let record: Option<String> = self
            .conn()?
            .query_row(
                "SELECT record FROM files WHERE file_id = ?",
                [file_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        record.map(|r| serde_json::from_str(&r)).transpose().map_err(Into::into)
    }

    fn put_file(&self, faces: &FileFaces) -> Result<(), StoreError> {
        let json = serde_json::to_string(faces)?;
        self.conn()?.execute(
            "INSERT INTO files (file_id, record, processed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(file_id) DO UPDATE SET record = excluded.record, processed_at = excluded.processed_at",
            rusqlite::params![faces.file_id.as_str(), json, faces.processed_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn all_files(&self) -> Result<Vec<FileFaces>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT record FROM files ORDER BY file_id")?;
        let records = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        records
            .iter()
            .map(|r| serde_json::from_str(r).map_err(Into::into))
            .collect()
    }

    fn put_crop(&self, crop: &CachedCrop) -> Result<(), StoreError> {
        let source_box = serde_json::to_string(&crop.source_box)?;
        self.conn()?.execute(
            "INSERT INTO crops (file_id, face_index, source_box, rotation, png) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(file_id, face_index) DO UPDATE SET
                source_box = excluded.source_box, rotation = excluded.rotation, png = excluded.png",
            rusqlite::params![
                crop.face.file_id.as_str(),
                crop.face.face_index,
                source_box,
                crop.rotation,
                crop.png
            ],
        )?;
        Ok(())
    }

    fn get_crop(&self, face: &FaceRef) -> Result<Option<CachedCrop>, StoreError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT file_id, face_index, source_box, rotation, png FROM crops
                 WHERE file_id = ?1 AND face_index = ?2",
                rusqlite::params![face.file_id.as_str(), face.face_index],
                crop_from_row,
            )
            .optional()?;
        row.map(decode_crop).transpose()
    }

    fn all_crops(&self) -> Result<Vec<CachedCrop>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT file_id, face_index, source_box, rotation, png FROM crops
             ORDER BY file_id, face_index",
        )?;
        let rows = stmt
            .query_map([], crop_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_crop).collect()
    }

    fn sync_state(&self) -> Result<SyncJobState, StoreError> {
        Ok(self.get_kv(KEY_SYNC_STATE)?.unwrap_or_default())
    }

    fn set_sync_state(&self, state: &SyncJobState) -> Result<(), StoreError> {
        self.set_kv(KEY_SYNC_STATE, state)
    }

    fn cluster_result(&self) -> Result<Option<ClusterResult>, StoreError> {
        self.get_kv(KEY_CLUSTER_RESULT)
    }

    fn set_cluster_result(&self, result: &ClusterResult) -> Result<(), StoreError> {
        self.set_kv(KEY_CLUSTER_RESULT, result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use facegraph_core::geometry::Point;
    use facegraph_core::types::{FaceDetection, FaceRecord, SyncStatus};

    pub(crate) fn sample_file(id: &str, faces: usize) -> FileFaces {
        FileFaces {
            file_id: FileId::new(id),
            faces: (0..faces as u32)
                .map(|i| FaceRecord {
                    face_index: i,
                    detection: FaceDetection {
                        bbox: BBox::new(10.0 * i as f32, 5.0, 40.0, 40.0),
                        landmarks: vec![Point::new(20.0, 15.0), Point::new(40.0, 15.0)],
                        probability: 0.9,
                    },
                    aligned_box: BBox::new(8.0, 2.0, 44.0, 44.0),
                    rotation: 0.05,
                    crop_box: BBox::new(-3.0, -9.0, 66.0, 66.0),
                    embedding: vec![0.1 * i as f32, 0.25, -0.5],
                })
                .collect(),
            model_version: "test".into(),
            processed_at: Utc::now(),
        }
    }

    fn exercise(store: &dyn FaceStore) {
        assert!(store.get_file(&FileId::new("a.jpg")).unwrap().is_none());
        assert!(store.all_files().unwrap().is_empty());
        assert_eq!(store.sync_state().unwrap(), SyncJobState::default());
        assert!(store.cluster_result().unwrap().is_none());

        let b = sample_file("b.jpg", 1);
        let a = sample_file("a.jpg", 2);
        store.put_file(&b).unwrap();
        store.put_file(&a).unwrap();
        assert_eq!(store.get_file(&FileId::new("a.jpg")).unwrap(), Some(a.clone()));
        let ids: Vec<FileId> = store.all_files().unwrap().into_iter().map(|f| f.file_id).collect();
        assert_eq!(ids, vec![FileId::new("a.jpg"), FileId::new("b.jpg")]);

        // replace
        let a2 = sample_file("a.jpg", 0);
        store.put_file(&a2).unwrap();
        assert_eq!(store.get_file(&FileId::new("a.jpg")).unwrap(), Some(a2));
        assert_eq!(store.all_files().unwrap().len(), 2);

        let crop = CachedCrop {
            face: FaceRef::new(FileId::new("a.jpg"), 1),
            source_box: BBox::new(1.0, 2.0, 30.0, 30.0),
            rotation: -0.2,
            png: vec![137, 80, 78, 71],
        };
        store.put_crop(&crop).unwrap();
        assert_eq!(store.get_crop(&crop.face).unwrap(), Some(crop.clone()));
        assert!(store.get_crop(&FaceRef::new(FileId::new("a.jpg"), 0)).unwrap().is_none());
        assert_eq!(store.all_crops().unwrap(), vec![crop]);

        let mut state = SyncJobState {
            cursor: Some(FileId::new("b.jpg")),
            status: SyncStatus::Running,
            ..Default::default()
        };
        state.failed_files.insert(FileId::new("c.jpg"), 1);
        store.set_sync_state(&state).unwrap();
        assert_eq!(store.sync_state().unwrap(), state);

        let result = ClusterResult {
            clusters: vec![vec![FaceRef::new(FileId::new("a.jpg"), 0)]],
            noise: vec![],
            debug_tree: None,
        };
        store.set_cluster_result(&result).unwrap();
        assert_eq!(store.cluster_result().unwrap(), Some(result));
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_sqlite_store_in_memory() {
        exercise(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/faces.db");
        let file = sample_file("x.jpg", 3);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put_file(&file).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_file(&file.file_id).unwrap(), Some(file));
    }
}
