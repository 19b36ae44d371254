//! Debug export: a self-contained JSON snapshot of a face store.
//!
//! Re-importing an export into an empty store reproduces the clustering
//! input exactly (records, embeddings, crops and the last clustering).

use crate::store::{CachedCrop, FaceStore, StoreError};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use facegraph_core::geometry::BBox;
use facegraph_core::types::{ClusterResult, FaceRef, FileFaces};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("crop {face}: invalid base64: {source}")]
    Base64 {
        face: FaceRef,
        #[source]
        source: base64::DecodeError,
    },
    #[error("unsupported export format version {0} (expected {FORMAT_VERSION})")]
    UnsupportedVersion(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedCrop {
    pub face: FaceRef,
    pub source_box: BBox,
    #[serde(default)]
    pub rotation: f32,
    pub png_base64: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugExport {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub files: Vec<FileFaces>,
    pub crops: Vec<ExportedCrop>,
    pub cluster_result: Option<ClusterResult>,
}

/// Snapshot everything in `store`.
pub fn export(store: &dyn FaceStore) -> Result<DebugExport, ExportError> {
    let files = store.all_files()?;
    let crops = store
        .all_crops()?
        .into_iter()
        .map(|crop| ExportedCrop {
            png_base64: BASE64_STANDARD.encode(&crop.png),
            face: crop.face,
            source_box: crop.source_box,
            rotation: crop.rotation,
        })
        .collect::<Vec<_>>();
    let cluster_result = store.cluster_result()?;

    tracing::info!(files = files.len(), crops = crops.len(), "store exported");
    Ok(DebugExport {
        format_version: FORMAT_VERSION,
        exported_at: Utc::now(),
        files,
        crops,
        cluster_result,
    })
}

/// Write every record, crop and the clustering of `export` into `store`,
/// replacing entries with the same key. Crops are decoded before anything is
/// written, so a malformed export leaves the store untouched.
pub fn import(store: &dyn FaceStore, export: &DebugExport) -> Result<(), ExportError> {
    if export.format_version != FORMAT_VERSION {
        return Err(ExportError::UnsupportedVersion(export.format_version));
    }

    let crops = export
        .crops
        .iter()
        .map(|c| {
            let png = BASE64_STANDARD
                .decode(&c.png_base64)
                .map_err(|source| ExportError::Base64 {
                    face: c.face.clone(),
                    source,
                })?;
            Ok(CachedCrop {
                face: c.face.clone(),
                source_box: c.source_box,
                rotation: c.rotation,
                png,
            })
        })
        .collect::<Result<Vec<_>, ExportError>>()?;

    for crop in &crops {
        store.put_crop(crop)?;
    }
    for file in &export.files {
        store.put_file(file)?;
    }
    if let Some(result) = &export.cluster_result {
        store.set_cluster_result(result)?;
    }

    tracing::info!(files = export.files.len(), crops = crops.len(), "store imported");
    Ok(())
}

pub fn write_json(export: &DebugExport, path: &Path) -> Result<(), ExportError> {
    let json = serde_json::to_string_pretty(export)?;
    std::fs::write(path, json)?;
    Ok(())
}

pub fn read_json(path: &Path) -> Result<DebugExport, ExportError> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::sample_file;
    use crate::store::{MemoryStore, SqliteStore};
    use facegraph_core::types::{Embedding, FileId};

    fn embeddings(store: &dyn FaceStore) -> Vec<Embedding> {
        store
            .all_files()
            .unwrap()
            .iter()
            .flat_map(|f| f.embeddings())
            .collect()
    }

    fn populated() -> MemoryStore {
        let store = MemoryStore::new();
        store.put_file(&sample_file("a.jpg", 2)).unwrap();
        store.put_file(&sample_file("b.jpg", 1)).unwrap();
        store
            .put_crop(&CachedCrop {
                face: FaceRef::new(FileId::new("a.jpg"), 1),
                source_box: BBox::new(0.5, 1.5, 20.0, 20.0),
                rotation: 0.1,
                png: vec![0, 1, 2, 250, 255],
            })
            .unwrap();
        store
            .set_cluster_result(&ClusterResult {
                clusters: vec![vec![
                    FaceRef::new(FileId::new("a.jpg"), 0),
                    FaceRef::new(FileId::new("b.jpg"), 0),
                ]],
                noise: vec![FaceRef::new(FileId::new("a.jpg"), 1)],
                debug_tree: None,
            })
            .unwrap();
        store
    }

    #[test]
    fn test_reimport_reproduces_clustering_input() {
        let source = populated();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        write_json(&export(&source).unwrap(), &path).unwrap();

        let target = SqliteStore::open_in_memory().unwrap();
        import(&target, &read_json(&path).unwrap()).unwrap();

        assert_eq!(embeddings(&target), embeddings(&source));
        assert_eq!(target.all_files().unwrap(), source.all_files().unwrap());
        assert_eq!(target.all_crops().unwrap(), source.all_crops().unwrap());
        assert_eq!(target.cluster_result().unwrap(), source.cluster_result().unwrap());
    }

    #[test]
    fn test_crop_bytes_are_base64() {
        let exported = export(&populated()).unwrap();
        assert_eq!(exported.format_version, FORMAT_VERSION);
        assert_eq!(exported.crops.len(), 1);
        assert_eq!(exported.crops[0].png_base64, "AAEC+v8=");
    }

    #[test]
    fn test_rejects_unknown_version_and_bad_base64() {
        let target = MemoryStore::new();

        let mut exported = export(&populated()).unwrap();
        exported.format_version = 99;
        assert!(matches!(import(&target, &exported), Err(ExportError::UnsupportedVersion(99))));

        let mut exported = export(&populated()).unwrap();
        exported.crops[0].png_base64 = "not base64!".into();
        assert!(matches!(import(&target, &exported), Err(ExportError::Base64 { .. })));
        assert!(target.all_files().unwrap().is_empty());
    }
}
