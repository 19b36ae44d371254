use crate::geometry::{BBox, CoordinateTransform, Point};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a file in the photo library.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to one face: the file it was found in and its index there.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FaceRef {
    pub file_id: FileId,
    pub face_index: u32,
}

impl FaceRef {
    pub fn new(file_id: FileId, face_index: u32) -> Self {
        Self { file_id, face_index }
    }
}

impl fmt::Display for FaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file_id, self.face_index)
    }
}

/// A detected face in source-image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bbox: BBox,
    /// Model-defined landmarks. For BlazeFace: right eye, left eye, nose,
    /// mouth, right ear, left ear (subject's point of view, so index 0 is the
    /// eye on the left of the image).
    pub landmarks: Vec<Point>,
    pub probability: f32,
}

impl FaceDetection {
    /// Map box and landmarks into another coordinate space.
    pub fn transform(&self, transform: &CoordinateTransform) -> FaceDetection {
        FaceDetection {
            bbox: transform.apply_box(&self.bbox),
            landmarks: transform.apply_points(&self.landmarks),
            probability: self.probability,
        }
    }

    pub fn center(&self) -> Point {
        self.bbox.center()
    }
}

/// A detection plus the similarity transform that brings it upright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedFace {
    pub detection: FaceDetection,
    /// Source pixels → canonical face pixels.
    pub alignment: CoordinateTransform,
    /// Source-space square that maps onto the canonical face.
    pub aligned_box: BBox,
    /// Rotation of the eye line, in radians.
    pub rotation: f32,
}

/// A padded, rotation-corrected crop around an aligned face.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub image: RgbImage,
    /// The rounded padded region of the source image the crop covers.
    pub source_box: BBox,
    pub rotation: f32,
}

/// Face embedding vector, tagged with the face it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub face: FaceRef,
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "mobilefacenet").
    pub model_version: Option<String>,
}

/// Everything persisted for one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub face_index: u32,
    pub detection: FaceDetection,
    pub aligned_box: BBox,
    pub rotation: f32,
    /// Source region of the cached crop.
    pub crop_box: BBox,
    pub embedding: Vec<f32>,
}

/// Per-file face records, as written to the store after a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFaces {
    pub file_id: FileId,
    pub faces: Vec<FaceRecord>,
    pub model_version: String,
    pub processed_at: DateTime<Utc>,
}

impl FileFaces {
    pub fn embeddings(&self) -> Vec<Embedding> {
        self.faces
            .iter()
            .map(|f| Embedding {
                face: FaceRef::new(self.file_id.clone(), f.face_index),
                values: f.embedding.clone(),
                model_version: Some(self.model_version.clone()),
            })
            .collect()
    }
}

/// One merge in the single-linkage dendrogram.
///
/// Node ids below `leaves.len()` are leaves; merge `k` has id
/// `leaves.len() + k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeNode {
    pub left: usize,
    pub right: usize,
    pub distance: f32,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergeTree {
    pub leaves: Vec<FaceRef>,
    pub nodes: Vec<MergeNode>,
}

/// Output of a clustering pass.
///
/// Cluster order is not meaningful; callers must not rely on it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterResult {
    pub clusters: Vec<Vec<FaceRef>>,
    pub noise: Vec<FaceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_tree: Option<MergeTree>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Failed,
}

/// Persisted progress of the library sync job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncJobState {
    /// Last file completed in the current pass; `None` starts from the top.
    pub cursor: Option<FileId>,
    pub status: SyncStatus,
    /// Consecutive failed or idle runs, drives scheduler backoff.
    pub retry_count: u32,
    /// Failed attempts per file; files at the retry limit are skipped.
    #[serde(default)]
    pub failed_files: BTreeMap<FileId, u32>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_ref_ordering() {
        let a = FaceRef::new(FileId::new("a.jpg"), 3);
        let b = FaceRef::new(FileId::new("a.jpg"), 10);
        let c = FaceRef::new(FileId::new("b.jpg"), 0);
        assert!(a < b && b < c);
        assert_eq!(b.to_string(), "a.jpg#10");
    }

    #[test]
    fn test_detection_transform() {
        let det = FaceDetection {
            bbox: BBox::new(10.0, 10.0, 20.0, 20.0),
            landmarks: vec![Point::new(15.0, 15.0)],
            probability: 0.9,
        };
        let t = CoordinateTransform::scaling(2.0).then(&CoordinateTransform::translation(1.0, 0.0));
        let out = det.transform(&t);
        assert_eq!(out.bbox, BBox::new(21.0, 20.0, 40.0, 40.0));
        assert_eq!(out.landmarks[0], Point::new(31.0, 30.0));
        assert_eq!(out.probability, 0.9);
    }

    #[test]
    fn test_sync_state_json_roundtrip() {
        let mut state = SyncJobState {
            cursor: Some(FileId::new("x/y.jpg")),
            status: SyncStatus::Paused,
            ..Default::default()
        };
        state.failed_files.insert(FileId::new("bad.jpg"), 2);
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"paused\""));
        let back: SyncJobState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
