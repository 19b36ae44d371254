//! facegraph-core - Face detection, alignment, embedding and clustering.
//!
//! Uses BlazeFace for two-pass face detection and MobileFaceNet for face
//! embeddings, both running via ONNX Runtime for CPU inference, and groups
//! embeddings across a photo library with MST single-linkage clustering.

pub mod alignment;
pub mod bitmap;
pub mod blazeface;
pub mod cancel;
pub mod cluster;
pub mod config;
pub mod crop;
pub mod dedup;
pub mod detector;
pub mod geometry;
pub mod pipeline;
pub mod recognizer;
pub mod types;

pub use alignment::{align, AlignError};
pub use blazeface::BlazeFace;
pub use cancel::CancelFlag;
pub use cluster::{cluster, ClusterEngine, ClusterError};
pub use config::{ClusterConfig, SyncConfig};
pub use detector::{DetectionModel, DetectorError, FaceDetector};
pub use geometry::{BBox, CoordinateTransform, Point};
pub use pipeline::{FacePipeline, FaceProcessor, PipelineError, ProcessedFile};
pub use recognizer::{EmbeddingModel, MobileFaceNet, RecognizerError};
pub use types::{
    AlignedFace, ClusterResult, Embedding, FaceCrop, FaceDetection, FaceRef, FileFaces, FileId,
    SyncJobState, SyncStatus,
};
