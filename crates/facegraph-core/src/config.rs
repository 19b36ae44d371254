//! Tunables for detection, alignment, clustering and the sync job.
//!
//! Every field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! [detection]
//! score_threshold_final = 0.8
//!
//! [clustering]
//! min_cluster_size = 2
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field} out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub alignment: AlignmentConfig,
    #[serde(default)]
    pub clustering: ClusterConfig,
    #[serde(default)]
    pub job: JobConfig,
}

impl SyncConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |field: &'static str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::OutOfRange {
                    field,
                    reason: format!("{v} not in [0, 1]"),
                })
            }
        };
        unit("score_threshold_pass1", self.detection.score_threshold_pass1)?;
        unit("score_threshold_final", self.detection.score_threshold_final)?;
        unit("iou_threshold", self.detection.iou_threshold)?;
        unit("left_eye_x", self.alignment.left_eye_x)?;

        if self.alignment.left_eye_x >= 0.5 {
            return Err(ConfigError::OutOfRange {
                field: "left_eye_x",
                reason: "left eye must sit left of the face centre".into(),
            });
        }
        if self.detection.input_size < 32 {
            return Err(ConfigError::OutOfRange {
                field: "input_size",
                reason: format!("{} is too small", self.detection.input_size),
            });
        }
        if self.alignment.desired_face_size == 0 || self.alignment.crop_max_size == 0 {
            return Err(ConfigError::OutOfRange {
                field: "desired_face_size",
                reason: "face and crop sizes must be positive".into(),
            });
        }
        if self.job.batch_size == 0 {
            return Err(ConfigError::OutOfRange {
                field: "batch_size",
                reason: "a run must attempt at least one file".into(),
            });
        }
        if self.job.backoff_multiplier < 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "backoff_multiplier",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Maximum faces returned by one model pass.
    pub max_faces: usize,
    /// Score cut for the first pass; looser than the final cut on purpose.
    pub score_threshold_pass1: f32,
    pub score_threshold_final: f32,
    /// IoU threshold of the model's own NMS.
    pub iou_threshold: f32,
    /// Square detector input side, in pixels.
    pub input_size: u32,
    /// Duplicate radius as a fraction of the source image width.
    pub max_face_distance_percent: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_faces: 50,
            score_threshold_pass1: 0.4,
            score_threshold_final: 0.75,
            iou_threshold: 0.3,
            input_size: 256,
            max_face_distance_percent: std::f32::consts::SQRT_2 / 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Canonical left-eye position as a fraction of the face size; the
    /// right eye mirrors it.
    pub left_eye_x: f32,
    pub left_eye_y: f32,
    /// Side of the canonical aligned face fed to the embedding model.
    pub desired_face_size: u32,
    /// Padding fraction added around the aligned box for cached crops.
    pub padding: f32,
    /// Side of the cached crop image.
    pub crop_max_size: u32,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            left_eye_x: 0.36,
            left_eye_y: 0.45,
            desired_face_size: 112,
            padding: 0.25,
            crop_max_size: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cosine similarity`, in [0, 2].
    #[default]
    Cosine,
    Euclidean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// MST edges heavier than this are cut.
    pub distance_threshold: f32,
    /// Components smaller than this become noise.
    pub min_cluster_size: usize,
    pub metric: DistanceMetric,
    /// Keep the merge tree for debugging.
    pub keep_debug_tree: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 0.4,
            min_cluster_size: 3,
            metric: DistanceMetric::Cosine,
            keep_debug_tree: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Files processed per sync run before clustering is deferred.
    pub batch_size: usize,
    pub file_timeout_secs: u64,
    /// Attempts per file before it is skipped for good.
    pub max_retries: u32,
    pub interval_secs: u64,
    pub backoff_multiplier: f32,
    pub max_interval_secs: u64,
}

impl JobConfig {
    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            file_timeout_secs: 60,
            max_retries: 3,
            interval_secs: 5,
            backoff_multiplier: 2.0,
            max_interval_secs: 960,
        }
    }
}
