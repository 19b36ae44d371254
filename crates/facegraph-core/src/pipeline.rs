//! Per-file face pipeline: detect → align → crop → embed.

use crate::alignment::align;
use crate::cancel::CancelFlag;
use crate::config::{AlignmentConfig, SyncConfig};
use crate::crop::{crop, extract_from_crop};
use crate::detector::{DetectionModel, DetectorError, FaceDetector};
use crate::recognizer::{EmbeddingModel, RecognizerError};
use crate::types::{FaceCrop, FaceRecord, FileFaces, FileId};
use chrono::Utc;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedding failed: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("cancelled")]
    Cancelled,
}

/// Result of running one file through the pipeline.
#[derive(Debug, Clone)]
pub struct ProcessedFile {
    pub faces: FileFaces,
    /// Crop per face, keyed by `face_index`, for the crop cache.
    pub crops: Vec<(u32, FaceCrop)>,
}

/// Anything that turns one decoded image into face records.
///
/// Object-safe so the engine thread can own any pipeline behind a box.
pub trait FaceProcessor: Send {
    fn model_version(&self) -> &str;

    fn process(
        &mut self,
        file_id: &FileId,
        image: &RgbImage,
        cancel: &CancelFlag,
    ) -> Result<ProcessedFile, PipelineError>;
}

pub struct FacePipeline<D, E> {
    detector: FaceDetector<D>,
    embedder: E,
    alignment: AlignmentConfig,
}

impl<D: DetectionModel, E: EmbeddingModel> FacePipeline<D, E> {
    pub fn new(detection_model: D, embedder: E, config: &SyncConfig) -> Self {
        Self {
            detector: FaceDetector::new(detection_model, config.detection.clone()),
            embedder,
            alignment: config.alignment.clone(),
        }
    }
}

fn check(cancel: &CancelFlag) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

impl<D: DetectionModel, E: EmbeddingModel> FaceProcessor for FacePipeline<D, E> {
    fn model_version(&self) -> &str {
        self.embedder.model_version()
    }

    fn process(
        &mut self,
        file_id: &FileId,
        image: &RgbImage,
        cancel: &CancelFlag,
    ) -> Result<ProcessedFile, PipelineError> {
        check(cancel)?;
        let detections = self.detector.detect(image)?;
        check(cancel)?;

        let mut faces = Vec::with_capacity(detections.len());
        let mut crops = Vec::with_capacity(detections.len());

        for detection in &detections {
            let aligned = match align(detection, &self.alignment) {
                Ok(aligned) => aligned,
                Err(e) => {
                    tracing::warn!(file = %file_id, error = %e, "skipping face");
                    continue;
                }
            };

            let face_crop = crop(image, &aligned, &self.alignment);
            let face_image = extract_from_crop(&face_crop, &aligned, &self.alignment);
            check(cancel)?;
            let embedding = self.embedder.embed(&face_image)?;

            let face_index = faces.len() as u32;
            faces.push(FaceRecord {
                face_index,
                detection: aligned.detection,
                aligned_box: aligned.aligned_box,
                rotation: aligned.rotation,
                crop_box: face_crop.source_box,
                embedding,
            });
            crops.push((face_index, face_crop));
        }

        tracing::debug!(file = %file_id, faces = faces.len(), "processed file");

        Ok(ProcessedFile {
            faces: FileFaces {
                file_id: file_id.clone(),
                faces,
                model_version: self.embedder.model_version().to_string(),
                processed_at: Utc::now(),
            },
            crops,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detector::tests::{image_with_squares, BrightSquareModel};
    use crate::geometry::BBox;
    use crate::types::FaceDetection;

    /// Embeds a face as its mean colour, so identical crops give identical
    /// vectors.
    pub(crate) struct MeanColorEmbedder;

    impl EmbeddingModel for MeanColorEmbedder {
        fn model_version(&self) -> &str {
            "mean-color"
        }

        fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
            let mut sum = [0.0f32; 3];
            for p in face.pixels() {
                for c in 0..3 {
                    sum[c] += p[c] as f32;
                }
            }
            let n = (face.width() * face.height()).max(1) as f32;
            Ok(vec![sum[0] / n + 1.0, sum[1] / n + 1.0, sum[2] / n + 1.0])
        }
    }

    /// Cancels the shared flag on the first detection call.
    struct CancellingModel {
        inner: BrightSquareModel,
        flag: CancelFlag,
    }

    impl DetectionModel for CancellingModel {
        fn input_size(&self) -> u32 {
            self.inner.input_size()
        }

        fn infer(&mut self, input: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError> {
            self.flag.cancel();
            self.inner.infer(input)
        }
    }

    struct NoLandmarks;

    impl DetectionModel for NoLandmarks {
        fn input_size(&self) -> u32 {
            256
        }

        fn infer(&mut self, input: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError> {
            let mut inner = BrightSquareModel::new(0.9);
            Ok(inner
                .infer(input)?
                .into_iter()
                .map(|mut d| {
                    d.landmarks.clear();
                    d
                })
                .collect())
        }
    }

    fn two_face_image() -> RgbImage {
        image_with_squares(
            800,
            400,
            &[BBox::new(100.0, 100.0, 120.0, 120.0), BBox::new(500.0, 150.0, 100.0, 100.0)],
        )
    }

    #[test]
    fn test_process_produces_record_and_crop_per_face() {
        let config = SyncConfig::default();
        let mut pipeline = FacePipeline::new(BrightSquareModel::new(0.9), MeanColorEmbedder, &config);
        let file_id = FileId::new("a.jpg");

        let out = pipeline.process(&file_id, &two_face_image(), &CancelFlag::new()).unwrap();

        assert_eq!(out.faces.file_id, file_id);
        assert_eq!(out.faces.model_version, "mean-color");
        assert_eq!(out.faces.faces.len(), 2);
        assert_eq!(out.crops.len(), 2);
        for (i, (face, (crop_index, face_crop))) in out.faces.faces.iter().zip(&out.crops).enumerate() {
            assert_eq!(face.face_index, i as u32);
            assert_eq!(*crop_index, i as u32);
            assert_eq!(face.crop_box, face_crop.source_box);
            assert_eq!(face.embedding.len(), 3);
            assert_eq!(face_crop.image.width(), config.alignment.crop_max_size);
        }
    }

    #[test]
    fn test_empty_image_gives_no_faces() {
        let mut pipeline =
            FacePipeline::new(BrightSquareModel::new(0.9), MeanColorEmbedder, &SyncConfig::default());
        let out = pipeline
            .process(&FileId::new("empty"), &RgbImage::new(0, 0), &CancelFlag::new())
            .unwrap();
        assert!(out.faces.faces.is_empty());
        assert!(out.crops.is_empty());
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut pipeline =
            FacePipeline::new(BrightSquareModel::new(0.9), MeanColorEmbedder, &SyncConfig::default());
        let flag = CancelFlag::new();
        flag.cancel();
        let err = pipeline.process(&FileId::new("a"), &two_face_image(), &flag).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(pipeline.detector_calls(), 0);
    }

    #[test]
    fn test_cancelled_between_stages() {
        let flag = CancelFlag::new();
        let model = CancellingModel { inner: BrightSquareModel::new(0.9), flag: flag.clone() };
        let mut pipeline = FacePipeline::new(model, MeanColorEmbedder, &SyncConfig::default());
        let err = pipeline.process(&FileId::new("a"), &two_face_image(), &flag).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[test]
    fn test_degenerate_faces_are_skipped() {
        let mut pipeline = FacePipeline::new(NoLandmarks, MeanColorEmbedder, &SyncConfig::default());
        let out = pipeline
            .process(&FileId::new("a"), &two_face_image(), &CancelFlag::new())
            .unwrap();
        assert!(out.faces.faces.is_empty());
    }

    impl FacePipeline<BrightSquareModel, MeanColorEmbedder> {
        fn detector_calls(&self) -> usize {
            self.detector.model().calls
        }
    }
}
