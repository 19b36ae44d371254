//! Two-pass face detector.
//!
//! Pass 1 runs the model over the whole image shrunk to the model input.
//! Small faces come out of that pass with poor boxes and landmarks, so every
//! pass-1 hit is re-detected in pass 2 on an enlarged, padded crop around it,
//! where the face fills a useful fraction of the model input. Only faces
//! confirmed by pass 2 are returned.

use crate::bitmap;
use crate::config::DetectionConfig;
use crate::dedup::dedupe;
use crate::geometry::{compute_transform_to_box, euclidean, BBox, CoordinateTransform};
use crate::types::FaceDetection;
use image::RgbImage;
use thiserror::Error;

/// Context added around a pass-1 box before the second pass.
const PASS2_ENLARGE: f32 = 2.0;
/// Black border added around the pass-2 crop, as a fraction of its size.
const PASS2_PADDING: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place the BlazeFace ONNX export in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A single-pass face detection model.
///
/// `infer` receives an `input_size × input_size` image and returns detections
/// in that image's pixel coordinates, already score-filtered, NMS'd and
/// capped by the model's own settings.
pub trait DetectionModel: Send {
    fn input_size(&self) -> u32;

    fn infer(&mut self, input: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError>;
}

/// Two-pass detector over any [`DetectionModel`].
pub struct FaceDetector<M> {
    model: M,
    config: DetectionConfig,
}

impl<M: DetectionModel> FaceDetector<M> {
    pub fn new(model: M, config: DetectionConfig) -> Self {
        Self { model, config }
    }

    #[cfg(test)]
    pub(crate) fn model(&self) -> &M {
        &self.model
    }

    /// Detect faces, returning confirmed detections in source pixels.
    ///
    /// A zero-size image yields no detections.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let max_face_distance = image.width() as f32 * self.config.max_face_distance_percent;
        let pass1 = self.estimate_faces(image)?;
        tracing::debug!(count = pass1.len(), "pass 1 detections");

        let mut detections = Vec::with_capacity(pass1.len());
        for pass1_detection in &pass1 {
            let Some(selected) = self.second_pass(image, pass1_detection)? else {
                tracing::debug!(
                    probability = pass1_detection.probability,
                    "pass 1 detection not confirmed by pass 2"
                );
                continue;
            };

            // A face whose pass-1 score would have passed can still fall
            // below the cut in pass 2; pass 2 is authoritative.
            if selected.probability >= self.config.score_threshold_final {
                detections.push(selected);
            }
        }

        let result = dedupe(detections, max_face_distance);
        tracing::debug!(count = result.len(), "final detections");
        Ok(result)
    }

    /// One model pass over an arbitrary image, mapped back to its pixels.
    fn estimate_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, scale) = bitmap::resize_to_square(image, self.model.input_size());
        let (w, h) = (image.width() as f32, image.height() as f32);
        let to_image = compute_transform_to_box(
            &BBox::new(0.0, 0.0, w * scale, h * scale),
            &BBox::new(0.0, 0.0, w, h),
        );

        Ok(self
            .model
            .infer(&input)?
            .iter()
            .map(|d| d.transform(&to_image))
            .collect())
    }

    /// Re-detect around a pass-1 hit; returns the pass-2 detection in source
    /// pixels, or `None` if pass 2 finds nothing there.
    fn second_pass(
        &mut self,
        image: &RgbImage,
        pass1: &FaceDetection,
    ) -> Result<Option<FaceDetection>, DetectorError> {
        let image_box = pass1.bbox.enlarge(PASS2_ENLARGE);
        let (face_image, crop_scale) =
            bitmap::crop(image, &image_box, self.model.input_size() / 2);
        if crop_scale <= 0.0 {
            return Ok(None);
        }
        let (padded, offset) = bitmap::add_padding(&face_image, PASS2_PADDING);

        // padded pixels → crop pixels → source pixels
        let to_source = CoordinateTransform::translation(-offset.x, -offset.y)
            .then(&CoordinateTransform::scaling(1.0 / crop_scale))
            .then(&CoordinateTransform::translation(image_box.x, image_box.y));

        let pass2: Vec<FaceDetection> = self
            .estimate_faces(&padded)?
            .iter()
            .map(|d| d.transform(&to_source))
            .collect();

        if pass2.len() > 1 {
            tracing::debug!(count = pass2.len(), "pass 2 found several faces, taking nearest");
        }
        Ok(nearest_detection(pass1, &pass2).map(|i| pass2[i].clone()))
    }
}

/// Index of the candidate whose box centre is nearest to `reference`'s.
/// Equal distances resolve to the lowest index.
pub fn nearest_detection(reference: &FaceDetection, candidates: &[FaceDetection]) -> Option<usize> {
    let center = reference.center();
    let mut best: Option<(usize, f32)> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        let d = euclidean(center, candidate.center());
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((i, d)),
        }
    }
    best.map(|(i, _)| i)
}
