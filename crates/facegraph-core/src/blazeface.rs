//! BlazeFace (back-camera variant) detection model via ONNX Runtime.
//!
//! 256×256 RGB input, 896 anchors over two feature maps (16×16 with 2 anchors
//! per cell, 8×8 with 6), 16 regressors per anchor: box centre offset and
//! size, then six landmark offsets, all in input pixels.

use crate::config::DetectionConfig;
use crate::detector::{DetectionModel, DetectorError};
use crate::geometry::{BBox, Point};
use crate::types::FaceDetection;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const BLAZEFACE_INPUT_SIZE: u32 = 256;
const BLAZEFACE_MEAN: f32 = 127.5;
const BLAZEFACE_STD: f32 = 127.5;
const BLAZEFACE_REGRESSORS: usize = 16;
const BLAZEFACE_LANDMARKS: usize = 6;
/// (feature map size, anchors per cell)
const BLAZEFACE_LAYERS: [(usize, usize); 2] = [(16, 2), (8, 6)];
/// Raw logits are clamped before the sigmoid.
const BLAZEFACE_SCORE_CLIP: f32 = 100.0;

/// Anchor centre in normalised [0, 1] input coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Anchor {
    cx: f32,
    cy: f32,
}

/// Anchors in model output order: per layer, row-major cells, then the
/// anchors of each cell.
fn generate_anchors() -> Vec<Anchor> {
    let mut anchors = Vec::new();
    for (fm, per_cell) in BLAZEFACE_LAYERS {
        for y in 0..fm {
            for x in 0..fm {
                let anchor = Anchor {
                    cx: (x as f32 + 0.5) / fm as f32,
                    cy: (y as f32 + 0.5) / fm as f32,
                };
                anchors.extend(std::iter::repeat(anchor).take(per_cell));
            }
        }
    }
    anchors
}

/// BlazeFace model session plus decoding parameters.
pub struct BlazeFace {
    session: Session,
    anchors: Vec<Anchor>,
    /// (regressors, classificators) output indices.
    output_indices: (usize, usize),
    score_threshold: f32,
    iou_threshold: f32,
    max_faces: usize,
}

impl BlazeFace {
    /// Load the BlazeFace ONNX model from the given path.
    ///
    /// Scores are cut at the first-pass threshold: the second pass reuses the
    /// same model and the final threshold is applied by the two-pass detector.
    pub fn load(model_path: &str, config: &DetectionConfig) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }
        if config.input_size != BLAZEFACE_INPUT_SIZE {
            return Err(DetectorError::InferenceFailed(format!(
                "BlazeFace expects {BLAZEFACE_INPUT_SIZE}px input, configured {}",
                config.input_size
            )));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded BlazeFace model"
        );

        if output_names.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "BlazeFace model requires 2 outputs (regressors, classificators), got {}",
                output_names.len()
            )));
        }

        let output_indices = discover_output_indices(&output_names);
        tracing::debug!(?output_indices, "BlazeFace output tensor mapping");

        Ok(Self {
            session,
            anchors: generate_anchors(),
            output_indices,
            score_threshold: config.score_threshold_pass1,
            iou_threshold: config.iou_threshold,
            max_faces: config.max_faces,
        })
    }

    /// NCHW float tensor normalised to [-1, 1].
    fn preprocess(input: &RgbImage) -> Array4<f32> {
        let (w, h) = input.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
        for (x, y, pixel) in input.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - BLAZEFACE_MEAN) / BLAZEFACE_STD;
            }
        }
        tensor
    }
}

impl DetectionModel for BlazeFace {
    fn input_size(&self) -> u32 {
        BLAZEFACE_INPUT_SIZE
    }

    fn infer(&mut self, input: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError> {
        if input.dimensions() != (BLAZEFACE_INPUT_SIZE, BLAZEFACE_INPUT_SIZE) {
            return Err(DetectorError::InferenceFailed(format!(
                "input must be {BLAZEFACE_INPUT_SIZE}x{BLAZEFACE_INPUT_SIZE}, got {}x{}",
                input.width(),
                input.height()
            )));
        }

        let tensor = Self::preprocess(input);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?;

        let (reg_idx, cls_idx) = self.output_indices;
        let (_, regressors) = outputs[reg_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("regressors: {e}")))?;
        let (_, scores) = outputs[cls_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("classificators: {e}")))?;

        let detections = decode(
            regressors,
            scores,
            &self.anchors,
            BLAZEFACE_INPUT_SIZE as f32,
            self.score_threshold,
        );
        let mut result = nms(detections, self.iou_threshold);
        result.truncate(self.max_faces);
        Ok(result)
    }
}

/// Discover (regressors, classificators) output indices by name.
///
/// MediaPipe exports name them "regressors" and "classificators"; other
/// converters emit generic names, in which case the standard positional
/// ordering [0] = regressors, [1] = classificators is assumed.
fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let find = |needle: &str| names.iter().position(|n| n.to_lowercase().contains(needle));

    match (find("regressor"), find("classificator")) {
        (Some(reg), Some(cls)) => {
            tracing::info!("BlazeFace: using name-based output tensor mapping");
            (reg, cls)
        }
        _ => {
            tracing::info!(
                ?names,
                "BlazeFace: output names not recognized, using positional mapping [0]=regressors, [1]=classificators"
            );
            (0, 1)
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x.clamp(-BLAZEFACE_SCORE_CLIP, BLAZEFACE_SCORE_CLIP)).exp())
}

/// Decode raw model output into detections in input pixels.
fn decode(
    regressors: &[f32],
    scores: &[f32],
    anchors: &[Anchor],
    input_size: f32,
    threshold: f32,
) -> Vec<FaceDetection> {
    let mut detections = Vec::new();

    for (idx, anchor) in anchors.iter().enumerate() {
        let score = sigmoid(scores.get(idx).copied().unwrap_or(f32::NEG_INFINITY));
        if score < threshold {
            continue;
        }

        let off = idx * BLAZEFACE_REGRESSORS;
        let Some(raw) = regressors.get(off..off + BLAZEFACE_REGRESSORS) else {
            continue;
        };

        let ax = anchor.cx * input_size;
        let ay = anchor.cy * input_size;
        let cx = raw[0] + ax;
        let cy = raw[1] + ay;
        let w = raw[2];
        let h = raw[3];
        if w <= 0.0 || h <= 0.0 {
            continue;
        }

        let landmarks = (0..BLAZEFACE_LANDMARKS)
            .map(|k| Point::new(raw[4 + 2 * k] + ax, raw[5 + 2 * k] + ay))
            .collect();

        detections.push(FaceDetection {
            bbox: BBox::new(cx - w / 2.0, cy - h / 2.0, w, h),
            landmarks,
            probability: score,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections, highest score first.
fn nms(mut detections: Vec<FaceDetection>, iou_threshold: f32) -> Vec<FaceDetection> {
    detections.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i].bbox, &detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two boxes.
fn iou(a: &BBox, b: &BBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = a.right().min(b.right());
    let y2 = a.bottom().min(b.bottom());

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
