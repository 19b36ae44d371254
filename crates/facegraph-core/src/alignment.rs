//! Face alignment via a two-eye similarity transform.
//!
//! The eye line is rotated level, scaled so the inter-ocular distance matches
//! the canonical one, and translated so the eyes land on the canonical
//! positions of a `desired_face_size` square.

use crate::config::AlignmentConfig;
use crate::geometry::{euclidean, BBox, CoordinateTransform, Point};
use crate::types::{AlignedFace, FaceDetection};
use thiserror::Error;

/// Eyes closer than this (source pixels) cannot define an orientation.
const MIN_EYE_DISTANCE: f32 = 1e-3;

#[derive(Error, Debug, PartialEq)]
pub enum AlignError {
    #[error("degenerate landmarks: {0}")]
    DegenerateLandmarks(&'static str),
}

/// Align one detection. `landmarks[0]` is the eye on the left of the image,
/// `landmarks[1]` the one on the right.
pub fn align(detection: &FaceDetection, config: &AlignmentConfig) -> Result<AlignedFace, AlignError> {
    let [left_eye, right_eye] = match detection.landmarks.as_slice() {
        [l, r, ..] => [*l, *r],
        _ => return Err(AlignError::DegenerateLandmarks("need both eye landmarks")),
    };

    let distance = euclidean(left_eye, right_eye);
    if !(distance > MIN_EYE_DISTANCE) {
        return Err(AlignError::DegenerateLandmarks("eye landmarks coincide"));
    }

    let size = config.desired_face_size as f32;
    let angle = (right_eye.y - left_eye.y).atan2(right_eye.x - left_eye.x);
    let scale = (1.0 - 2.0 * config.left_eye_x) * size / distance;
    let eyes_center = left_eye.midpoint(&right_eye);

    let alignment = CoordinateTransform::translation(-eyes_center.x, -eyes_center.y)
        .then(&CoordinateTransform::rotation(-angle))
        .then(&CoordinateTransform::scaling(scale))
        .then(&CoordinateTransform::translation(0.5 * size, config.left_eye_y * size));

    let face_center = alignment.inverse().apply(Point::new(size / 2.0, size / 2.0));
    let aligned_box = BBox::square_around(face_center, size / scale);

    tracing::trace!(angle, scale, ?aligned_box, "aligned face");

    Ok(AlignedFace {
        detection: detection.clone(),
        alignment,
        aligned_box,
        rotation: angle,
    })
}
