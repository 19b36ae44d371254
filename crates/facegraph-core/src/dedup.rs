//! Proximity-based suppression of duplicate detections.
//!
//! The two-pass detector can report one face twice: two pass-1 boxes around
//! the same face both converge on it in pass 2. Boxes of neighbouring faces
//! legitimately overlap at different scales, so duplicates are recognised by
//! centre distance rather than IoU.

use crate::geometry::euclidean;
use crate::types::FaceDetection;

/// Keep the most probable detection of every group whose box centres lie
/// closer than `max_distance` to each other.
///
/// Detections are visited in descending probability order (ties keep input
/// order); a detection survives only if no already-kept one is within
/// `max_distance`.
pub fn dedupe(mut detections: Vec<FaceDetection>, max_distance: f32) -> Vec<FaceDetection> {
    detections.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceDetection> = Vec::with_capacity(detections.len());
    for det in detections {
        let center = det.center();
        let duplicate = keep
            .iter()
            .any(|kept| euclidean(kept.center(), center) < max_distance);
        if duplicate {
            tracing::trace!(probability = det.probability, "dropping duplicate detection");
        } else {
            keep.push(det);
        }
    }

    keep
}
