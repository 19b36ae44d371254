//! Face crops: the cached padded thumbnail, and the canonical face image fed
//! to the embedding model.
//!
//! The canonical face can be warped either from the full source image or
//! from a cached crop. Both paths compose the same similarity transforms, so
//! they agree up to resampling error; the sync pipeline always embeds from
//! the crop so that a re-embed never needs the original photo.

use crate::bitmap;
use crate::config::AlignmentConfig;
use crate::types::{AlignedFace, FaceCrop};
use image::RgbImage;

/// Padded, rotation-corrected crop around an aligned face, `crop_max_size`
/// pixels wide.
pub fn crop(image: &RgbImage, aligned: &AlignedFace, config: &AlignmentConfig) -> FaceCrop {
    let source_box = aligned.aligned_box.pad(config.padding).round();
    let crop_image = bitmap::crop_with_rotation(image, &source_box, aligned.rotation, config.crop_max_size);
    FaceCrop {
        image: crop_image,
        source_box,
        rotation: aligned.rotation,
    }
}

/// Canonical `desired_face_size` face, warped straight from the source image.
pub fn extract_aligned(image: &RgbImage, aligned: &AlignedFace, config: &AlignmentConfig) -> RgbImage {
    let size = config.desired_face_size;
    bitmap::warp_similarity(image, &aligned.alignment.inverse(), size, size)
}

/// Canonical `desired_face_size` face, warped from a cached crop.
///
/// Canonical pixels are taken to source pixels by the inverse alignment and
/// from there into crop pixels by the inverse crop transform.
pub fn extract_from_crop(crop: &FaceCrop, aligned: &AlignedFace, config: &AlignmentConfig) -> RgbImage {
    let size = config.desired_face_size;
    let crop_to_source = bitmap::crop_transform(&crop.source_box, crop.rotation, crop.image.width());
    let canonical_to_crop = aligned.alignment.inverse().then(&crop_to_source.inverse());
    bitmap::warp_similarity(&crop.image, &canonical_to_crop, size, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::align;
    use crate::geometry::{BBox, Point};
    use crate::types::FaceDetection;
    use image::Rgb;

    /// Smooth image so that resampling differences stay small.
    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                (x * 255 / w.max(1)) as u8,
                (y * 255 / h.max(1)) as u8,
                ((x + y) * 127 / (w + h).max(1)) as u8,
            ])
        })
    }

    fn tilted_face() -> AlignedFace {
        let det = FaceDetection {
            bbox: BBox::new(140.0, 150.0, 120.0, 130.0),
            landmarks: vec![Point::new(170.0, 190.0), Point::new(230.0, 200.0)],
            probability: 0.95,
        };
        align(&det, &AlignmentConfig::default()).unwrap()
    }

    #[test]
    fn test_crop_geometry() {
        let config = AlignmentConfig::default();
        let image = gradient(400, 400);
        let aligned = tilted_face();
        let face_crop = crop(&image, &aligned, &config);

        assert_eq!(face_crop.image.width(), config.crop_max_size);
        assert_eq!(face_crop.image.height(), config.crop_max_size);
        assert_eq!(face_crop.rotation, aligned.rotation);
        assert_eq!(face_crop.source_box, face_crop.source_box.round());
        let expected = aligned.aligned_box.pad(config.padding);
        assert!((face_crop.source_box.width - expected.width).abs() <= 1.0);
    }

    #[test]
    fn test_crop_centre_matches_source() {
        let config = AlignmentConfig::default();
        let image = gradient(400, 400);
        let aligned = tilted_face();
        let face_crop = crop(&image, &aligned, &config);

        // rotation about the box centre leaves the centre pixel in place
        let c = face_crop.source_box.center();
        let expected = image.get_pixel(c.x as u32, c.y as u32);
        let got = face_crop.image.get_pixel(config.crop_max_size / 2, config.crop_max_size / 2);
        for ch in 0..3 {
            assert!((expected[ch] as i32 - got[ch] as i32).abs() <= 3, "{expected:?} vs {got:?}");
        }
    }

    #[test]
    fn test_extract_from_crop_matches_direct() {
        let config = AlignmentConfig::default();
        let image = gradient(400, 400);
        let aligned = tilted_face();

        let direct = extract_aligned(&image, &aligned, &config);
        let face_crop = crop(&image, &aligned, &config);
        let via_crop = extract_from_crop(&face_crop, &aligned, &config);

        assert_eq!(direct.dimensions(), (112, 112));
        assert_eq!(via_crop.dimensions(), (112, 112));
        let max_diff = direct
            .pixels()
            .zip(via_crop.pixels())
            .flat_map(|(a, b)| (0..3).map(move |c| (a[c] as i32 - b[c] as i32).abs()))
            .max()
            .unwrap_or(0);
        assert!(max_diff <= 3, "max per-channel difference {max_diff}");
    }

    #[test]
    fn test_extract_aligned_places_eyes() {
        let config = AlignmentConfig::default();
        // two bright dots at the eye positions on a dark background
        let left = Point::new(170.0, 190.0);
        let right = Point::new(230.0, 200.0);
        let image = RgbImage::from_fn(400, 400, |x, y| {
            let p = Point::new(x as f32 + 0.5, y as f32 + 0.5);
            let near = |e: Point| crate::geometry::euclidean(p, e) < 4.0;
            if near(left) || near(right) {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let aligned = tilted_face();
        let face = extract_aligned(&image, &aligned, &config);

        let s = config.desired_face_size as f32;
        let lx = (config.left_eye_x * s) as u32;
        let rx = ((1.0 - config.left_eye_x) * s) as u32;
        let y = (config.left_eye_y * s) as u32;
        assert!(face.get_pixel(lx, y)[0] > 128);
        assert!(face.get_pixel(rx, y)[0] > 128);
        assert!(face.get_pixel(56, 100)[0] < 32);
    }
}
