//! Pixel operations on decoded RGB images: resize, crop, pad, rotate.
//!
//! Every operation that moves pixels between coordinate spaces goes through
//! [`warp_similarity`], so the geometry used to build an image and the
//! geometry used to map detections back out of it are the same transform.

use crate::geometry::{BBox, CoordinateTransform, Point};
use image::{imageops, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// Warp `image` into a new `out_width × out_height` image.
///
/// Each output pixel centre is mapped through `output_to_source` and sampled
/// with bilinear interpolation. Samples outside the source are black.
pub fn warp_similarity(
    image: &RgbImage,
    output_to_source: &CoordinateTransform,
    out_width: u32,
    out_height: u32,
) -> RgbImage {
    let mut output = RgbImage::new(out_width, out_height);
    if image.width() == 0 || image.height() == 0 {
        return output;
    }

    for (ox, oy, pixel) in output.enumerate_pixels_mut() {
        let src = output_to_source.apply(Point::new(ox as f32 + 0.5, oy as f32 + 0.5));
        if let Some(rgb) = sample_bilinear(image, src.x, src.y) {
            *pixel = Rgb(rgb);
        }
    }

    output
}

/// Sample at continuous coordinates where pixel `i` covers `[i, i + 1)`.
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Option<[u8; 3]> {
    let w = image.width() as i64;
    let h = image.height() as i64;
    // Written so that NaN falls through to None.
    if !(x >= 0.0 && y >= 0.0 && x < w as f32 && y < h as f32) {
        return None;
    }

    let fx = x - 0.5;
    let fy = y - 0.5;
    let x0 = fx.floor();
    let y0 = fy.floor();
    let tx = fx - x0;
    let ty = fy - y0;

    let cx = |v: i64| v.clamp(0, w - 1) as u32;
    let cy = |v: i64| v.clamp(0, h - 1) as u32;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let tl = image.get_pixel(cx(x0), cy(y0));
    let tr = image.get_pixel(cx(x0 + 1), cy(y0));
    let bl = image.get_pixel(cx(x0), cy(y0 + 1));
    let br = image.get_pixel(cx(x0 + 1), cy(y0 + 1));

    let mut out = [0u8; 3];
    for c in 0..3 {
        let val = tl[c] as f32 * (1.0 - tx) * (1.0 - ty)
            + tr[c] as f32 * tx * (1.0 - ty)
            + bl[c] as f32 * (1.0 - tx) * ty
            + br[c] as f32 * tx * ty;
        out[c] = val.round().clamp(0.0, 255.0) as u8;
    }
    Some(out)
}

/// Fit `image` into a black `size × size` canvas anchored at the top-left,
/// preserving aspect ratio.
///
/// Returns the canvas and the scale applied, so that canvas coordinates map
/// back to source coordinates with `scaling(1 / scale)`.
pub fn resize_to_square(image: &RgbImage, size: u32) -> (RgbImage, f32) {
    let mut canvas = RgbImage::new(size, size);
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || size == 0 {
        return (canvas, 0.0);
    }

    let scale = size as f32 / w.max(h) as f32;
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);
    let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);
    imageops::replace(&mut canvas, &resized, 0, 0);

    (canvas, scale)
}

/// Extract `region`, scaled so its longer side becomes `max_size` pixels.
///
/// Returns the crop and the scale applied. An empty region yields an empty
/// image and a scale of zero.
pub fn crop(image: &RgbImage, region: &BBox, max_size: u32) -> (RgbImage, f32) {
    if region.is_empty() || max_size == 0 {
        return (RgbImage::new(0, 0), 0.0);
    }

    let scale = max_size as f32 / region.width.max(region.height);
    let out_w = ((region.width * scale).round() as u32).max(1);
    let out_h = ((region.height * scale).round() as u32).max(1);
    let to_source = CoordinateTransform::scaling(1.0 / scale)
        .then(&CoordinateTransform::translation(region.x, region.y));

    (warp_similarity(image, &to_source, out_w, out_h), scale)
}

/// Mapping from the pixels of a rotated crop of `region` back to the source.
///
/// The crop shows `region` after undoing `rotation` about the region centre,
/// at `out_width / region.width` pixels per source pixel.
pub fn crop_transform(region: &BBox, rotation: f32, out_width: u32) -> CoordinateTransform {
    let unit = if out_width > 0 {
        region.width / out_width as f32
    } else {
        0.0
    };
    CoordinateTransform::scaling(unit)
        .then(&CoordinateTransform::translation(region.x, region.y))
        .then(&CoordinateTransform::rotation_about(rotation, region.center()))
}

/// Extract `region` with rotation correction, `out_width` pixels wide.
pub fn crop_with_rotation(
    image: &RgbImage,
    region: &BBox,
    rotation: f32,
    out_width: u32,
) -> RgbImage {
    if region.is_empty() || out_width == 0 {
        return RgbImage::new(0, 0);
    }
    let out_height = ((region.height * out_width as f32 / region.width).round() as u32).max(1);
    let to_source = crop_transform(region, rotation, out_width);
    warp_similarity(image, &to_source, out_width, out_height)
}

/// Centre `image` on a black canvas `1 + 2 * fraction` times its size.
///
/// Returns the canvas and the offset of the original image inside it.
pub fn add_padding(image: &RgbImage, fraction: f32) -> (RgbImage, Point) {
    let (w, h) = image.dimensions();
    let factor = 1.0 + 2.0 * fraction.max(0.0);
    let new_w = ((w as f32 * factor).round() as u32).max(w);
    let new_h = ((h as f32 * factor).round() as u32).max(h);
    let off_x = (new_w - w) / 2;
    let off_y = (new_h - h) / 2;

    let mut canvas = RgbImage::new(new_w, new_h);
    imageops::replace(&mut canvas, image, off_x as i64, off_y as i64);

    (canvas, Point::new(off_x as f32, off_y as f32))
}

/// Encode an image as PNG bytes (used to cache face crops).
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

pub fn decode_png(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory_with_format(bytes, ImageFormat::Png)?.to_rgb8())
}
