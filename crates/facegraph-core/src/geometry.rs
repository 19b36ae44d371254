//! Boxes, points and similarity transforms between coordinate spaces.
//!
//! A detection travels through several spaces before it is stored: the
//! source image, the square detector input, the padded second-pass crop and
//! finally the canonical aligned face. All transforms here are uniform-scale
//! similarities, so any chain of them stays invertible.

use serde::{Deserialize, Serialize};

/// A 2D point.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }
}

/// Euclidean distance between two points.
pub fn euclidean(a: Point, b: Point) -> f32 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// Axis-aligned box. Width and height are never negative.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1.min(x2), y1.min(y2), (x2 - x1).abs(), (y2 - y1).abs())
    }

    /// Square box of side `side` centred on `center`.
    pub fn square_around(center: Point, side: f32) -> Self {
        Self::new(center.x - side / 2.0, center.y - side / 2.0, side, side)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x <= self.right() && p.y >= self.y && p.y <= self.bottom()
    }

    /// Scale width and height by `factor`, keeping the centre fixed.
    pub fn enlarge(&self, factor: f32) -> BBox {
        let c = self.center();
        let w = self.width * factor;
        let h = self.height * factor;
        BBox::new(c.x - w / 2.0, c.y - h / 2.0, w, h)
    }

    /// Add `fraction` of the size on every side (`enlarge(1 + 2 * fraction)`).
    pub fn pad(&self, fraction: f32) -> BBox {
        self.enlarge(1.0 + 2.0 * fraction)
    }

    /// Multiply every component by `scale` (a change of pixel unit).
    pub fn rescale(&self, scale: f32) -> BBox {
        BBox::new(
            self.x * scale,
            self.y * scale,
            self.width * scale,
            self.height * scale,
        )
    }

    pub fn shift(&self, dx: f32, dy: f32) -> BBox {
        BBox::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Snap origin and size to whole pixels.
    pub fn round(&self) -> BBox {
        BBox::new(
            self.x.round(),
            self.y.round(),
            self.width.round(),
            self.height.round(),
        )
    }

    fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x, self.y),
            Point::new(self.right(), self.y),
            Point::new(self.x, self.bottom()),
            Point::new(self.right(), self.bottom()),
        ]
    }
}

/// Similarity transform `p' = scale * R(rotation) * p + t`.
///
/// `rotation` is in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateTransform {
    pub scale: f32,
    pub rotation: f32,
    pub translate_x: f32,
    pub translate_y: f32,
}

impl Default for CoordinateTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl CoordinateTransform {
    pub const fn identity() -> Self {
        Self {
            scale: 1.0,
            rotation: 0.0,
            translate_x: 0.0,
            translate_y: 0.0,
        }
    }

    pub const fn translation(dx: f32, dy: f32) -> Self {
        Self {
            scale: 1.0,
            rotation: 0.0,
            translate_x: dx,
            translate_y: dy,
        }
    }

    pub const fn scaling(scale: f32) -> Self {
        Self {
            scale,
            rotation: 0.0,
            translate_x: 0.0,
            translate_y: 0.0,
        }
    }

    pub const fn rotation(angle: f32) -> Self {
        Self {
            scale: 1.0,
            rotation: angle,
            translate_x: 0.0,
            translate_y: 0.0,
        }
    }

    /// Rotation by `angle` about `center`.
    pub fn rotation_about(angle: f32, center: Point) -> Self {
        Self::translation(-center.x, -center.y)
            .then(&Self::rotation(angle))
            .then(&Self::translation(center.x, center.y))
    }

    pub fn apply(&self, p: Point) -> Point {
        let (sin, cos) = self.rotation.sin_cos();
        Point::new(
            self.scale * (cos * p.x - sin * p.y) + self.translate_x,
            self.scale * (sin * p.x + cos * p.y) + self.translate_y,
        )
    }

    pub fn apply_points(&self, points: &[Point]) -> Vec<Point> {
        points.iter().map(|&p| self.apply(p)).collect()
    }

    /// Axis-aligned bounds of the transformed box. Exact when the transform
    /// has no rotation.
    pub fn apply_box(&self, b: &BBox) -> BBox {
        let mapped = b.corners().map(|c| self.apply(c));
        let (mut x1, mut y1) = (f32::INFINITY, f32::INFINITY);
        let (mut x2, mut y2) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
        for p in mapped {
            x1 = x1.min(p.x);
            y1 = y1.min(p.y);
            x2 = x2.max(p.x);
            y2 = y2.max(p.y);
        }
        BBox::from_corners(x1, y1, x2, y2)
    }

    /// Composition: apply `self`, then `next`.
    pub fn then(&self, next: &CoordinateTransform) -> CoordinateTransform {
        let t = next.apply(Point::new(self.translate_x, self.translate_y));
        CoordinateTransform {
            scale: self.scale * next.scale,
            rotation: self.rotation + next.rotation,
            translate_x: t.x,
            translate_y: t.y,
        }
    }

    pub fn inverse(&self) -> CoordinateTransform {
        let inv_scale = if self.scale != 0.0 { 1.0 / self.scale } else { 0.0 };
        let undo = CoordinateTransform {
            scale: inv_scale,
            rotation: -self.rotation,
            translate_x: 0.0,
            translate_y: 0.0,
        };
        let t = undo.apply(Point::new(self.translate_x, self.translate_y));
        CoordinateTransform {
            translate_x: -t.x,
            translate_y: -t.y,
            ..undo
        }
    }

    pub fn approx_eq(&self, other: &CoordinateTransform, eps: f32) -> bool {
        (self.scale - other.scale).abs() < eps
            && (self.rotation - other.rotation).abs() < eps
            && (self.translate_x - other.translate_x).abs() < eps
            && (self.translate_y - other.translate_y).abs() < eps
    }
}

/// Transform mapping `from` onto `to` (uniform scale taken from the widths).
pub fn compute_transform_to_box(from: &BBox, to: &BBox) -> CoordinateTransform {
    let scale = if from.width > 0.0 { to.width / from.width } else { 1.0 };
    CoordinateTransform {
        scale,
        rotation: 0.0,
        translate_x: to.x - from.x * scale,
        translate_y: to.y - from.y * scale,
    }
}
