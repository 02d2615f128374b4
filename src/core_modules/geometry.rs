// THEORY:
// The `geometry` module is the foundation of the placement layer. Every box the
// pipeline touches lives in exactly one of three coordinate spaces: the
// detector's normalized, bottom-left-origin unit square; the top-left-origin
// pixel grid of a captured image; and the top-left-origin point space of the
// hosting view. Confusing one space for another is the easiest way to draw an
// overlay in the wrong place, so the space is part of the type.
//
// Key architectural principles:
// 1.  **Typed Spaces**: `Rect<S>` and `Quad<S>` carry a zero-sized marker type.
//     A `Rect<ScreenView>` cannot be handed to a function that expects a
//     `Rect<DetectorNormalized>`. Crossing spaces is the job of the
//     `CoordinateMapper`, which is the only caller of `cast_space`.
// 2.  **Purity**: Every function here is total and side-effect free. Degenerate
//     inputs (zero area, empty sizes) produce zero results, never panics.
// 3.  **Affine Algebra**: `AffineTransform` follows the usual 2x3 convention
//     (`x' = a*x + c*y + tx`, `y' = b*x + d*y + ty`) and composes left to right
//     with `then`, so `q.apply_affine(&t1).apply_affine(&t2)` equals
//     `q.apply_affine(&t1.then(&t2))`.
// 4.  **Corner Convention**: A quad's "top" corners are the two with the
//     smaller y value, whatever the space's origin. `reorganize` restores that
//     ordering after rotations or flips scramble it.

use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};
use std::fmt;
use std::marker::PhantomData;

/// Tolerance used for floating point comparisons throughout the crate.
pub const EPSILON: f64 = 1e-9;

/// A marker for one of the coordinate spaces a box can live in.
pub trait CoordinateSpace:
    Copy + Clone + fmt::Debug + Default + PartialEq + Send + Sync + 'static
{
    const NAME: &'static str;
}

/// Detector output space: unit square over the visible video region, origin bottom-left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DetectorNormalized;

/// Pixel grid of a captured image, origin top-left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ImagePixel;

/// Point space of the hosting view after the video layer transform, origin top-left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ScreenView;

impl CoordinateSpace for DetectorNormalized {
    const NAME: &'static str = "detector-normalized";
}

impl CoordinateSpace for ImagePixel {
    const NAME: &'static str = "image-pixel";
}

impl CoordinateSpace for ScreenView {
    const NAME: &'static str = "screen-view";
}

fn approx(a: f64, b: f64, eps: f64) -> bool {
    (a - b).abs() <= eps
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn approx_eq(&self, other: &Point, eps: f64) -> bool {
        approx(self.x, other.x, eps) && approx(self.y, other.y, eps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// True when either dimension is not strictly positive.
    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }

    /// The same size with width and height swapped (a quarter turn).
    pub fn transposed(&self) -> Self {
        Self::new(self.height, self.width)
    }
}

/// A 2D affine transform in the 2x3 `[a c tx; b d ty]` convention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform {
    pub const fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub const fn scale(sx: f64, sy: f64) -> Self {
        Self {
            a: sx,
            b: 0.0,
            c: 0.0,
            d: sy,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub const fn translate(tx: f64, ty: f64) -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            tx,
            ty,
        }
    }

    /// Counter-clockwise rotation (in a y-up frame) by `angle` radians about the origin.
    pub fn rotate(angle: f64) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self {
            a: cos,
            b: sin,
            c: -sin,
            d: cos,
            tx: 0.0,
            ty: 0.0,
        }
    }

    /// Returns the transform that applies `self` first and `next` second.
    pub fn then(&self, next: &AffineTransform) -> Self {
        Self {
            a: next.a * self.a + next.c * self.b,
            b: next.b * self.a + next.d * self.b,
            c: next.a * self.c + next.c * self.d,
            d: next.b * self.c + next.d * self.d,
            tx: next.a * self.tx + next.c * self.ty + next.tx,
            ty: next.b * self.tx + next.d * self.ty + next.ty,
        }
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    /// The inverse transform, or `None` when the transform collapses the plane.
    pub fn invert(&self) -> Option<Self> {
        let det = self.determinant();
        if det.abs() < EPSILON {
            return None;
        }
        let a = self.d / det;
        let b = -self.b / det;
        let c = -self.c / det;
        let d = self.a / det;
        Some(Self {
            a,
            b,
            c,
            d,
            tx: -(a * self.tx + c * self.ty),
            ty: -(b * self.tx + d * self.ty),
        })
    }

    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x + self.c * p.y + self.tx,
            self.b * p.x + self.d * p.y + self.ty,
        )
    }

    pub fn approx_eq(&self, other: &AffineTransform, eps: f64) -> bool {
        approx(self.a, other.a, eps)
            && approx(self.b, other.b, eps)
            && approx(self.c, other.c, eps)
            && approx(self.d, other.d, eps)
            && approx(self.tx, other.tx, eps)
            && approx(self.ty, other.ty, eps)
    }
}

/// An axis-aligned rectangle, stored as its minimum corner plus a size.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Rect<S: CoordinateSpace> {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(skip)]
    space: PhantomData<S>,
}

impl<S: CoordinateSpace> Rect<S> {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            space: PhantomData,
        }
    }

    pub const fn unit() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    /// The smallest rect containing both points.
    pub fn from_corners(p: Point, q: Point) -> Self {
        let x = p.x.min(q.x);
        let y = p.y.min(q.y);
        Self::new(x, y, (p.x - q.x).abs(), (p.y - q.y).abs())
    }

    /// The same rect with negative extents folded back into positive ones.
    pub fn standardized(&self) -> Self {
        Self::from_corners(self.origin(), Point::new(self.max_x(), self.max_y()))
    }

    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn min_x(&self) -> f64 {
        self.x.min(self.x + self.width)
    }

    pub fn max_x(&self) -> f64 {
        self.x.max(self.x + self.width)
    }

    pub fn min_y(&self) -> f64 {
        self.y.min(self.y + self.height)
    }

    pub fn max_y(&self) -> f64 {
        self.y.max(self.y + self.height)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Area, or zero for rects with a non-positive extent.
    pub fn area(&self) -> f64 {
        if self.size().is_empty() {
            0.0
        } else {
            self.width * self.height
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.area() <= 0.0
    }

    pub fn contains_point(&self, p: Point) -> bool {
        p.x >= self.min_x() && p.x <= self.max_x() && p.y >= self.min_y() && p.y <= self.max_y()
    }

    /// The overlapping region, or `None` when the rects do not overlap with positive area.
    pub fn intersection(&self, other: &Rect<S>) -> Option<Rect<S>> {
        let x0 = self.min_x().max(other.min_x());
        let y0 = self.min_y().max(other.min_y());
        let x1 = self.max_x().min(other.max_x());
        let y1 = self.max_y().min(other.max_y());
        if x1 - x0 <= 0.0 || y1 - y0 <= 0.0 {
            return None;
        }
        Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
    }

    pub fn union_bounds(&self, other: &Rect<S>) -> Rect<S> {
        let x0 = self.min_x().min(other.min_x());
        let y0 = self.min_y().min(other.min_y());
        let x1 = self.max_x().max(other.max_x());
        let y1 = self.max_y().max(other.max_y());
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Intersection over union, in `[0, 1]`. Zero when either rect has no area.
    pub fn iou(&self, other: &Rect<S>) -> f64 {
        let (area_a, area_b) = (self.area(), other.area());
        if area_a <= 0.0 || area_b <= 0.0 {
            return 0.0;
        }
        let inter = self.intersection(other).map_or(0.0, |r| r.area());
        let union = area_a + area_b - inter;
        if union <= 0.0 {
            0.0
        } else {
            (inter / union).clamp(0.0, 1.0)
        }
    }

    /// Switches between bottom-left-origin and top-left-origin conventions
    /// for a surface `height` units tall: `y' = height - y - h`.
    pub fn flip_vertical(&self, height: f64) -> Rect<S> {
        Rect::new(self.x, height - self.y - self.height, self.width, self.height)
    }

    pub fn to_quad(&self) -> Quad<S> {
        let r = self.standardized();
        Quad::new(
            Point::new(r.min_x(), r.min_y()),
            Point::new(r.max_x(), r.min_y()),
            Point::new(r.max_x(), r.max_y()),
            Point::new(r.min_x(), r.max_y()),
        )
    }

    pub fn approx_eq(&self, other: &Rect<S>, eps: f64) -> bool {
        approx(self.x, other.x, eps)
            && approx(self.y, other.y, eps)
            && approx(self.width, other.width, eps)
            && approx(self.height, other.height, eps)
    }

    /// Reinterprets the numbers in another space. Only the mapper may do this.
    pub(crate) fn cast_space<T: CoordinateSpace>(&self) -> Rect<T> {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

/// A quadrilateral with named corners, ordered clockwise from the top-left.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quad<S: CoordinateSpace> {
    pub top_left: Point,
    pub top_right: Point,
    pub bottom_right: Point,
    pub bottom_left: Point,
    space: PhantomData<S>,
}

impl<S: CoordinateSpace> Quad<S> {
    pub const fn new(
        top_left: Point,
        top_right: Point,
        bottom_right: Point,
        bottom_left: Point,
    ) -> Self {
        Self {
            top_left,
            top_right,
            bottom_right,
            bottom_left,
            space: PhantomData,
        }
    }

    pub fn corners(&self) -> [Point; 4] {
        [self.top_left, self.top_right, self.bottom_right, self.bottom_left]
    }

    /// The axis-aligned frame enclosing all four corners.
    pub fn bounding_rect(&self) -> Rect<S> {
        let corners = self.corners();
        let (mut x0, mut y0) = (f64::INFINITY, f64::INFINITY);
        let (mut x1, mut y1) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in corners {
            x0 = x0.min(p.x);
            y0 = y0.min(p.y);
            x1 = x1.max(p.x);
            y1 = y1.max(p.y);
        }
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn perimeter(&self) -> f64 {
        let c = self.corners();
        (0..4).map(|i| c[i].distance(&c[(i + 1) % 4])).sum()
    }

    /// Shoelace area; orientation independent.
    pub fn area(&self) -> f64 {
        let c = self.corners();
        let twice: f64 = (0..4)
            .map(|i| {
                let (p, q) = (c[i], c[(i + 1) % 4]);
                p.x * q.y - q.x * p.y
            })
            .sum();
        (twice / 2.0).abs()
    }

    /// Mean of the four corners.
    pub fn centroid(&self) -> Point {
        let c = self.corners();
        Point::new(
            c.iter().map(|p| p.x).sum::<f64>() / 4.0,
            c.iter().map(|p| p.y).sum::<f64>() / 4.0,
        )
    }

    /// Angle of the top edge, in radians, measured from the positive x axis.
    pub fn top_edge_angle(&self) -> f64 {
        (self.top_right.y - self.top_left.y).atan2(self.top_right.x - self.top_left.x)
    }

    /// Applies `transform` to each corner independently. Corner names are kept;
    /// call `reorganize` if the transform may have flipped or rotated them.
    pub fn apply_affine(&self, transform: &AffineTransform) -> Quad<S> {
        Quad::new(
            transform.apply(self.top_left),
            transform.apply(self.top_right),
            transform.apply(self.bottom_right),
            transform.apply(self.bottom_left),
        )
    }

    /// Restores canonical corner order: sort by y, split into top and bottom
    /// pairs, sort each pair by x.
    pub fn reorganize(&self) -> Quad<S> {
        let mut points = self.corners();
        points.sort_by(|p, q| p.y.total_cmp(&q.y));
        let mut top = [points[0], points[1]];
        let mut bottom = [points[2], points[3]];
        top.sort_by(|p, q| p.x.total_cmp(&q.x));
        bottom.sort_by(|p, q| p.x.total_cmp(&q.x));
        Quad::new(top[0], top[1], bottom[1], bottom[0])
    }

    /// Rescales a quad defined relative to `from` into a surface of size `to`,
    /// rotating about the centre of `from` first. For a rotation other than 0
    /// or π the source width and height swap roles.
    pub fn scale_to_fit(&self, from: Size, to: Size, rotation: f64) -> Quad<S> {
        if from.is_empty() || to.is_empty() {
            return Quad::default();
        }
        let rotated = if swaps_axes(rotation) { from.transposed() } else { from };
        let transform = AffineTransform::translate(-from.width / 2.0, -from.height / 2.0)
            .then(&AffineTransform::rotate(rotation))
            .then(&AffineTransform::translate(rotated.width / 2.0, rotated.height / 2.0))
            .then(&AffineTransform::scale(to.width / rotated.width, to.height / rotated.height));
        self.apply_affine(&transform).reorganize()
    }

    /// IoU of the two bounding frames.
    pub fn iou(&self, other: &Quad<S>) -> f64 {
        self.bounding_rect().iou(&other.bounding_rect())
    }

    pub fn approx_eq(&self, other: &Quad<S>, eps: f64) -> bool {
        self.corners()
            .iter()
            .zip(other.corners().iter())
            .all(|(p, q)| p.approx_eq(q, eps))
    }

    pub(crate) fn cast_space<T: CoordinateSpace>(&self) -> Quad<T> {
        Quad::new(self.top_left, self.top_right, self.bottom_right, self.bottom_left)
    }
}

fn swaps_axes(rotation: f64) -> bool {
    let r = rotation.rem_euclid(TAU);
    let eps = 1e-6;
    !(approx(r, 0.0, eps) || approx(r, PI, eps) || approx(r, TAU, eps))
}
