// THEORY:
// The `candidate` module holds the "dumb" data containers that flow between the
// pipeline stages, in the same spirit as a blob that only summarises one frame.
// A `Candidate` is one detector output, a `StableSet` is the frozen result of a
// stability decision, and a `PlacementRecord` is what the overlay renderer is
// finally handed. None of them hold behaviour beyond simple derived values.

use crate::core_modules::geometry::{
    AffineTransform, CoordinateSpace, DetectorNormalized, Point, Quad, Rect, ScreenView, Size,
};
use image::RgbaImage;
use std::sync::Arc;
use std::time::Duration;

/// One captured video frame. The image is shared so the pipeline can keep a
/// snapshot of the frame that produced a stable sighting without copying it.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic identifier assigned by the frame source.
    pub id: u64,
    /// Capture timestamp relative to the start of the stream. Used for throttling.
    pub timestamp: Duration,
    pub image: Arc<RgbaImage>,
}

impl Frame {
    pub fn new(id: u64, timestamp: Duration, image: RgbaImage) -> Self {
        Self {
            id,
            timestamp,
            image: Arc::new(image),
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.image.width() as f64, self.image.height() as f64)
    }
}

/// A single detector output. Ephemeral: consumed within one frame's processing.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<S: CoordinateSpace = DetectorNormalized> {
    pub rect: Quad<S>,
    pub confidence: f32,
    /// Text the detector may already have read for this region.
    pub text: Option<String>,
}

impl<S: CoordinateSpace> Candidate<S> {
    pub fn new(rect: Quad<S>, confidence: f32) -> Self {
        Self {
            rect,
            confidence,
            text: None,
        }
    }

    pub fn from_rect(rect: Rect<S>, confidence: f32) -> Self {
        Self::new(rect.to_quad(), confidence)
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn bounds(&self) -> Rect<S> {
        self.rect.bounding_rect()
    }

    /// The same detection re-expressed in another space.
    pub fn with_rect<T: CoordinateSpace>(&self, rect: Quad<T>) -> Candidate<T> {
        Candidate {
            rect,
            confidence: self.confidence,
            text: self.text.clone(),
        }
    }
}

/// The frozen output of a stability tracker.
#[derive(Debug, Clone)]
pub struct StableSet {
    /// Candidates judged consistent, in priority order.
    pub candidates: Vec<Candidate<ScreenView>>,
    /// The frame the candidates were observed in.
    pub frame: Arc<Frame>,
    /// Index of the observation (within the current scanning run) that settled.
    pub frame_index: u64,
}

/// Live feedback for the renderer while the stream has not settled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnstableHint {
    pub bounding_box: Rect<ScreenView>,
    pub confidence: f32,
}

/// Why a placement shows source text instead of a translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationFailure {
    Failed { reason: String },
    TimedOut,
}

/// Screen placement for one recognized text region. Owned by the renderer once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRecord {
    pub source_text: String,
    pub translated_text: Option<String>,
    /// Set when a translation was requested but could not be produced.
    pub translation_failure: Option<TranslationFailure>,
    pub screen_rect: Quad<ScreenView>,
    /// Maps an axis-aligned label box at the origin onto `screen_rect`.
    pub render_transform: AffineTransform,
}

impl PlacementRecord {
    pub fn new(source_text: String, screen_rect: Quad<ScreenView>) -> Self {
        let render_transform = label_transform(&screen_rect);
        Self {
            source_text,
            translated_text: None,
            translation_failure: None,
            screen_rect,
            render_transform,
        }
    }

    /// The text an overlay should draw.
    pub fn display_text(&self) -> &str {
        self.translated_text.as_deref().unwrap_or(&self.source_text)
    }

    /// Size of the label box `render_transform` expects: top edge by left edge.
    pub fn label_size(&self) -> Size {
        let q = &self.screen_rect;
        Size::new(q.top_left.distance(&q.top_right), q.top_left.distance(&q.bottom_left))
    }
}

fn label_transform(quad: &Quad<ScreenView>) -> AffineTransform {
    let Point { x, y } = quad.top_left;
    AffineTransform::rotate(quad.top_edge_angle()).then(&AffineTransform::translate(x, y))
}
