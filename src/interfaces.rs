// THEORY:
// The pipeline does not know how text is found, read, or translated. Those are
// the environment's job, reached through the narrow traits in this module. Each
// call may be slow and may fail; the pipeline treats every failure as "no
// result" for that one call and keeps going.
//
// Collaborators are injected as trait objects owned by the controller.
// Ownership is acyclic: the controller holds the collaborators and the render
// sink, and none of them hold the controller.

use crate::core_modules::candidate::{Candidate, Frame, PlacementRecord, UnstableHint};
use crate::core_modules::geometry::{DetectorNormalized, ImagePixel, Rect};
use crate::core_modules::translation_cache::LanguagePair;
use futures::future::BoxFuture;
use image::RgbaImage;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What the detector is asked to look at.
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub frame: Arc<Frame>,
    /// The part of the frame the user can see, on the display-oriented pixel
    /// grid. Returned boxes are normalized to this region, origin bottom-left.
    pub visible_region: Rect<ImagePixel>,
    /// Sub-rect of the visible region worth searching. Detectors may ignore it;
    /// the pipeline filters by it regardless.
    pub region_of_interest: Rect<DetectorNormalized>,
}

/// Finds candidate text regions in a frame.
pub trait Detector: Send + Sync {
    fn detect(
        &self,
        request: DetectionRequest,
    ) -> BoxFuture<'_, anyhow::Result<Vec<Candidate<DetectorNormalized>>>>;
}

/// Reads the text in one cropped region. `Ok(None)` means nothing legible.
pub trait Recognizer: Send + Sync {
    fn recognize(&self, region: RgbaImage) -> BoxFuture<'_, anyhow::Result<Option<String>>>;
}

/// Translates one piece of text.
pub trait Translator: Send + Sync {
    fn translate(
        &self,
        text: String,
        languages: LanguagePair,
    ) -> BoxFuture<'_, anyhow::Result<String>>;
}

/// The collaborators a pipeline is built with.
#[derive(Clone)]
pub struct Collaborators {
    pub detector: Arc<dyn Detector>,
    pub recognizer: Arc<dyn Recognizer>,
    pub translator: Arc<dyn Translator>,
}

/// Everything the overlay renderer is told.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    /// The stream has not settled; this is the best box seen in the latest frame.
    Unstable(UnstableHint),
    /// The latest frame had no usable candidates.
    HintCleared,
    /// Results of one completed processing cycle.
    Placements(Vec<PlacementRecord>),
}

/// The single path by which the pipeline publishes output.
#[derive(Debug)]
pub struct RenderSink {
    tx: mpsc::UnboundedSender<RenderEvent>,
}

impl RenderSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RenderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false if the renderer has gone away.
    pub fn publish(&self, event: RenderEvent) -> bool {
        if self.tx.send(event).is_err() {
            tracing::trace!("renderer dropped, event discarded");
            return false;
        }
        true
    }
}
