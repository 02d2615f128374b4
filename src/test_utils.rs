//! Fakes and fixtures shared by the unit tests.

use crate::config::PipelineConfig;
use crate::core_modules::candidate::{Candidate, Frame, PlacementRecord};
use crate::core_modules::coordinate_mapper::{CoordinateMapper, VideoGravity, ViewGeometry};
use crate::core_modules::geometry::{DetectorNormalized, Rect, ScreenView, Size};
use crate::core_modules::translation_cache::LanguagePair;
use crate::interfaces::{
    Collaborators, DetectionRequest, Detector, Recognizer, RenderEvent, RenderSink, Translator,
};
use crate::pipeline::PipelineController;
use futures::future::{BoxFuture, FutureExt};
use image::RgbaImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

pub const VIEW_WIDTH: f64 = 320.0;
pub const VIEW_HEIGHT: f64 = 240.0;

/// A tiny frame for tests that never look at pixels.
pub fn blank_frame(id: u64) -> Arc<Frame> {
    Arc::new(Frame::new(id, Duration::from_millis(id * 100), RgbaImage::new(8, 8)))
}

/// A layout where screen points and capture pixels coincide.
pub fn identity_geometry() -> ViewGeometry {
    let size = Size::new(VIEW_WIDTH, VIEW_HEIGHT);
    ViewGeometry::fullscreen(size, size, VideoGravity::Resize)
}

/// Hands out frames with increasing ids and evenly spaced timestamps.
pub struct FrameClock {
    next_id: u64,
    now: Duration,
    spacing: Duration,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self {
            next_id: 0,
            now: Duration::ZERO,
            spacing: Duration::from_millis(100),
        }
    }
}

impl FrameClock {
    pub fn set_spacing(&mut self, spacing: Duration) {
        self.spacing = spacing;
    }

    /// The next frame is stamped `at`, as if the source restarted its clock.
    pub fn rewind_to(&mut self, at: Duration) {
        self.now = at;
    }

    pub fn next_frame(&mut self) -> Frame {
        let image = RgbaImage::new(VIEW_WIDTH as u32, VIEW_HEIGHT as u32);
        let frame = Frame::new(self.next_id, self.now, image);
        self.next_id += 1;
        self.now += self.spacing;
        frame
    }
}

/// Returns the same boxes for every frame, given in screen space.
pub struct ScriptedDetector {
    mapper: CoordinateMapper,
    candidates: Mutex<Vec<Candidate<DetectorNormalized>>>,
    failures_left: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(mapper: CoordinateMapper, boxes: Vec<Rect<ScreenView>>) -> Self {
        let detector = Self {
            mapper,
            candidates: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
            gate: Mutex::new(None),
            calls: AtomicUsize::new(0),
        };
        detector.set_boxes(boxes);
        detector
    }

    pub fn set_boxes(&self, boxes: Vec<Rect<ScreenView>>) {
        let candidates = boxes
            .iter()
            .map(|b| Candidate::from_rect(self.mapper.to_detector(b), 0.9))
            .collect();
        *self.candidates.lock().unwrap() = candidates;
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Holds later detections until the returned gate is given permits.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for ScriptedDetector {
    fn detect(
        &self,
        _request: DetectionRequest,
    ) -> BoxFuture<'_, anyhow::Result<Vec<Candidate<DetectorNormalized>>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let candidates = self.candidates.lock().unwrap().clone();
        let gate = self.gate.lock().unwrap().clone();
        async move {
            if let Some(gate) = gate {
                gate.acquire().await?.forget();
            }
            if failing {
                anyhow::bail!("scripted detector failure");
            }
            Ok(candidates)
        }
        .boxed()
    }
}

/// Reads the same text from every region.
pub struct FixedRecognizer {
    text: String,
    calls: AtomicUsize,
}

impl FixedRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Recognizer for FixedRecognizer {
    fn recognize(&self, _region: RgbaImage) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok(Some(self.text.clone())) }.boxed()
    }
}

/// Holds every recognition until `open` is called.
#[derive(Clone)]
pub struct GatedRecognizer {
    text: String,
    gate: Arc<Semaphore>,
}

impl GatedRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(1024);
    }
}

impl Recognizer for GatedRecognizer {
    fn recognize(&self, _region: RgbaImage) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        async move {
            let _permit = self.gate.acquire().await?;
            Ok(Some(self.text.clone()))
        }
        .boxed()
    }
}

/// Fails on regions narrower than `min_width` pixels.
pub struct WidthRecognizer {
    pub min_width: u32,
    pub text: String,
}

impl Recognizer for WidthRecognizer {
    fn recognize(&self, region: RgbaImage) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        async move {
            if region.width() < self.min_width {
                anyhow::bail!("region too narrow: {}px", region.width());
            }
            Ok(Some(self.text.clone()))
        }
        .boxed()
    }
}

/// Looks texts up in a fixed dictionary and counts every call.
#[derive(Default)]
pub struct DictionaryTranslator {
    entries: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl DictionaryTranslator {
    pub fn insert(&self, source: &str, translated: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(source.to_string(), translated.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Translator for DictionaryTranslator {
    fn translate(
        &self,
        text: String,
        languages: LanguagePair,
    ) -> BoxFuture<'_, anyhow::Result<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let found = self.entries.lock().unwrap().get(&text).cloned();
        async move { found.ok_or_else(|| anyhow::anyhow!("no {languages} entry for {text:?}")) }
            .boxed()
    }
}

/// A controller wired to fakes, with handles on each fake.
pub struct Harness {
    pub controller: PipelineController,
    pub clock: FrameClock,
    pub detector: Arc<ScriptedDetector>,
    pub translator: Arc<DictionaryTranslator>,
    pub events: mpsc::UnboundedReceiver<RenderEvent>,
}

impl Harness {
    pub fn new(config: PipelineConfig, boxes: Vec<Rect<ScreenView>>) -> Self {
        Self::with_recognizer(config, boxes, Arc::new(FixedRecognizer::new("hello")))
    }

    pub fn with_recognizer(
        config: PipelineConfig,
        boxes: Vec<Rect<ScreenView>>,
        recognizer: Arc<dyn Recognizer>,
    ) -> Self {
        let geometry = identity_geometry();
        let detector = Arc::new(ScriptedDetector::new(CoordinateMapper::new(geometry), boxes));
        let translator = Arc::new(DictionaryTranslator::default());
        let collaborators = Collaborators {
            detector: detector.clone(),
            recognizer,
            translator: translator.clone(),
        };
        let (sink, events) = RenderSink::channel();
        let controller =
            PipelineController::new(config, geometry, collaborators, sink).expect("valid config");
        Self {
            controller,
            clock: FrameClock::default(),
            detector,
            translator,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<RenderEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// The records of the most recent placements event. Panics if there was none.
    pub fn take_placements(&mut self) -> Vec<PlacementRecord> {
        self.drain_events()
            .into_iter()
            .filter_map(|event| match event {
                RenderEvent::Placements(records) => Some(records),
                _ => None,
            })
            .last()
            .expect("a placements event")
    }
}
