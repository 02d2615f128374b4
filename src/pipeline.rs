// THEORY:
// The `pipeline` module is the top-level API of the overlay engine. The
// `PipelineController` owns every stage and walks a small state machine:
//
//   Idle --start--> Scanning --stable--> Stabilizing --> Captured --> Processing
//     ^                 ^                                                 |
//     |                 +------------------ repeat ----------------------+
//     +-------------------------- done / stop ----------------------------+
//
// While scanning, each accepted frame goes through the full per-frame stack:
// detection, pre-filtering, non-max suppression, mapping to screen space and
// the stability tracker. Only when the tracker reports a stable set does the
// controller pay for recognition and translation, and only once per sighting:
// from `Captured` until the cycle resolves, incoming frames are ignored.
//
// Detection is split in two so a driver can keep serving commands while the
// detector runs: `admit_frame` hands out a `PendingDetection`, and
// `finish_frame` folds its result back in.
//
// A processing cycle is handed out as a `CycleTicket` and run as a detached
// future, so the controller stays responsive to `stop`. Every pending
// detection and every ticket carries the generation it was issued under.
// `stop` and `reconfigure` bump the shared epoch. A running cycle checks the
// epoch before each recognizer and translator call and gives up once it is
// stale, and `complete_cycle` discards whatever a stale cycle returns. A
// cancelled cycle never reaches the renderer or the translation cache.

use crate::config::PipelineConfig;
use crate::core_modules::candidate::{
    Candidate, Frame, PlacementRecord, StableSet, TranslationFailure, UnstableHint,
};
use crate::core_modules::coordinate_mapper::{CoordinateMapper, ViewGeometry};
use crate::core_modules::geometry::{DetectorNormalized, ImagePixel, Quad, ScreenView};
use crate::core_modules::stability::{StabilityStrategy, StabilityTracker};
use crate::core_modules::suppressor;
use crate::core_modules::translation_cache::{TranslationCache, TranslationKey};
use crate::error::{Error, Result};
use crate::interfaces::{Collaborators, DetectionRequest, RenderEvent, RenderSink};
use futures::future::{BoxFuture, FutureExt, join_all};
use image::RgbaImage;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// The lifecycle state of a pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Scanning,
    Stabilizing,
    Captured,
    Processing,
}

/// Running counters, useful for diagnostics and for proving what work was skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_received: u64,
    /// Dropped because they arrived faster than the frame-rate cap.
    pub frames_throttled: u64,
    /// Dropped because the pipeline was idle or busy with a cycle.
    pub frames_ignored: u64,
    /// Frames handed to the detector.
    pub frames_analyzed: u64,
    /// Detections that finished after a `stop` or `reconfigure` and were dropped.
    pub stale_detections: u64,
    pub detector_failures: u64,
    pub cycles_started: u64,
    pub cycles_completed: u64,
    /// Cycles abandoned by `stop` or `reconfigure` while processing.
    pub cycles_cancelled: u64,
    /// Late outcomes from abandoned cycles that were thrown away.
    pub stale_outcomes: u64,
    pub placements_emitted: u64,
    pub translator_calls: u64,
    pub translation_cache_hits: u64,
}

/// What happened to one delivered frame.
#[derive(Debug)]
pub enum FrameDisposition {
    /// The pipeline was not scanning, or was stopped while the frame was in detection.
    Ignored,
    /// Too soon after the previous accepted frame.
    Throttled,
    /// Analyzed; the stream has not settled yet.
    Unstable,
    /// Analyzed and settled. The ticket must be run to produce placements.
    Captured(CycleTicket),
}

/// Whether a delivered frame goes on to the detector.
pub enum FrameAdmission {
    Detect(PendingDetection),
    Ignored,
    Throttled,
}

type DetectionResult = anyhow::Result<Vec<Candidate<DetectorNormalized>>>;

/// A frame admitted for analysis whose detector call has not run yet.
pub struct PendingDetection {
    generation: u64,
    frame: Arc<Frame>,
    detection: BoxFuture<'static, DetectionResult>,
}

impl PendingDetection {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Awaits the detector. Owns everything, so it may run on any task.
    pub async fn run(self) -> DetectedFrame {
        let result = self.detection.await;
        DetectedFrame {
            generation: self.generation,
            frame: self.frame,
            result,
        }
    }
}

/// The detector's answer for one admitted frame.
pub struct DetectedFrame {
    generation: u64,
    frame: Arc<Frame>,
    result: DetectionResult,
}

/// Permission to run one processing cycle.
#[derive(Debug)]
pub struct CycleTicket {
    pub generation: u64,
    pub stable: StableSet,
}

/// The result of running a processing cycle, before it is accepted.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub generation: u64,
    pub records: Vec<PlacementRecord>,
    pub regions_requested: usize,
    pub translator_calls: u64,
    pub cache_hits: u64,
}

impl CycleOutcome {
    fn abandoned(generation: u64, regions_requested: usize) -> Self {
        Self {
            generation,
            records: Vec::new(),
            regions_requested,
            translator_calls: 0,
            cache_hits: 0,
        }
    }
}

/// The stateful controller of the overlay pipeline.
pub struct PipelineController {
    config: PipelineConfig,
    state: PipelineState,
    /// Current generation, shared with every running cycle.
    epoch: Arc<AtomicU64>,
    tracker: StabilityTracker,
    mapper: CoordinateMapper,
    collaborators: Collaborators,
    sink: RenderSink,
    cache: Arc<TranslationCache>,
    last_accepted: Option<Duration>,
    last_hint: Option<UnstableHint>,
    stats: PipelineStats,
}

impl PipelineController {
    pub fn new(
        config: PipelineConfig,
        geometry: ViewGeometry,
        collaborators: Collaborators,
        sink: RenderSink,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tracker: StabilityTracker::from_config(&config),
            config,
            state: PipelineState::Idle,
            epoch: Arc::new(AtomicU64::new(0)),
            mapper: CoordinateMapper::new(geometry),
            collaborators,
            sink,
            cache: Arc::new(TranslationCache::new()),
            last_accepted: None,
            last_hint: None,
            stats: PipelineStats::default(),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn mapper(&self) -> &CoordinateMapper {
        &self.mapper
    }

    pub fn tracker(&self) -> &StabilityTracker {
        &self.tracker
    }

    pub fn translation_cache(&self) -> &TranslationCache {
        &self.cache
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::debug!(
            from = ?self.state,
            to = ?next,
            generation = self.generation(),
            "state transition"
        );
        self.state = next;
    }

    /// Clears per-run memory so a new scanning run starts from nothing.
    fn reset_scan(&mut self) {
        self.tracker.reset();
        self.last_hint = None;
    }

    /// `Idle -> Scanning`.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(Error::InvalidTransition {
                from: self.state,
                event: "start",
            });
        }
        self.reset_scan();
        self.last_accepted = None;
        self.transition(PipelineState::Scanning);
        Ok(())
    }

    /// Valid from any state. Abandons an in-flight detection or cycle.
    pub fn stop(&mut self) {
        self.cancel_cycle();
        self.reset_scan();
        if self.state != PipelineState::Idle {
            self.transition(PipelineState::Idle);
        }
    }

    fn cancel_cycle(&mut self) {
        if matches!(self.state, PipelineState::Captured | PipelineState::Processing) {
            self.stats.cycles_cancelled += 1;
            tracing::debug!(generation = self.generation(), "cycle cancelled");
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Swaps in a new configuration. A running pipeline restarts scanning under it.
    pub fn reconfigure(&mut self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        self.cancel_cycle();
        self.tracker = StabilityTracker::from_config(&config);
        self.config = config;
        self.reset_scan();
        self.last_accepted = None;
        if self.state != PipelineState::Idle {
            self.transition(PipelineState::Scanning);
        }
        tracing::info!(
            reliability = self.config.reliability,
            strategy = ?self.tracker.kind(),
            "reconfigured"
        );
        Ok(())
    }

    /// Rebuilds the coordinate mapper after a layout change.
    pub fn update_geometry(&mut self, geometry: ViewGeometry) {
        self.mapper = CoordinateMapper::new(geometry);
        self.last_hint = None;
    }

    /// Runs one delivered frame through detection and tracking.
    pub async fn on_frame(&mut self, frame: Frame) -> FrameDisposition {
        match self.admit_frame(frame) {
            FrameAdmission::Detect(pending) => {
                let detected = pending.run().await;
                self.finish_frame(detected)
            }
            FrameAdmission::Ignored => FrameDisposition::Ignored,
            FrameAdmission::Throttled => FrameDisposition::Throttled,
        }
    }

    /// State and throttle checks. An admitted frame comes back with its detector call.
    pub fn admit_frame(&mut self, frame: Frame) -> FrameAdmission {
        self.stats.frames_received += 1;
        if self.state != PipelineState::Scanning {
            self.stats.frames_ignored += 1;
            tracing::trace!(frame = frame.id, state = ?self.state, "frame ignored");
            return FrameAdmission::Ignored;
        }
        if let Some(last) = self.last_accepted {
            if frame.timestamp < last {
                tracing::debug!(
                    frame = frame.id,
                    timestamp = ?frame.timestamp,
                    last = ?last,
                    "frame clock went backwards, re-anchoring"
                );
            } else if frame.timestamp - last < self.config.min_frame_interval() {
                self.stats.frames_throttled += 1;
                tracing::trace!(frame = frame.id, "frame throttled");
                return FrameAdmission::Throttled;
            }
        }
        self.last_accepted = Some(frame.timestamp);
        self.stats.frames_analyzed += 1;

        let frame = Arc::new(frame);
        let request = DetectionRequest {
            frame: Arc::clone(&frame),
            visible_region: self.mapper.visible_region(),
            region_of_interest: self.config.region_of_interest,
        };
        let detector = Arc::clone(&self.collaborators.detector);
        FrameAdmission::Detect(PendingDetection {
            generation: self.generation(),
            frame,
            detection: async move { detector.detect(request).await }.boxed(),
        })
    }

    /// Suppression, mapping and tracking for a finished detection.
    pub fn finish_frame(&mut self, detected: DetectedFrame) -> FrameDisposition {
        let DetectedFrame {
            generation,
            frame,
            result,
        } = detected;
        if generation != self.generation() || self.state != PipelineState::Scanning {
            self.stats.stale_detections += 1;
            tracing::debug!(
                frame = frame.id,
                generation,
                current = self.generation(),
                "discarding stale detection"
            );
            return FrameDisposition::Ignored;
        }

        let raw = match result {
            Ok(candidates) => candidates,
            Err(err) => {
                self.stats.detector_failures += 1;
                tracing::warn!(frame = frame.id, %err, "detector failed");
                Vec::new()
            }
        };

        let candidates = self.prepare_candidates(raw);
        match self.tracker.observe(&frame, &candidates) {
            None => {
                self.publish_hint(candidates.first());
                FrameDisposition::Unstable
            }
            Some(stable) => {
                self.transition(PipelineState::Stabilizing);
                self.transition(PipelineState::Captured);
                self.transition(PipelineState::Processing);
                self.stats.cycles_started += 1;
                tracing::info!(
                    frame = frame.id,
                    regions = stable.candidates.len(),
                    generation,
                    "stable sighting captured"
                );
                FrameDisposition::Captured(CycleTicket { generation, stable })
            }
        }
    }

    /// Confidence, area and region filters, then suppression, then screen mapping.
    fn prepare_candidates(
        &self,
        mut raw: Vec<Candidate<DetectorNormalized>>,
    ) -> Vec<Candidate<ScreenView>> {
        let min_confidence = self.config.min_confidence;
        raw.retain(|c| c.confidence >= min_confidence);
        suppressor::retain_min_area(&mut raw, self.config.min_candidate_area);
        suppressor::retain_in_region(&mut raw, &self.config.region_of_interest);
        suppressor::suppress(raw, self.config.iou_threshold, self.config.max_boxes)
            .iter()
            .map(|c| c.with_rect(self.mapper.quad_to_screen(&c.rect)))
            .collect()
    }

    fn publish_hint(&mut self, best: Option<&Candidate<ScreenView>>) {
        match best {
            Some(candidate) => {
                let hint = UnstableHint {
                    bounding_box: candidate.bounds(),
                    confidence: candidate.confidence,
                };
                self.last_hint = Some(hint);
                self.sink.publish(RenderEvent::Unstable(hint));
            }
            None => {
                if self.last_hint.take().is_some() {
                    self.sink.publish(RenderEvent::HintCleared);
                }
            }
        }
    }

    /// Builds the recognition and translation work for a captured sighting.
    /// The future owns everything it needs and may run on any task.
    pub fn processing_job(&self, ticket: CycleTicket) -> BoxFuture<'static, CycleOutcome> {
        let job = ProcessingJob {
            generation: ticket.generation,
            epoch: Arc::clone(&self.epoch),
            stable: ticket.stable,
            mapper: self.mapper,
            collaborators: self.collaborators.clone(),
            cache: Arc::clone(&self.cache),
            config: self.config.clone(),
        };
        job.run().boxed()
    }

    /// Accepts a cycle outcome if it belongs to the current generation.
    /// Returns whether placements were emitted.
    pub fn complete_cycle(&mut self, outcome: CycleOutcome) -> bool {
        if outcome.generation != self.generation() || self.state != PipelineState::Processing {
            self.stats.stale_outcomes += 1;
            tracing::debug!(
                generation = outcome.generation,
                current = self.generation(),
                "discarding stale cycle outcome"
            );
            return false;
        }

        self.stats.cycles_completed += 1;
        self.stats.placements_emitted += outcome.records.len() as u64;
        self.stats.translator_calls += outcome.translator_calls;
        self.stats.translation_cache_hits += outcome.cache_hits;
        tracing::info!(
            regions = outcome.regions_requested,
            placements = outcome.records.len(),
            translator_calls = outcome.translator_calls,
            cache_hits = outcome.cache_hits,
            "cycle complete"
        );
        self.sink.publish(RenderEvent::Placements(outcome.records));

        self.reset_scan();
        if self.config.repeat {
            self.transition(PipelineState::Scanning);
        } else {
            self.transition(PipelineState::Idle);
        }
        true
    }

    /// Runs a ticket to completion on the current task and accepts the outcome.
    pub async fn run_cycle(&mut self, ticket: CycleTicket) -> bool {
        let outcome = self.processing_job(ticket).await;
        self.complete_cycle(outcome)
    }
}

/// Everything one processing cycle needs, detached from the controller.
struct ProcessingJob {
    generation: u64,
    epoch: Arc<AtomicU64>,
    stable: StableSet,
    mapper: CoordinateMapper,
    collaborators: Collaborators,
    cache: Arc<TranslationCache>,
    config: PipelineConfig,
}

type TranslationResult = std::result::Result<String, TranslationFailure>;

/// True once the controller has moved past `generation`.
fn is_stale(epoch: &AtomicU64, generation: u64) -> bool {
    epoch.load(Ordering::SeqCst) != generation
}

impl ProcessingJob {
    async fn run(self) -> CycleOutcome {
        let regions_requested = self.stable.candidates.len();
        let regions = self.recognize_all().await;
        if is_stale(&self.epoch, self.generation) {
            tracing::debug!(
                generation = self.generation,
                "cycle abandoned after recognition"
            );
            return CycleOutcome::abandoned(self.generation, regions_requested);
        }

        let (translations, translator_calls, cache_hits) = self.translate_all(&regions).await;
        if is_stale(&self.epoch, self.generation) {
            tracing::debug!(
                generation = self.generation,
                "cycle abandoned after translation"
            );
            return CycleOutcome::abandoned(self.generation, regions_requested);
        }

        let records = regions
            .into_iter()
            .map(|(rect, text)| {
                let mut record = PlacementRecord::new(text, rect);
                if let Some(languages) = &self.config.languages {
                    let key = TranslationKey::new(&record.source_text, languages);
                    match translations.get(&key) {
                        Some(Ok(translated)) => record.translated_text = Some(translated.clone()),
                        Some(Err(failure)) => record.translation_failure = Some(failure.clone()),
                        None => {}
                    }
                }
                record
            })
            .collect();

        CycleOutcome {
            generation: self.generation,
            records,
            regions_requested,
            translator_calls,
            cache_hits,
        }
    }

    /// Fan-out over every stable region; failed or empty regions are omitted.
    async fn recognize_all(&self) -> Vec<(Quad<ScreenView>, String)> {
        let frame = &self.stable.frame;
        let buffer_size = frame.size();
        let timeout = self.config.recognition_timeout();
        let generation = self.generation;

        let jobs = self.stable.candidates.iter().enumerate().map(|(index, candidate)| {
            let pixels = self.mapper.to_buffer_pixel(&candidate.rect, buffer_size);
            let crop = crop_region(&frame.image, &pixels);
            let recognizer = Arc::clone(&self.collaborators.recognizer);
            let epoch = Arc::clone(&self.epoch);
            let rect = candidate.rect;
            async move {
                let Some(region) = crop else {
                    tracing::debug!(index, "region outside frame, skipped");
                    return None;
                };
                if is_stale(&epoch, generation) {
                    return None;
                }
                match tokio::time::timeout(timeout, recognizer.recognize(region)).await {
                    Ok(Ok(Some(text))) if !text.trim().is_empty() => {
                        Some((rect, text.trim().to_string()))
                    }
                    Ok(Ok(_)) => None,
                    Ok(Err(err)) => {
                        tracing::warn!(index, %err, "recognizer failed");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(index, ?timeout, "recognizer timed out");
                        None
                    }
                }
            }
        });

        join_all(jobs).await.into_iter().flatten().collect()
    }

    /// Fan-out over each distinct recognized text, consulting the memo cache first.
    async fn translate_all(
        &self,
        regions: &[(Quad<ScreenView>, String)],
    ) -> (HashMap<TranslationKey, TranslationResult>, u64, u64) {
        let Some(languages) = &self.config.languages else {
            return (HashMap::new(), 0, 0);
        };
        let timeout = self.config.translation_timeout();
        let generation = self.generation;

        let mut keys: Vec<TranslationKey> = Vec::new();
        for (_, text) in regions {
            let key = TranslationKey::new(text, languages);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let jobs = keys.into_iter().map(|key| {
            let translator = Arc::clone(&self.collaborators.translator);
            let cache = Arc::clone(&self.cache);
            let epoch = Arc::clone(&self.epoch);
            async move {
                if let Some(hit) = cache.get(&key) {
                    return Some((key, Ok(hit), false));
                }
                if is_stale(&epoch, generation) {
                    return None;
                }
                let request = translator.translate(key.text.clone(), key.languages.clone());
                let result = match tokio::time::timeout(timeout, request).await {
                    Ok(Ok(translated)) => {
                        if !is_stale(&epoch, generation) {
                            cache.insert(key.clone(), translated.clone());
                        }
                        Ok(translated)
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(
                            text = %key.text,
                            languages = %key.languages,
                            %err,
                            "translator failed"
                        );
                        Err(TranslationFailure::Failed {
                            reason: err.to_string(),
                        })
                    }
                    Err(_) => {
                        tracing::warn!(text = %key.text, ?timeout, "translator timed out");
                        Err(TranslationFailure::TimedOut)
                    }
                };
                Some((key, result, true))
            }
        });

        let mut calls = 0;
        let mut hits = 0;
        let mut results = HashMap::new();
        for (key, result, called) in join_all(jobs).await.into_iter().flatten() {
            if called {
                calls += 1;
            } else {
                hits += 1;
            }
            results.insert(key, result);
        }
        (results, calls, hits)
    }
}

/// Copies the pixels under `quad`, clipped to the image. `None` if nothing is left.
fn crop_region(image: &RgbaImage, quad: &Quad<ImagePixel>) -> Option<RgbaImage> {
    let bounds = quad.bounding_rect();
    let x0 = bounds.min_x().floor().max(0.0);
    let y0 = bounds.min_y().floor().max(0.0);
    let x1 = bounds.max_x().ceil().min(image.width() as f64);
    let y1 = bounds.max_y().ceil().min(image.height() as f64);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    let (x, y) = (x0 as u32, y0 as u32);
    let (w, h) = ((x1 - x0) as u32, (y1 - y0) as u32);
    Some(image::imageops::crop_imm(image, x, y, w, h).to_image())
}
