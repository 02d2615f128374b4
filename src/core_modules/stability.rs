// THEORY:
// The `stability` module adds memory to the detection layer. A text detector run
// on a live feed never reports exactly the same boxes twice; boxes shiver by a
// few pixels, and now and then a frame misses a line entirely. Recognition and
// translation are far too expensive to run on every frame, so this module
// decides when the stream has "settled" enough to act on.
//
// Key architectural principles:
// 1.  **Quantized Keys**: Every candidate is reduced to an `ObservationKey`,
//     either its box snapped to a coarse grid or its normalized text. Equality
//     of keys is the only consensus test; the grid absorbs detector jitter.
// 2.  **Two Strategies, One Interface**: `FixedWindowTracker` demands N equal
//     frames in a row. It reacts fast but a single missed frame restarts it.
//     `FrequencyDecayTracker` counts sightings of each key inside a sliding
//     window of frames and forgets keys that go quiet. It tolerates dropped
//     frames but reacts more slowly. Both implement `StabilityStrategy`.
// 3.  **Lifecycle**: Like any tracker, entries are born when first seen, their
//     counts grow on every sighting, and they die when not seen for longer than
//     the decay window.
// 4.  **No Stale Memory**: Reporting stability drains the state that produced
//     it, and `reset` forgets everything, so one capture cycle never leaks into
//     the next.

use crate::config::PipelineConfig;
use crate::core_modules::candidate::{Candidate, Frame, StableSet};
use crate::core_modules::geometry::{CoordinateSpace, Rect, ScreenView};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Which tracker a pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    FixedWindow,
    FrequencyDecay,
}

/// What a candidate is reduced to before consensus is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusKey {
    /// The candidate's bounding box snapped to the quantization grid.
    #[default]
    Geometry,
    /// The detector's text for the candidate; boxes without text fall back to geometry.
    Text,
}

/// A rect expressed in whole quantization steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuantizedRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

/// Snaps coordinates to the nearest multiple of a fixed step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantizer {
    step: f64,
}

impl Quantizer {
    pub fn new(step: f64) -> Self {
        let step = if step > 0.0 && step.is_finite() {
            step
        } else {
            1.0
        };
        Self { step }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn snap(&self, value: f64) -> i64 {
        (value / self.step).round() as i64
    }

    pub fn quantize<S: CoordinateSpace>(&self, rect: &Rect<S>) -> QuantizedRect {
        let r = rect.standardized();
        QuantizedRect {
            x: self.snap(r.x),
            y: self.snap(r.y),
            width: self.snap(r.width),
            height: self.snap(r.height),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObservationKey {
    Geometry(QuantizedRect),
    Text(String),
}

/// Turns candidates into observation keys.
#[derive(Debug, Clone, Copy)]
pub struct KeyBuilder {
    quantizer: Quantizer,
    mode: ConsensusKey,
}

impl KeyBuilder {
    pub fn new(quantizer: Quantizer, mode: ConsensusKey) -> Self {
        Self { quantizer, mode }
    }

    pub fn key_for(&self, candidate: &Candidate<ScreenView>) -> ObservationKey {
        if self.mode == ConsensusKey::Text {
            let text = candidate.text.as_deref().map(normalize_text);
            if let Some(text) = text.filter(|t| !t.is_empty()) {
                return ObservationKey::Text(text);
            }
        }
        ObservationKey::Geometry(self.quantizer.quantize(&candidate.bounds()))
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// The interface every stability strategy exposes to the pipeline.
pub trait StabilityStrategy: Send {
    /// Ingests one frame's candidates. Returns the frozen set once the stream has settled.
    fn observe(
        &mut self,
        frame: &Arc<Frame>,
        candidates: &[Candidate<ScreenView>],
    ) -> Option<StableSet>;

    /// Forgets all state.
    fn reset(&mut self);

    /// Number of frames observed since the last reset.
    fn observed_frames(&self) -> u64;
}

/// "N-of-N consensus": the last N frame summaries must all be equal.
#[derive(Debug)]
pub struct FixedWindowTracker {
    capacity: usize,
    window: VecDeque<Vec<ObservationKey>>,
    keys: KeyBuilder,
    observed: u64,
}

impl FixedWindowTracker {
    pub fn new(reliability: usize, keys: KeyBuilder) -> Self {
        let capacity = reliability.max(1);
        Self {
            capacity,
            window: VecDeque::with_capacity(capacity + 1),
            keys,
            observed: 0,
        }
    }

    /// The frame summaries currently held, oldest first.
    pub fn window(&self) -> &VecDeque<Vec<ObservationKey>> {
        &self.window
    }

    pub fn summarize(&self, candidates: &[Candidate<ScreenView>]) -> Vec<ObservationKey> {
        let mut summary: Vec<ObservationKey> =
            candidates.iter().map(|c| self.keys.key_for(c)).collect();
        summary.sort();
        summary
    }
}

impl StabilityStrategy for FixedWindowTracker {
    fn observe(
        &mut self,
        frame: &Arc<Frame>,
        candidates: &[Candidate<ScreenView>],
    ) -> Option<StableSet> {
        let frame_index = self.observed;
        self.observed += 1;

        let summary = self.summarize(candidates);
        self.window.push_back(summary);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
        if self.window.len() < self.capacity {
            return None;
        }

        let first = &self.window[0];
        let unanimous = !first.is_empty() && self.window.iter().all(|s| s == first);
        if !unanimous {
            // Keep the latest N-1 summaries; the next frame completes the window again.
            self.window.pop_front();
            return None;
        }

        self.window.clear();
        tracing::debug!(
            frame = frame.id,
            frame_index,
            regions = candidates.len(),
            "fixed window settled"
        );
        Some(StableSet {
            candidates: candidates.to_vec(),
            frame: Arc::clone(frame),
            frame_index,
        })
    }

    fn reset(&mut self) {
        self.window.clear();
        self.observed = 0;
    }

    fn observed_frames(&self) -> u64 {
        self.observed
    }
}

/// Per-key memory of the frequency strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackEntry {
    pub key: ObservationKey,
    /// Index of the frame this key was last observed in.
    pub last_seen_frame: u64,
    /// Number of frames the key was observed in since it was (re)born.
    pub observation_count: u32,
}

/// Counts sightings of each key and forgets keys not seen within the decay window.
#[derive(Debug)]
pub struct FrequencyDecayTracker {
    reliability: u32,
    decay_window: u64,
    entries: HashMap<ObservationKey, TrackEntry>,
    keys: KeyBuilder,
    next_frame: u64,
}

impl FrequencyDecayTracker {
    pub fn new(reliability: u32, decay_window: u64, keys: KeyBuilder) -> Self {
        Self {
            reliability: reliability.max(1),
            decay_window,
            entries: HashMap::new(),
            keys,
            next_frame: 0,
        }
    }

    pub fn entry(&self, key: &ObservationKey) -> Option<&TrackEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }
}

impl StabilityStrategy for FrequencyDecayTracker {
    fn observe(
        &mut self,
        frame: &Arc<Frame>,
        candidates: &[Candidate<ScreenView>],
    ) -> Option<StableSet> {
        let current = self.next_frame;
        self.next_frame += 1;

        // Prune first so a key that reappears after decaying starts over.
        let decay_window = self.decay_window;
        self.entries.retain(|_, e| current - e.last_seen_frame <= decay_window);

        // One sighting per key per frame; remember the first candidate for each.
        let mut present: Vec<(ObservationKey, usize)> = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter().enumerate() {
            let key = self.keys.key_for(candidate);
            if !present.iter().any(|(k, _)| *k == key) {
                present.push((key, index));
            }
        }

        for (key, _) in &present {
            let entry = self.entries.entry(key.clone()).or_insert_with(|| TrackEntry {
                key: key.clone(),
                last_seen_frame: current,
                observation_count: 0,
            });
            entry.observation_count += 1;
            entry.last_seen_frame = current;
        }

        let mut stable: Vec<(&TrackEntry, usize)> = present
            .iter()
            .filter_map(|(key, index)| self.entries.get(key).map(|e| (e, *index)))
            .filter(|(e, _)| e.observation_count >= self.reliability)
            .collect();
        if stable.is_empty() {
            return None;
        }
        // Every stable key was just seen in this frame, so recency always ties.
        // Equal counts keep the input order, which is detector confidence order.
        stable.sort_by(|(a, ia), (b, ib)| {
            b.observation_count.cmp(&a.observation_count).then(ia.cmp(ib))
        });

        let settled: Vec<Candidate<ScreenView>> =
            stable.iter().map(|(_, i)| candidates[*i].clone()).collect();
        self.entries.clear();
        tracing::debug!(
            frame = frame.id,
            frame_index = current,
            regions = settled.len(),
            "frequency tracker settled"
        );
        Some(StableSet {
            candidates: settled,
            frame: Arc::clone(frame),
            frame_index: current,
        })
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.next_frame = 0;
    }

    fn observed_frames(&self) -> u64 {
        self.next_frame
    }
}

/// The strategy selected by a pipeline configuration.
#[derive(Debug)]
pub enum StabilityTracker {
    FixedWindow(FixedWindowTracker),
    FrequencyDecay(FrequencyDecayTracker),
}

impl StabilityTracker {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let keys = KeyBuilder::new(Quantizer::new(config.quantization_step), config.consensus_key);
        match config.strategy {
            StrategyKind::FixedWindow => {
                Self::FixedWindow(FixedWindowTracker::new(config.reliability as usize, keys))
            }
            StrategyKind::FrequencyDecay => Self::FrequencyDecay(FrequencyDecayTracker::new(
                config.reliability as u32,
                config.effective_decay_window(),
                keys,
            )),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::FixedWindow(_) => StrategyKind::FixedWindow,
            Self::FrequencyDecay(_) => StrategyKind::FrequencyDecay,
        }
    }

    fn inner(&mut self) -> &mut dyn StabilityStrategy {
        match self {
            Self::FixedWindow(t) => t,
            Self::FrequencyDecay(t) => t,
        }
    }
}

impl StabilityStrategy for StabilityTracker {
    fn observe(
        &mut self,
        frame: &Arc<Frame>,
        candidates: &[Candidate<ScreenView>],
    ) -> Option<StableSet> {
        self.inner().observe(frame, candidates)
    }

    fn reset(&mut self) {
        self.inner().reset()
    }

    fn observed_frames(&self) -> u64 {
        match self {
            Self::FixedWindow(t) => t.observed_frames(),
            Self::FrequencyDecay(t) => t.observed_frames(),
        }
    }
}
