// THEORY:
// A pipeline is configured once, at construction, with an immutable
// `PipelineConfig`. Nothing in the crate reads settings from anywhere else;
// changing behaviour means building a new pipeline or calling `reconfigure`.
// The config can be written by hand or loaded from a TOML file where every key
// is optional.

use crate::core_modules::geometry::{DetectorNormalized, Rect};
use crate::core_modules::stability::{ConsensusKey, StrategyKind};
use crate::core_modules::translation_cache::LanguagePair;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the text overlay pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// How much consensus is required before a sighting counts as stable, 1 to 5.
    pub reliability: u8,
    pub strategy: StrategyKind,
    pub consensus_key: ConsensusKey,
    /// Grid size, in screen units, that boxes are snapped to before comparison.
    pub quantization_step: f64,
    /// Frames a key may go unseen before the frequency tracker forgets it.
    /// Defaults to `reliability * 5`.
    pub decay_window: Option<u64>,
    /// Boxes overlapping an accepted box by at least this IoU are suppressed.
    pub iou_threshold: f64,
    /// Upper bound on boxes kept per frame after suppression.
    pub max_boxes: usize,
    /// Frames arriving faster than this rate are dropped.
    pub max_fps: f64,
    /// Boxes smaller than this (in normalized detector area) are discarded.
    pub min_candidate_area: f64,
    pub min_confidence: f32,
    /// Only candidates centred inside this rect are considered.
    pub region_of_interest: Rect<DetectorNormalized>,
    /// Resume scanning after a completed cycle instead of going idle.
    pub repeat: bool,
    /// Translate recognized text with this pair. `None` disables translation.
    pub languages: Option<LanguagePair>,
    pub recognition_timeout_ms: u64,
    pub translation_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reliability: 3,
            strategy: StrategyKind::default(),
            consensus_key: ConsensusKey::default(),
            quantization_step: 20.0,
            decay_window: None,
            iou_threshold: 0.3,
            max_boxes: 16,
            max_fps: 15.0,
            min_candidate_area: 0.0005,
            min_confidence: 0.0,
            region_of_interest: Rect::unit(),
            repeat: false,
            languages: None,
            recognition_timeout_ms: 2_000,
            translation_timeout_ms: 5_000,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if !(1..=5).contains(&self.reliability) {
            return invalid(format!(
                "reliability must be between 1 and 5, got {}",
                self.reliability
            ));
        }
        if !(self.quantization_step > 0.0 && self.quantization_step.is_finite()) {
            return invalid(format!(
                "quantization_step must be positive, got {}",
                self.quantization_step
            ));
        }
        if !(self.iou_threshold > 0.0 && self.iou_threshold <= 1.0) {
            return invalid(format!("iou_threshold must be in (0, 1], got {}", self.iou_threshold));
        }
        if self.max_boxes == 0 {
            return invalid("max_boxes must be at least 1".into());
        }
        if !(self.max_fps > 0.0 && self.max_fps.is_finite()) {
            return invalid(format!("max_fps must be positive, got {}", self.max_fps));
        }
        if self.min_candidate_area < 0.0 {
            return invalid(format!(
                "min_candidate_area must not be negative, got {}",
                self.min_candidate_area
            ));
        }
        if self.region_of_interest.is_degenerate() {
            return invalid("region_of_interest has no area".into());
        }
        if self.decay_window == Some(0) {
            return invalid("decay_window must be at least 1".into());
        }
        if let Some(languages) = &self.languages {
            if languages.source.is_empty() || languages.target.is_empty() {
                return invalid("languages need both a source and a target".into());
            }
        }
        Ok(())
    }

    pub fn effective_decay_window(&self) -> u64 {
        self.decay_window.unwrap_or(self.reliability as u64 * 5)
    }

    /// Minimum spacing between two accepted frames.
    pub fn min_frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.max_fps)
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_millis(self.recognition_timeout_ms)
    }

    pub fn translation_timeout(&self) -> Duration {
        Duration::from_millis(self.translation_timeout_ms)
    }
}
