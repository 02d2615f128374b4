// THEORY:
// This file is the main entry point for the `lingo_vision` library crate.
//
// The crate turns a live stream of noisy text detections into a one-shot
// "read, translate, place" result. The public surface is small:
//   - `pipeline::PipelineController`, the state machine that owns every stage;
//   - `frame_driver`, which runs a controller on its own task behind a
//     cloneable `PipelineHandle`;
//   - `interfaces`, the traits the host implements for detection, recognition
//     and translation, plus the `RenderSink` that receives overlay events;
//   - `config::PipelineConfig`.
//
// The `core_modules` hold the pure building blocks: typed geometry, the
// coordinate mapper, non-max suppression, the stability trackers and the
// translation memo. None of them know about async or about each other's state.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod frame_driver;
pub mod interfaces;
pub mod pipeline;

#[cfg(test)]
mod test_utils;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use frame_driver::{PipelineHandle, PipelineSnapshot};
pub use interfaces::{Collaborators, Detector, Recognizer, RenderEvent, RenderSink, Translator};
pub use pipeline::{PipelineController, PipelineState, PipelineStats};
