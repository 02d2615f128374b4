use crate::pipeline::PipelineState;

/// Error types for the lingo_vision pipeline.
///
/// Failures of the environment's collaborators (detector, recognizer,
/// translator) are not represented here: the pipeline absorbs them and keeps
/// running. These errors cover misuse and setup problems.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Failed to read a configuration file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a configuration file.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The event is not valid in the current pipeline state.
    #[error("cannot {event} while {from:?}")]
    InvalidTransition {
        from: PipelineState,
        event: &'static str,
    },

    /// The pipeline task has shut down.
    #[error("pipeline closed")]
    Closed,
}

/// A Result type alias for lingo_vision operations.
pub type Result<T> = std::result::Result<T, Error>;
