//! Error types for the localizer and its collaborators.
//!
//! Expected control flow (the update gate holding, a transform not yet being available, a projected scan
//! endpoint falling outside the map) is never reported through these types. Those cases are explicit values
//! such as [`crate::ScanOutcome::Skipped`] or a zero particle weight.
use std::io;
use thiserror::Error;

/// Failures of the localization filter itself.
#[derive(Debug, Error)]
pub enum LocalizationError {
    /// Normalization found no probability mass to rescale. The sensor model maps a perfect match to weight
    /// 1.0 rather than 0, so this only happens when every particle projected an endpoint outside the map.
    #[error("particle weights sum to {sum}; cannot normalize")]
    DegenerateWeights { sum: f64 },

    /// The static map could not be obtained at startup. There is no degraded mode without a map.
    #[error("static map unavailable: {0}")]
    MapUnavailable(#[from] MapError),

    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failures looking up or applying a coordinate transform.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("no transform from '{source_frame}' to '{target}'")]
    Unavailable { target: String, source_frame: String },

    #[error("timed out after {timeout_s}s waiting for transform from '{source_frame}' to '{target}'")]
    Timeout {
        target: String,
        source_frame: String,
        timeout_s: f64,
    },

    #[error("unknown frame '{0}'")]
    UnknownFrame(String),
}

/// Failures loading or preparing the static map.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("map has no cells")]
    Empty,

    #[error("map has no occupied cells to measure distances against")]
    NoObstacles,

    #[error("invalid map resolution {0}")]
    InvalidResolution(f64),
}
