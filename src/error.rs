//! Error taxonomy for the extraction pipeline.
//!
//! Only [`ExtractError`] ever aborts a run. [`DecodeError`] and
//! [`EngineError`] are per-frame / per-batch failures that the pools record
//! as [`FailureRecord`]s and turn into empty text, and
//! [`ResourcePlanError`] is recovered by falling back to a minimal plan.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// A single frame could not be read from the video source.
#[derive(Debug, Clone, Error)]
#[error("Failed to decode frame {frame_index}: {reason}")]
pub struct DecodeError {
    pub frame_index: u64,
    pub reason: String,
}

impl DecodeError {
    pub fn new(frame_index: u64, reason: impl Into<String>) -> Self {
        Self {
            frame_index,
            reason: reason.into(),
        }
    }
}

/// An OCR engine invocation failed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("OCR engine failed: {0}")]
    Failed(String),

    #[error("OCR engine timed out after {0:?}")]
    Timeout(Duration),

    #[error("OCR engine returned an unexpected response: {0}")]
    Protocol(String),

    #[error("OCR engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hardware introspection failed; the planner recovers with a minimal plan.
#[derive(Debug, Clone, Error)]
#[error("Hardware introspection failed: {0}")]
pub struct ResourcePlanError(pub String);

/// Fatal errors that stop a run.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Configuration(Vec<String>),

    #[error("No subtitle area found after sampling {samples} frame(s)")]
    NoSubtitleAreaFound { samples: usize },

    #[error("Extraction cancelled")]
    Cancelled,

    #[error("Cache error at {path}: {reason}")]
    Cache { path: PathBuf, reason: String },

    #[error("Failed to write subtitles: {0}")]
    Writer(String),

    #[error("Worker thread panicked during {0}")]
    WorkerPanicked(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T, E = ExtractError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Decode,
    Engine,
    ResourcePlan,
    AreaSample,
    Overlap,
}

/// A non-fatal failure kept for the end-of-run summary.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    /// First affected frame, if the failure is tied to frames.
    pub frame_index: Option<u64>,
    /// Number of frames affected (1 for a decode failure, batch size for an
    /// engine failure).
    pub frames: usize,
    pub message: String,
}

impl FailureRecord {
    pub fn decode(err: &DecodeError) -> Self {
        Self {
            kind: FailureKind::Decode,
            frame_index: Some(err.frame_index),
            frames: 1,
            message: err.reason.clone(),
        }
    }

    pub fn engine(first_frame: Option<u64>, frames: usize, err: &EngineError) -> Self {
        Self {
            kind: FailureKind::Engine,
            frame_index: first_frame,
            frames,
            message: err.to_string(),
        }
    }

    pub fn other(kind: FailureKind, frame_index: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            kind,
            frame_index,
            frames: usize::from(frame_index.is_some()),
            message: message.into(),
        }
    }
}
