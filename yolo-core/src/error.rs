use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the [`Detector`](crate::Detector) facade.
///
/// Internals report failures through `anyhow`; they are classified here at the public
/// boundary. An empty detection list is a success, never an error.
#[derive(Debug, Error)]
pub enum DetectError {
    /// A caller-supplied argument is unusable (out-of-range threshold, empty region, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The model file is missing, unreadable, or not a usable graph.
    #[error("failed to load model {}", path.display())]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    /// Preprocessing, inference, or decoding failed for a frame.
    #[error("inference failed")]
    Inference(#[source] anyhow::Error),
}

impl DetectError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

pub type DetectResult<T> = std::result::Result<T, DetectError>;
