use std::convert::Infallible;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid configuration, detected while building a [`crate::Minimizer`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't compile rule pattern.\n{0}")]
    Regex(#[from] regex::Error),

    #[error("Unknown minimizer stage '{0}'")]
    UnknownStage(String),

    #[error("Minimizer stage '{0}' is registered more than once")]
    DuplicateStage(String),

    #[error("At least one minimizer stage is required")]
    EmptyPipeline,

    #[error("Expected at most {expected} minimizer options (one per stage), got {actual}")]
    OptionsLength { expected: usize, actual: usize },

    #[error("Couldn't parse options.\n{0}")]
    Parse(#[from] serde_json::Error),
}

/// Failure of [`crate::throttle_all`].
#[derive(Debug, Error)]
pub enum ThrottleError<E> {
    #[error("Concurrency limit must be a positive integer, got {0}")]
    InvalidLimit(usize),

    #[error("Task #{index} failed: {error}")]
    Task { index: usize, error: E },
}

/// Failure of a minimizer pipeline for a single asset.
///
/// This type crosses the worker boundary, so it only carries plain data.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineError {
    #[error(
        "Minimizer stage #{index} ('{id}') returned neither a string nor an object with a 'code' string"
    )]
    Contract { index: usize, id: String },

    #[error("Minimizer stage #{index} ('{id}') failed: {message}")]
    Stage {
        index: usize,
        id: String,
        message: String,
        stack: Option<String>,
    },

    #[error("Asset is not valid UTF-8: {0}")]
    Encoding(String),

    #[error("Minimizer stage '{0}' is not registered")]
    UnknownStage(String),

    #[error("Worker transport failed: {0}")]
    Transport(String),
}

impl PipelineError {
    /// Stack trace captured when the stage failed, if any.
    pub fn stack(&self) -> Option<&str> {
        match self {
            PipelineError::Stage { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache lock was poisoned")]
    Poisoned,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Failure of a whole optimization pass. Per-asset failures never end up
/// here, they are reported as diagnostics instead.
#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error("Couldn't read cache entry for '{0}':\n{1}")]
    Cache(String, CacheError),

    #[error(transparent)]
    Throttle(#[from] ThrottleError<Infallible>),
}

/// Failure while moving assets between the filesystem and a
/// [`crate::Compilation`].
#[derive(Debug, Error)]
pub enum IoError {
    #[error("Couldn't access file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Path '{0}' is outside of '{1}'")]
    OutsideBase(String, String),
}
