//! Error types for clubsdr-agent

use std::time::Duration;

use thiserror::Error;

/// Result type alias using clubsdr-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a turn
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the AI provider layer
    #[error(transparent)]
    Ai(#[from] clubsdr_ai::Error),

    /// An external capability (retrieval, store, model wrapper) failed
    #[error("capability unavailable: {0}")]
    Capability(String),

    /// Structured output did not conform to the requested schema
    #[error("malformed structured output: {0}")]
    Malformed(String),

    /// The turn exceeded its time budget
    #[error("turn timed out after {0:?}")]
    Timeout(Duration),

    /// The turn was cancelled by the caller
    #[error("turn cancelled")]
    Cancelled,

    /// The graph ran more steps than any valid path allows
    #[error("turn exceeded {0} orchestration steps")]
    StepLimit(usize),

    /// Loading or saving state failed
    #[error("store error: {0}")]
    Store(String),

    /// The inbound request was rejected before running
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A generic agent error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check if this error comes from bad model output rather than an outage
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Malformed(_) | Error::Ai(clubsdr_ai::Error::Json(_)))
    }
}
