//! Error taxonomy shared by the stores and the turn pipeline.

use thiserror::Error;

/// Failures raised by a storage collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failures inside the turn pipeline.
///
/// `Upstream` and `Parse` are normally absorbed at the reasoner/generator boundary and
/// turned into deterministic fallbacks; anything that still reaches
/// [`TurnPipeline::run_turn`](crate::TurnPipeline::run_turn) becomes the safe-fallback reply.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("unparseable model response: {0}")]
    Parse(String),
    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => PipelineError::NotFound(what),
            StoreError::Invalid(what) => PipelineError::BadInput(what),
            other => PipelineError::Storage(other),
        }
    }
}

impl PipelineError {
    /// Parses a UUID-shaped identifier, mapping a malformed value to `BadInput`.
    pub fn parse_id(kind: &str, raw: &str) -> Result<uuid::Uuid, PipelineError> {
        uuid::Uuid::parse_str(raw.trim())
            .map_err(|_| PipelineError::BadInput(format!("malformed {} '{}'", kind, raw)))
    }
}
