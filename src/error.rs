//! Error taxonomy for the chunk pipeline.
//!
//! Any of these is fatal to a run: the orchestrator stops issuing new units
//! in every stage and no partial output set is considered valid, since
//! downstream consumers expect a complete, contiguous chunk sequence.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// The requested chunk key is absent from the store. Never retried.
    #[error("chunk key not found in store: {key}")]
    NotFound { key: String },

    /// Connectivity or store failure. Retried up to the configured bound
    /// before becoming fatal.
    #[error("store request failed for {key}: {source}")]
    Transient {
        key: String,
        #[source]
        source: object_store::Error,
    },

    /// The codec rejected or failed on a chunk's payload.
    #[error("encode failed for chunk {chunk}: {reason}")]
    Transform { chunk: u64, reason: String },

    /// Single-writer/single-reader law of the slot buffer was violated.
    /// Indicates a sequencing bug, not an environmental failure.
    #[error("slot protocol violation: {0}")]
    SlotProtocol(String),

    /// The run was halted by a failure in another stage.
    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether a bounded retry is permitted for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient { .. })
    }
}
