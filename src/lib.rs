//! chunkpress: a staged pipeline that pulls dataset chunks from an object
//! store, compresses them, and writes the results back.
//!
//! The pipeline runs three overlapping stages over chunk indices 0..N:
//!
//! 1. **Fetch**: read the raw chunk `<prefix>-chunk-<i>` from the store
//! 2. **Encode**: compress the payload on a blocking thread
//! 3. **Upload**: write `<prefix>-chunk-compressed-<i>` back to the store
//!
//! Each stage issues chunks in strict index order, stages overlap through
//! a bounded slot buffer, and peak resident payload depends only on the
//! configured lookahead, never on N.

pub mod codec;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;

pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{PipelineRunner, RunReport, RunState};

use std::sync::Arc;

/// Run the full pipeline described by `config`.
///
/// Returns the final report; a stage failure surfaces as
/// `RunState::Failed` in the report rather than as `Err`.
pub async fn run_pipeline(config: Config) -> anyhow::Result<RunReport> {
    config.validate()?;

    let object_store = store::create_store(&config.store)?;
    let keys = store::ChunkKeys::new(&config.dataset.prefix, &config.dataset.key_suffix);
    let retry = store::RetryPolicy::new(&config.pipeline.retry);
    let chunk_store = Arc::new(store::ChunkStore::new(object_store, keys, retry));
    let codec = codec::build_codec(&config.codec);

    tracing::info!(
        "Dataset '{}' ({} chunks) at {}",
        config.dataset.prefix,
        config.dataset.num_chunks,
        config.store.location_display(),
    );

    let mut runner = PipelineRunner::new(config, chunk_store, codec);
    runner.run().await
}

/// Build the Tokio runtime for the pipeline.
pub fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }
    Ok(builder.build()?)
}
