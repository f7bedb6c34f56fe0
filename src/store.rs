//! Remote store access for dataset chunks.
//!
//! This module wraps `object_store` with the dataset's deterministic key
//! scheme and a bounded application-level retry for transient failures.
//! S3 client settings follow the same connection-pool and transport-retry
//! tuning used for high-concurrency chunk transfer.

use crate::config::{RetryConfig, StoreConfig};
use crate::error::PipelineError;
use anyhow::Result;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore, PutPayload};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic object keys for a dataset's chunks.
///
/// Raw input chunks live at `<prefix>-chunk-<i>` and encoded outputs at
/// `<prefix>-chunk-compressed-<i>`, with an optional shared suffix.
#[derive(Debug, Clone)]
pub struct ChunkKeys {
    prefix: String,
    suffix: String,
}

impl ChunkKeys {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Key of the raw input chunk at `index`.
    pub fn raw(&self, index: u64) -> String {
        format!("{}-chunk-{}{}", self.prefix, index, self.suffix)
    }

    /// Key of the encoded output chunk at `index`.
    pub fn compressed(&self, index: u64) -> String {
        format!("{}-chunk-compressed-{}{}", self.prefix, index, self.suffix)
    }
}

/// Backoff schedule for application-level retries.
///
/// Doubles from the initial delay up to the cap. Only transient failures
/// are retried; a missing key is never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// No retries; every failure is immediately fatal.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Backoff before retry `attempt` (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as u32;
        let delay = self.initial_backoff.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_backoff)
    }
}

/// Key-addressed access to the dataset's chunks in a remote store.
pub struct ChunkStore {
    store: Arc<dyn ObjectStore>,
    keys: ChunkKeys,
    retry: RetryPolicy,
}

impl ChunkStore {
    pub fn new(store: Arc<dyn ObjectStore>, keys: ChunkKeys, retry: RetryPolicy) -> Self {
        Self { store, keys, retry }
    }

    pub fn keys(&self) -> &ChunkKeys {
        &self.keys
    }

    /// Fetch the raw payload of chunk `index`.
    pub async fn get_chunk(&self, index: u64) -> Result<Bytes, PipelineError> {
        let key = self.keys.raw(index);
        let mut attempt = 0;
        loop {
            let result = self.get_once(&key).await;
            match result {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries() => {
                    attempt += 1;
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        "Fetch of {} failed (attempt {}), retrying in {:?}: {}",
                        key,
                        attempt,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Upload the encoded payload of chunk `index`.
    pub async fn put_chunk(&self, index: u64, payload: Bytes) -> Result<(), PipelineError> {
        let key = self.keys.compressed(index);
        let mut attempt = 0;
        loop {
            let result = self.put_once(&key, payload.clone()).await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries() => {
                    attempt += 1;
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        "Upload of {} failed (attempt {}), retrying in {:?}: {}",
                        key,
                        attempt,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_once(&self, key: &str) -> Result<Bytes, PipelineError> {
        let path = Path::from(key);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| classify(key, e))?;
        result.bytes().await.map_err(|e| classify(key, e))
    }

    async fn put_once(&self, key: &str, payload: Bytes) -> Result<(), PipelineError> {
        let path = Path::from(key);
        self.store
            .put(&path, PutPayload::from(payload))
            .await
            .map(|_| ())
            .map_err(|e| classify(key, e))
    }
}

/// Map a store error into the pipeline taxonomy.
fn classify(key: &str, err: object_store::Error) -> PipelineError {
    match err {
        object_store::Error::NotFound { .. } => PipelineError::NotFound {
            key: key.to_string(),
        },
        other => PipelineError::Transient {
            key: key.to_string(),
            source: other,
        },
    }
}

/// Client options tuned for many concurrent chunk transfers.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(60))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(64)
}

/// Transport-level retry for 429s and 5xx responses.
fn create_transport_retry() -> object_store::RetryConfig {
    object_store::RetryConfig {
        max_retries: 3,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create the object store named by the configuration.
///
/// Local paths are created if missing; S3 credentials and region come from
/// the environment (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION),
/// AWS config files, or the instance profile, with explicit config fields
/// taking precedence.
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match (&config.local_path, &config.bucket) {
        (Some(local_path), _) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)?;
            }
            tracing::info!("Using local filesystem store at: {}", path.display());
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        (_, Some(bucket)) => {
            tracing::info!("Using S3 store for bucket: {}", bucket);
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .with_client_options(create_client_options())
                .with_retry(create_transport_retry());

            if let Some(region) = &config.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &config.endpoint_url {
                builder = builder.with_endpoint(endpoint).with_allow_http(true);
            }
            if config.anonymous {
                builder = builder.with_skip_signature(true);
            }

            Ok(Arc::new(builder.build()?))
        }
        _ => anyhow::bail!("Invalid config: no store destination"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn memory_store(retry: RetryPolicy) -> ChunkStore {
        ChunkStore::new(
            Arc::new(InMemory::new()),
            ChunkKeys::new("sample.txt", ""),
            retry,
        )
    }

    #[test]
    fn test_key_scheme() {
        let keys = ChunkKeys::new("sample.txt", "");
        assert_eq!(keys.raw(0), "sample.txt-chunk-0");
        assert_eq!(keys.compressed(0), "sample.txt-chunk-compressed-0");
        assert_eq!(keys.raw(1166), "sample.txt-chunk-1166");
    }

    #[test]
    fn test_key_scheme_with_suffix() {
        let keys = ChunkKeys::new("sample.txt", ".succinct");
        assert_eq!(keys.raw(3), "sample.txt-chunk-3.succinct");
        assert_eq!(
            keys.compressed(3),
            "sample.txt-chunk-compressed-3.succinct"
        );
    }

    #[test]
    fn test_backoff_schedule_doubles_and_caps() {
        let policy = RetryPolicy::new(&RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        });
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        // Capped
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(20), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_round_trip_through_memory_store() {
        let store = memory_store(RetryPolicy::none());
        store
            .put_chunk(0, Bytes::from_static(b"payload"))
            .await
            .unwrap();

        // Outputs land under the compressed key, not the raw key
        let err = store.get_chunk(0).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_missing_chunk_is_not_found() {
        let store = memory_store(RetryPolicy::none());
        let err = store.get_chunk(42).await.unwrap_err();
        match err {
            PipelineError::NotFound { key } => assert_eq!(key, "sample.txt-chunk-42"),
            other => panic!("expected NotFound, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        // A generous retry budget must not delay a NotFound failure.
        let store = memory_store(RetryPolicy::new(&RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
        }));
        let started = std::time::Instant::now();
        let err = store.get_chunk(0).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_create_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            bucket: None,
            region: None,
            endpoint_url: None,
            anonymous: false,
            local_path: Some(dir.path().to_string_lossy().into_owned()),
        };
        assert!(create_store(&config).is_ok());
    }

    #[test]
    fn test_create_s3_store() {
        let config = StoreConfig {
            bucket: Some("succinct-datasets".to_string()),
            region: Some("us-east-2".to_string()),
            endpoint_url: None,
            anonymous: true,
            local_path: None,
        };
        assert!(create_store(&config).is_ok());
    }
}
