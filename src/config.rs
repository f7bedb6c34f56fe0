//! Configuration for the chunk compression pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Dataset addressing (key prefix and chunk count)
    pub dataset: DatasetConfig,

    /// Remote store configuration
    pub store: StoreConfig,

    /// Codec configuration
    #[serde(default)]
    pub codec: CodecConfig,

    /// Pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Dataset addressing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Key prefix for the dataset. Raw chunks live at
    /// `<prefix>-chunk-<i>` and outputs at `<prefix>-chunk-compressed-<i>`.
    pub prefix: String,

    /// Number of chunks the dataset was split into. Fixed for a run.
    pub num_chunks: u64,

    /// Optional suffix appended to every object key (e.g. ".succinct").
    #[serde(default)]
    pub key_suffix: String,
}

/// Remote store configuration.
///
/// Exactly one of `bucket` or `local_path` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// S3 bucket holding the dataset chunks
    #[serde(default)]
    pub bucket: Option<String>,

    /// AWS region for the bucket
    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3 endpoint (for LocalStack, MinIO, etc.)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Skip request signing (public buckets)
    #[serde(default)]
    pub anonymous: bool,

    /// Local filesystem directory standing in for the remote store.
    /// Mutually exclusive with `bucket`.
    #[serde(default)]
    pub local_path: Option<String>,
}

impl StoreConfig {
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// The store location as a display string.
    pub fn location_display(&self) -> String {
        if let Some(path) = &self.local_path {
            path.clone()
        } else {
            format!("s3://{}", self.bucket.as_deref().unwrap_or(""))
        }
    }
}

/// Codec selection and settings. The pipeline treats the codec as an
/// opaque, deterministic, CPU-bound function of the chunk payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Encoding scheme selector
    #[serde(default)]
    pub scheme: CodecScheme,

    /// Zstd compression level (0-22), ignored by other schemes
    #[serde(default = "default_zstd_level")]
    pub level: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecScheme {
    /// Pass chunks through unchanged (useful for pipeline validation)
    Identity,
    /// Zstd block compression
    #[default]
    Zstd,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            scheme: CodecScheme::Zstd,
            level: default_zstd_level(),
        }
    }
}

/// Pipeline tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How many raw chunks may be resident (fetched but not yet encoded)
    /// at once. Bounds how far the fetch stage runs ahead of encode.
    #[serde(default = "default_slot_capacity")]
    pub raw_capacity: usize,

    /// How many encoded chunks may be resident (encoded but not yet
    /// uploaded) at once. Bounds how far encode runs ahead of upload.
    #[serde(default = "default_slot_capacity")]
    pub encoded_capacity: usize,

    /// Retry policy for transient store failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Print progress metrics during the run
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save the per-chunk timing log as JSON after the run
    #[serde(default)]
    pub timings_output_path: Option<String>,

    /// Number of Tokio worker threads (null = num CPUs)
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_capacity: default_slot_capacity(),
            encoded_capacity: default_slot_capacity(),
            retry: RetryConfig::default(),
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            timings_output_path: None,
            worker_threads: None,
        }
    }
}

/// Retry configuration for transient store failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial request
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds (doubles each retry)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON, so it also covers unknown extensions
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dataset.prefix.is_empty() {
            anyhow::bail!("Dataset prefix must not be empty");
        }
        if self.dataset.num_chunks == 0 {
            anyhow::bail!("Chunk count must be >= 1");
        }

        match (&self.store.local_path, &self.store.bucket) {
            (Some(_), Some(_)) => {
                anyhow::bail!("Cannot specify both local_path and bucket");
            }
            (None, None) => {
                anyhow::bail!("Must specify either local_path or bucket");
            }
            _ => {}
        }

        if self.pipeline.raw_capacity == 0 || self.pipeline.encoded_capacity == 0 {
            anyhow::bail!("Slot capacities must be >= 1");
        }
        if self.codec.level < 0 || self.codec.level > 22 {
            anyhow::bail!("Zstd level must be 0-22");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_zstd_level() -> i32 {
    3
}
fn default_slot_capacity() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_metrics_interval() -> u64 {
    10
}
fn default_max_retries() -> usize {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
