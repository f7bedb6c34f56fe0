//! Progress counters and the per-chunk timing log.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// One of the three pipeline stages, in upstream-to-downstream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Encode,
    Upload,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Fetch => write!(f, "fetch"),
            Stage::Encode => write!(f, "encode"),
            Stage::Upload => write!(f, "upload"),
        }
    }
}

/// One entry of the append-only timing log: when a stage started a chunk
/// (relative to the run epoch) and how long the unit took. Written exactly
/// once per (chunk, stage).
#[derive(Debug, Clone, Serialize)]
pub struct TimingRecord {
    pub chunk: u64,
    pub stage: Stage,
    #[serde(serialize_with = "serialize_duration")]
    pub start_offset: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

/// Append-only per-(chunk, stage) timing log, consumed once at run end to
/// compute aggregates.
#[derive(Debug, Default)]
pub struct TimingLog {
    records: Mutex<Vec<TimingRecord>>,
}

impl TimingLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, chunk: u64, stage: Stage, start_offset: Duration, duration: Duration) {
        let mut records = self.records.lock().expect("timing log lock poisoned");
        records.push(TimingRecord {
            chunk,
            stage,
            start_offset,
            duration,
        });
    }

    /// Snapshot of all records in append order.
    pub fn records(&self) -> Vec<TimingRecord> {
        self.records.lock().expect("timing log lock poisoned").clone()
    }

    /// Total time a stage spent on completed units.
    pub fn stage_total(&self, stage: Stage) -> Duration {
        self.records
            .lock()
            .expect("timing log lock poisoned")
            .iter()
            .filter(|r| r.stage == stage)
            .map(|r| r.duration)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("timing log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Save the full log to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.records())?;
        std::fs::write(path, json)?;
        tracing::info!("Timing log saved to {}", path);
        Ok(())
    }
}

/// Live progress counters for the pipeline.
#[derive(Debug)]
pub struct Metrics {
    /// Chunks fetched from the store
    pub chunks_fetched: AtomicU64,

    /// Chunks encoded
    pub chunks_encoded: AtomicU64,

    /// Chunks uploaded to the store
    pub chunks_uploaded: AtomicU64,

    /// Raw bytes fetched
    pub bytes_fetched: AtomicU64,

    /// Encoded bytes uploaded
    pub bytes_uploaded: AtomicU64,

    /// Fatal stage failures (at most one per run)
    pub failures: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chunks_fetched: AtomicU64::new(0),
            chunks_encoded: AtomicU64::new(0),
            chunks_uploaded: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    pub fn add_chunk_fetched(&self) {
        self.chunks_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_encoded(&self) {
        self.chunks_encoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_uploaded(&self) {
        self.chunks_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_fetched(&self, bytes: u64) {
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_fetched: self.chunks_fetched.load(Ordering::Relaxed),
            chunks_encoded: self.chunks_encoded.load(Ordering::Relaxed),
            chunks_uploaded: self.chunks_uploaded.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_fetched: u64,
    pub chunks_encoded: u64,
    pub chunks_uploaded: u64,
    pub bytes_fetched: u64,
    pub bytes_uploaded: u64,
    pub failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunks: {} fetched, {} encoded, {} uploaded | \
             Read: {:.2} MB | Wrote: {:.2} MB | Failures: {} | Elapsed: {:.1}s",
            self.chunks_fetched,
            self.chunks_encoded,
            self.chunks_uploaded,
            self.bytes_fetched as f64 / (1024.0 * 1024.0),
            self.bytes_uploaded as f64 / (1024.0 * 1024.0),
            self.failures,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic progress reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_chunks: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_chunks: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_chunks,
        }
    }

    /// Log progress at the configured interval until shutdown.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        // The first tick fires immediately; skip it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_chunks > 0 {
                        snapshot.chunks_uploaded as f64 / self.total_chunks as f64 * 100.0
                    } else {
                        0.0
                    };
                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.add_chunk_fetched();
        metrics.add_chunk_fetched();
        metrics.add_chunk_encoded();
        metrics.add_bytes_fetched(1024);
        metrics.add_bytes_fetched(512);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_fetched, 2);
        assert_eq!(snapshot.chunks_encoded, 1);
        assert_eq!(snapshot.chunks_uploaded, 0);
        assert_eq!(snapshot.bytes_fetched, 1536);
    }

    #[test]
    fn test_timing_log_append_order() {
        let log = TimingLog::new();
        log.record(0, Stage::Fetch, Duration::ZERO, Duration::from_millis(5));
        log.record(1, Stage::Fetch, Duration::from_millis(5), Duration::from_millis(7));
        log.record(0, Stage::Encode, Duration::from_millis(6), Duration::from_millis(2));

        let records = log.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].chunk, 0);
        assert_eq!(records[1].chunk, 1);
        assert_eq!(records[2].stage, Stage::Encode);
    }

    #[test]
    fn test_stage_totals() {
        let log = TimingLog::new();
        log.record(0, Stage::Fetch, Duration::ZERO, Duration::from_millis(100));
        log.record(1, Stage::Fetch, Duration::ZERO, Duration::from_millis(50));
        log.record(0, Stage::Upload, Duration::ZERO, Duration::from_millis(25));

        assert_eq!(log.stage_total(Stage::Fetch), Duration::from_millis(150));
        assert_eq!(log.stage_total(Stage::Upload), Duration::from_millis(25));
        assert_eq!(log.stage_total(Stage::Encode), Duration::ZERO);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = MetricsSnapshot {
            chunks_fetched: 10,
            chunks_encoded: 9,
            chunks_uploaded: 8,
            bytes_fetched: 1024 * 1024,
            bytes_uploaded: 512 * 1024,
            failures: 1,
            elapsed: Duration::from_secs(3),
        };
        let display = format!("{}", snapshot);
        assert!(display.contains("10 fetched"));
        assert!(display.contains("9 encoded"));
        assert!(display.contains("8 uploaded"));
        assert!(display.contains("Failures: 1"));
    }

    #[test]
    fn test_save_to_file() {
        let log = TimingLog::new();
        log.record(0, Stage::Fetch, Duration::ZERO, Duration::from_millis(5));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timings.json");
        log.save_to_file(path.to_str().unwrap()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed[0]["chunk"], 0);
        assert_eq!(parsed[0]["stage"], "fetch");
    }
}
