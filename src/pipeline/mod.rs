//! The fetch/encode/upload pipeline.

pub mod metrics;
pub mod orchestrator;
pub mod slots;
pub mod workers;

pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot, Stage, TimingLog, TimingRecord};
pub use orchestrator::{PipelineRunner, RunFailure, RunReport, RunState};
pub use slots::SlotBuffer;
pub use workers::StageFailure;
