//! Cache population: warm-up, streaming and retry.

pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod retry;

pub use limiter::RateLimiter;
pub use metrics::{PipelineMetrics, PipelineMetricsSnapshot};
pub use pipeline::{IngestionPipeline, PipelineState, PipelineStatus};
pub use retry::{Cooldown, RetryEntry, RetryQueue};
