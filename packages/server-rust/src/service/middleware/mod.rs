//! Tower middleware layers for the call pipeline.
//!
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`timeout`]: Per-call deadline enforcement
//! - [`metrics`]: Call counters, latency histograms and tracing spans
//! - [`pipeline`]: Composes all layers around the dispatcher

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::{CallMetrics, MetricsLayer};
pub use pipeline::{build_call_pipeline, CallPipeline};
pub use timeout::TimeoutLayer;
