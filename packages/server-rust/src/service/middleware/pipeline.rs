//! Pipeline composition: combines all middleware layers into a single service stack.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::service::config::DispatchConfig;
use crate::service::dispatcher::{DispatchService, Dispatcher};

/// The assembled call pipeline. Cheap to clone; clones share the
/// concurrency limit.
pub type CallPipeline = LoadShedService<TimeoutService<MetricsService<DispatchService>>>;

/// Wraps the dispatcher with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `TimeoutLayer` -- enforce the call deadline
/// 3. `MetricsLayer` -- span and in-flight gauge (closest to the dispatcher)
#[must_use]
pub fn build_call_pipeline(dispatcher: Arc<Dispatcher>, config: &DispatchConfig) -> CallPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_calls))
        .layer(TimeoutLayer::new(config.default_call_timeout))
        .layer(MetricsLayer)
        .service(DispatchService::new(dispatcher))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
