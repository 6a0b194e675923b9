//! Call metrics.
//!
//! [`CallMetrics`] records one counter increment and one latency observation
//! per call; it is shared by the local executor and the remote router.
//! [`MetricsLayer`] wraps the whole pipeline with a tracing span and an
//! in-flight gauge.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use meshcall_core::code::UNIMPLEMENTED;
use meshcall_core::{Code, Response};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::operation::{Call, CallFuture, CallPath};

/// Counter of completed calls.
pub const CALLS_TOTAL: &str = "meshcall_calls_total";
/// Histogram of call latency in seconds.
pub const CALL_DURATION: &str = "meshcall_call_duration_seconds";
/// Gauge of calls currently inside the pipeline.
pub const CALLS_IN_FLIGHT: &str = "meshcall_calls_in_flight";
/// Histogram buckets for [`CALL_DURATION`].
pub const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0];
/// Method label for calls that matched no binding.
pub const UNKNOWN_METHOD_LABEL: &str = "unknown";

// ---------------------------------------------------------------------------
// CallMetrics
// ---------------------------------------------------------------------------

/// Records per-call metrics keyed by host, instance, app and method.
#[derive(Debug, Clone)]
pub struct CallMetrics {
    host: Arc<str>,
    instance: Arc<str>,
}

impl CallMetrics {
    #[must_use]
    pub fn new(host: &str, instance: &str) -> Self {
        Self {
            host: Arc::from(host),
            instance: Arc::from(instance),
        }
    }

    /// Unimplemented methods share [`UNKNOWN_METHOD_LABEL`] so arbitrary
    /// caller-chosen names cannot grow the series count.
    pub fn record(&self, path: CallPath, app: &str, method: &str, code: Code, elapsed: Duration) {
        let method = method_label(method, code);
        metrics::counter!(
            CALLS_TOTAL,
            "host" => self.host.to_string(),
            "instance" => self.instance.to_string(),
            "app" => app.to_string(),
            "method" => method.to_string(),
            "status" => code.to_string(),
            "path" => path.as_str(),
        )
        .increment(1);

        metrics::histogram!(
            CALL_DURATION,
            "host" => self.host.to_string(),
            "instance" => self.instance.to_string(),
            "app" => app.to_string(),
            "method" => method.to_string(),
            "path" => path.as_str(),
        )
        .record(elapsed.as_secs_f64());
    }
}

#[must_use]
pub fn method_label(method: &str, code: Code) -> &str {
    if code == UNIMPLEMENTED {
        UNKNOWN_METHOD_LABEL
    } else {
        method
    }
}

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps each call in a tracing span and tracks the number
/// of calls in flight.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

/// Service produced by [`MetricsLayer`].
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Call> for MetricsService<S>
where
    S: Service<Call, Response = Response, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = CallFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: Call) -> Self::Future {
        let span = info_span!(
            "call",
            app = %call.request.app(),
            method = %call.request.method(),
            trace = %call.ctx.trace_id,
            code = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        let fut = self.inner.call(call);

        Box::pin(
            async move {
                let gauge = metrics::gauge!(CALLS_IN_FLIGHT);
                gauge.increment(1.0);
                let start = Instant::now();
                let result = fut.await;
                gauge.decrement(1.0);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                if let Ok(rsp) = &result {
                    span.record("code", rsp.code());
                }
                result
            }
            .instrument(span),
        )
    }
}
