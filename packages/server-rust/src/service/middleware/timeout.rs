//! Deadline middleware for calls.
//!
//! Calls arriving without a deadline get the configured default. A call
//! still running when its deadline passes is answered with
//! `DeadlineExceeded` and its context is cancelled so nested remote calls
//! and lock waits stop too.

use std::convert::Infallible;
use std::task::{Context, Poll};
use std::time::Duration;

use meshcall_core::Response;
use tower::{Layer, Service};
use tracing::warn;

use crate::service::operation::{Call, CallFuture};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that enforces each call's context deadline.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    default_timeout: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            default_timeout: self.default_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    default_timeout: Duration,
}

impl<S> Service<Call> for TimeoutService<S>
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

    fn call(&mut self, mut call: Call) -> Self::Future {
        if call.ctx.deadline().is_none() {
            call.ctx = call.ctx.with_timeout(self.default_timeout);
        }
        let remaining = call.ctx.remaining().unwrap_or(self.default_timeout);
        let token = call.ctx.cancellation_token();
        let target = format!("{}/{}", call.request.app(), call.request.method());

        let fut = self.inner.call(call);
        Box::pin(async move {
            match tokio::time::timeout(remaining, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    token.cancel();
                    #[allow(clippy::cast_possible_truncation)]
                    let timeout_ms = remaining.as_millis() as u64;
                    warn!(
                        event = "timeout",
                        target = %target,
                        timeout_ms,
                        "call deadline exceeded"
                    );
                    Ok(Response::timeout(&target))
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use meshcall_core::code::DEADLINE_EXCEEDED;
    use meshcall_core::{CallContext, Request};
    use tower::ServiceExt;

    use super::*;

    /// Service that sleeps and records the deadline it saw.
    #[derive(Clone, Default)]
    struct SlowService {
        delay_ms: u64,
        seen: Arc<Mutex<Option<Option<Duration>>>>,
    }

    impl Service<Call> for SlowService {
        type Response = Response;
        type Error = Infallible;
        type Future = CallFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, call: Call) -> Self::Future {
            *self.seen.lock().unwrap() = Some(call.ctx.remaining());
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Response::success("{}"))
            })
        }
    }

    fn make_call(ctx: CallContext) -> Call {
        Call::new(ctx, Request::new("orders", "list", ""))
    }

    #[tokio::test]
    async fn completes_within_deadline() {
        let svc = TimeoutLayer::new(Duration::from_secs(1)).layer(SlowService {
            delay_ms: 10,
            ..SlowService::default()
        });
        let rsp = svc.oneshot(make_call(CallContext::new())).await.unwrap();
        assert!(rsp.is_ok());
    }

    #[tokio::test]
    async fn exceeding_context_deadline_returns_deadline_exceeded() {
        let svc = TimeoutLayer::new(Duration::from_secs(10)).layer(SlowService {
            delay_ms: 500,
            ..SlowService::default()
        });
        let ctx = CallContext::new().with_timeout(Duration::from_millis(30));
        let token = ctx.cancellation_token();

        let rsp = svc.oneshot(make_call(ctx)).await.unwrap();
        assert_eq!(rsp.code(), DEADLINE_EXCEEDED);
        assert_eq!(rsp.msg(), "call [orders/list] timeout");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn default_deadline_applies_when_missing() {
        let inner = SlowService {
            delay_ms: 200,
            ..SlowService::default()
        };
        let seen = inner.seen.clone();
        let svc = TimeoutLayer::new(Duration::from_millis(20)).layer(inner);

        let rsp = svc.oneshot(make_call(CallContext::new())).await.unwrap();
        assert_eq!(rsp.code(), DEADLINE_EXCEEDED);
        let remaining = seen.lock().unwrap().flatten().unwrap();
        assert!(remaining <= Duration::from_millis(20));
    }
}
