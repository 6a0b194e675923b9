//! Load-shedding middleware for calls.
//!
//! Rejects calls while `max_concurrent_calls` are already in flight with a
//! `ResourceExhausted` response.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use meshcall_core::code::RESOURCE_EXHAUSTED;
use meshcall_core::Response;
use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::warn;

use crate::service::operation::{Call, CallFuture};

/// Message returned to shed callers.
pub const OVERLOADED_MSG: &str = "server overloaded";

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent calls via a semaphore.
///
/// When all permits are taken, incoming calls are answered immediately
/// rather than queued.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: self.semaphore.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<Call> for LoadShedService<S>
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
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            warn!(
                event = "shed",
                app = %call.request.app(),
                method = %call.request.method(),
                "rejecting call"
            );
            return Box::pin(async { Ok(Response::empty(RESOURCE_EXHAUSTED, OVERLOADED_MSG)) });
        };

        let fut = self.inner.call(call);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
