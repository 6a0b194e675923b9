//! Types carried through the dispatch pipeline.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

use meshcall_core::{CallContext, Request, Response};

/// One inbound call: the request envelope plus its context.
#[derive(Debug, Clone)]
pub struct Call {
    pub ctx: CallContext,
    pub request: Request,
}

impl Call {
    #[must_use]
    pub fn new(ctx: CallContext, request: Request) -> Self {
        Self { ctx, request }
    }
}

/// Every failure is encoded into the [`Response`], so pipeline services
/// never error.
pub type CallFuture = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

/// Which resolution path served a call. Used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPath {
    Local,
    Remote,
    Proxy,
}

impl CallPath {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Proxy => "proxy",
        }
    }
}
