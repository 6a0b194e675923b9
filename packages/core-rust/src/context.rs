use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Metadata keys propagated between gateway, dispatcher and peers.
pub mod keys {
    pub const TRACE: &str = "trace";
    pub const SPAN: &str = "span";
    pub const USER: &str = "user";
    pub const FROM: &str = "from";
    pub const CLIENT: &str = "client";
    pub const USER_AGENT: &str = "ua";
    pub const LANGUAGE: &str = "language";
    /// Remaining deadline of the caller, in milliseconds.
    pub const TIMEOUT_MS: &str = "timeout-ms";
}

/// User-agent stamped on peer-to-peer calls.
pub const RPC_USER_AGENT: &str = "meshcall rpc";

/// Why a context is no longer live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Per-call context: identity and tracing metadata, deadline and cancellation.
///
/// Created by the gateway (or the peer endpoint) for each inbound call and
/// handed by value to the request-scoped capability instance. Cloning shares
/// the cancellation token; [`CallContext::child`] derives one that can be
/// cancelled independently.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub trace_id: String,
    pub span_id: String,
    pub user: String,
    pub from: String,
    pub client: String,
    pub user_agent: String,
    pub language: String,
    /// Target app, filled in by the dispatcher.
    pub app: String,
    /// Target method, filled in by the dispatcher.
    pub method: String,
    /// Metadata keys not covered by the named fields.
    pub extra: BTreeMap<String, String>,
    deadline: Option<Instant>,
    received_at: Instant,
    cancel: CancellationToken,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// An empty context with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trace_id: String::new(),
            span_id: String::new(),
            user: String::new(),
            from: String::new(),
            client: String::new(),
            user_agent: String::new(),
            language: String::new(),
            app: String::new(),
            method: String::new(),
            extra: BTreeMap::new(),
            deadline: None,
            received_at: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Builds a context from transport metadata (headers, peer metadata).
    ///
    /// Keys are matched case-insensitively; empty values are ignored. A
    /// `timeout-ms` entry becomes the context deadline.
    pub fn from_metadata<'a, I>(metadata: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut ctx = Self::new();
        for (key, value) in metadata {
            if value.is_empty() {
                continue;
            }
            let key = key.to_ascii_lowercase();
            match key.as_str() {
                keys::TRACE => ctx.trace_id = value.to_string(),
                keys::SPAN => ctx.span_id = value.to_string(),
                keys::USER => ctx.user = value.to_string(),
                keys::FROM => ctx.from = value.to_string(),
                keys::CLIENT => ctx.client = value.to_string(),
                keys::USER_AGENT => ctx.user_agent = value.to_string(),
                keys::LANGUAGE => ctx.language = value.to_string(),
                keys::TIMEOUT_MS => {
                    if let Ok(ms) = value.parse::<u64>() {
                        ctx.deadline = Some(ctx.received_at + Duration::from_millis(ms));
                    }
                }
                _ => {
                    ctx.extra.insert(key, value.to_string());
                }
            }
        }
        ctx
    }

    /// Metadata for an outbound peer call made on behalf of this context.
    ///
    /// Trace, span, user and language travel unchanged; `from` is replaced by
    /// the calling instance and the remaining deadline is attached.
    #[must_use]
    pub fn outbound_metadata(&self, instance: &str) -> BTreeMap<&'static str, String> {
        let mut md = BTreeMap::new();
        md.insert(keys::FROM, instance.to_string());
        md.insert(keys::CLIENT, std::process::id().to_string());
        md.insert(keys::USER_AGENT, RPC_USER_AGENT.to_string());
        for (key, value) in [
            (keys::TRACE, &self.trace_id),
            (keys::SPAN, &self.span_id),
            (keys::USER, &self.user),
            (keys::LANGUAGE, &self.language),
        ] {
            if !value.is_empty() {
                md.insert(key, value.clone());
            }
        }
        if let Some(remaining) = self.remaining() {
            md.insert(keys::TIMEOUT_MS, remaining.as_millis().to_string());
        }
        md
    }

    /// Sets the deadline, keeping the earlier one if already set.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Sets the deadline relative to now, keeping an earlier one if set.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a context whose cancellation is independent of siblings but
    /// still follows this one.
    #[must_use]
    pub fn child(&self) -> Self {
        let mut child = self.clone();
        child.cancel = self.cancel.child_token();
        child
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; zero once passed, `None` without one.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// Cancels this context and every child derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns why the context is no longer live, or `None` while it is.
    #[must_use]
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.cancel.cancelled() => ContextError::Cancelled,
                    () = tokio::time::sleep_until(deadline.into()) => {
                        ContextError::DeadlineExceeded
                    }
                }
            }
            None => {
                self.cancel.cancelled().await;
                ContextError::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_fills_named_fields_and_extras() {
        let ctx = CallContext::from_metadata([
            ("Trace", "t-1"),
            ("span", "s-1"),
            ("USER", "alice"),
            ("language", ""),
            ("tenant", "acme"),
        ]);
        assert_eq!(ctx.trace_id, "t-1");
        assert_eq!(ctx.span_id, "s-1");
        assert_eq!(ctx.user, "alice");
        assert!(ctx.language.is_empty());
        assert_eq!(ctx.extra.get("tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn timeout_metadata_sets_deadline() {
        let ctx = CallContext::from_metadata([("timeout-ms", "5000")]);
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::from_secs(4));
    }

    #[test]
    fn outbound_metadata_propagates_identity() {
        let mut ctx = CallContext::new();
        ctx.trace_id = "t-9".into();
        ctx.user = "bob".into();
        ctx.from = "browser".into();
        let md = ctx.outbound_metadata("inst-a");
        assert_eq!(md[keys::TRACE], "t-9");
        assert_eq!(md[keys::USER], "bob");
        assert_eq!(md[keys::FROM], "inst-a");
        assert_eq!(md[keys::USER_AGENT], RPC_USER_AGENT);
        assert!(!md.contains_key(keys::SPAN));
        assert!(!md.contains_key(keys::TIMEOUT_MS));
    }

    #[test]
    fn with_deadline_keeps_earliest() {
        let now = Instant::now();
        let ctx = CallContext::new()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn cancelled_parent_cancels_child() {
        let parent = CallContext::new();
        let child = parent.child();
        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn cancelled_child_leaves_parent_live() {
        let parent = CallContext::new();
        let child = parent.child();
        child.cancel();
        assert!(parent.err().is_none());
    }

    #[tokio::test]
    async fn done_fires_on_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(20));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }
}
