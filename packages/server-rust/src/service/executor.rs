//! Decode, validate, invoke and encode one resolved binding.
//!
//! The executor always produces a well-formed [`Response`]. Handler panics
//! are caught at two points: while preparing the call (decode, validation,
//! instance construction) and while polling the handler future. Either way
//! the caller sees `INTERNAL` and the process keeps serving.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use meshcall_core::code::{FAILED_PRECONDITION, INVALID_ARGUMENT};
use meshcall_core::{CallContext, CallError, CodeKind, Request, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::middleware::metrics::{CallMetrics, UNKNOWN_METHOD_LABEL};
use super::operation::CallPath;
use super::registry::{HandlerBinding, PrepareError};

/// Upper bound on the backtrace text attached to a panic log.
pub const PANIC_STACK_LIMIT: usize = 4096;

/// Calls slower than this are flagged in the log.
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(3);

/// Process-wide instrumentation variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentMode {
    /// Log every payload and surface decode errors verbatim.
    #[default]
    Dev,
    /// Log payloads only for verbose bindings and redact decode errors.
    Release,
}

impl InstrumentMode {
    #[must_use]
    pub fn is_release(self) -> bool {
        self == Self::Release
    }
}

impl std::str::FromStr for InstrumentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "debug" => Ok(Self::Dev),
            "release" | "prod" => Ok(Self::Release),
            other => Err(format!("unknown instrument mode [{other}]")),
        }
    }
}

enum Outcome {
    Done(Response),
    Panicked { message: String, stack: String },
}

/// Runs bindings and instruments each call.
#[derive(Debug, Clone)]
pub struct CallExecutor {
    mode: InstrumentMode,
    slow_threshold: Duration,
    metrics: CallMetrics,
}

impl CallExecutor {
    #[must_use]
    pub fn new(mode: InstrumentMode, metrics: CallMetrics) -> Self {
        install_panic_hook();
        Self {
            mode,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            metrics,
        }
    }

    #[must_use]
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    #[must_use]
    pub fn mode(&self) -> InstrumentMode {
        self.mode
    }

    /// Executes `binding` against `req`. A missing binding yields
    /// `UNIMPLEMENTED` without touching any handler.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        binding: Option<&HandlerBinding>,
        req: &Request,
    ) -> Response {
        let method = req.method();
        let start = Instant::now();

        let Some(binding) = binding else {
            let rsp = Response::method_not_implemented(method);
            self.metrics.record(
                CallPath::Local,
                req.app(),
                UNKNOWN_METHOD_LABEL,
                rsp.code(),
                start.elapsed(),
            );
            return rsp;
        };

        let log_payload = !self.mode.is_release() || binding.verbose;
        if log_payload && !binding.ignore_log {
            info!(
                event = "rpc",
                processor = method,
                stage = "recv",
                user = %ctx.user,
                from = %ctx.from,
                detail = %String::from_utf8_lossy(req.param()),
            );
        }

        let outcome = self.invoke(ctx, binding, req).await;
        let elapsed = start.elapsed();

        let rsp = match outcome {
            Outcome::Done(rsp) => rsp,
            Outcome::Panicked { message, stack } => {
                error!(
                    event = "panic occur @ call",
                    processor = method,
                    user = %ctx.user,
                    from = %ctx.from,
                    error = %message,
                    detail = %stack,
                );
                Response::call_failed(method)
            }
        };

        self.metrics
            .record(CallPath::Local, req.app(), method, rsp.code(), elapsed);

        if !binding.ignore_log {
            self.log_send(ctx, method, &rsp, elapsed, log_payload);
        }
        rsp
    }

    async fn invoke(&self, ctx: &CallContext, binding: &HandlerBinding, req: &Request) -> Outcome {
        let method = req.method();
        let payload = req.payload();

        let prepared = std::panic::catch_unwind(AssertUnwindSafe(|| {
            binding.invoker().prepare(ctx, &payload)
        }));

        let fut = match prepared {
            Ok(Ok(fut)) => fut,
            Ok(Err(PrepareError::Decode(err))) => {
                let msg = if self.mode.is_release() {
                    format!("decode err, payload size {}", payload.len())
                } else {
                    err.to_string()
                };
                return Outcome::Done(Response::empty(INVALID_ARGUMENT, msg));
            }
            Ok(Err(PrepareError::Validate(err))) => {
                return Outcome::Done(Response::empty(FAILED_PRECONDITION, err.to_string()));
            }
            Err(panic) => return panicked(panic.as_ref()),
        };

        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(data)) => Outcome::Done(Response::success(data)),
            Ok(Err(CallError::Business(err))) => {
                let data = err
                    .data()
                    .and_then(|value| serde_json::to_vec(value).ok())
                    .unwrap_or_default();
                Outcome::Done(Response::new(err.code(), err.message(), data))
            }
            Ok(Err(CallError::Internal(err))) => {
                warn!(
                    event = "rpc",
                    processor = method,
                    user = %ctx.user,
                    error = %format!("{err:#}"),
                    "handler failed"
                );
                Outcome::Done(Response::call_failed(method))
            }
            Err(panic) => panicked(panic.as_ref()),
        }
    }

    fn log_send(
        &self,
        ctx: &CallContext,
        method: &str,
        rsp: &Response,
        elapsed: Duration,
        log_payload: bool,
    ) {
        let slow = elapsed > self.slow_threshold;
        let kind = CodeKind::of(rsp.code());
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = elapsed.as_millis() as u64;
        let detail = if log_payload {
            String::from_utf8_lossy(rsp.data()).into_owned()
        } else {
            String::new()
        };

        if kind.is_framework_failure() {
            warn!(
                event = "rpc",
                processor = method,
                stage = "send",
                code = rsp.code(),
                kind = %kind,
                content = rsp.msg(),
                duration_ms,
                slow,
                user = %ctx.user,
                from = %ctx.from,
                detail = %detail,
            );
        } else {
            info!(
                event = "rpc",
                processor = method,
                stage = "send",
                code = rsp.code(),
                content = rsp.msg(),
                duration_ms,
                slow,
                user = %ctx.user,
                from = %ctx.from,
                detail = %detail,
            );
        }
    }
}

thread_local! {
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains a hook that records the backtrace of the panicking frames on the
/// panicking thread, then defers to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// `catch_unwind` returns on the thread that panicked, so the hook's
/// backtrace is still in this thread's slot.
fn panicked(payload: &(dyn Any + Send)) -> Outcome {
    let message = panic_message(payload);
    let stack = PANIC_STACK
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| Backtrace::force_capture().to_string());
    Outcome::Panicked {
        message,
        stack: truncate_stack(stack),
    }
}

fn truncate_stack(mut stack: String) -> String {
    if stack.len() > PANIC_STACK_LIMIT {
        let mut cut = PANIC_STACK_LIMIT;
        while !stack.is_char_boundary(cut) {
            cut -= 1;
        }
        stack.truncate(cut);
    }
    stack
}

/// Extracts the message of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
