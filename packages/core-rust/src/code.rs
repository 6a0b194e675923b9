//! Signed response-code taxonomy shared by handlers, the executor and peers.
//!
//! Every outcome of a call is reported through `Response::code`. Zero is
//! success; the framework reserves a handful of negative codes for its own
//! failures and leaves every other value to business logic.

use std::fmt;

use serde::Serialize;

/// Numeric response code carried in every `Response`.
pub type Code = i32;

/// The call completed and its result is in `data`.
pub const OK: Code = 0;
/// Default code for a business error that did not pick one.
pub const BUSINESS: Code = -1;
/// The payload could not be decoded into the handler's parameter type.
pub const INVALID_ARGUMENT: Code = -3;
/// The call (or a remote hop) ran out of time.
pub const DEADLINE_EXCEEDED: Code = -4;
/// The remote app is not present in the service directory.
pub const NOT_FOUND: Code = -5;
/// The gateway shed the call because too many are in flight.
pub const RESOURCE_EXHAUSTED: Code = -8;
/// No binding exists for the app or method.
pub const UNIMPLEMENTED: Code = -12;
/// A handler fault or an unmapped failure.
pub const INTERNAL: Code = -13;
/// The payload decoded but failed field validation.
pub const FAILED_PRECONDITION: Code = -36;

/// Message attached to successful responses.
pub const MSG_SUCCESS: &str = "success";

/// Classification of a raw code, used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Success,
    InvalidArgument,
    FailedPrecondition,
    Unimplemented,
    NotFound,
    DeadlineExceeded,
    ResourceExhausted,
    Internal,
    /// Any code chosen by business logic.
    Business(Code),
}

impl CodeKind {
    /// Classifies a raw response code.
    #[must_use]
    pub fn of(code: Code) -> Self {
        match code {
            OK => Self::Success,
            INVALID_ARGUMENT => Self::InvalidArgument,
            FAILED_PRECONDITION => Self::FailedPrecondition,
            UNIMPLEMENTED => Self::Unimplemented,
            NOT_FOUND => Self::NotFound,
            DEADLINE_EXCEEDED => Self::DeadlineExceeded,
            RESOURCE_EXHAUSTED => Self::ResourceExhausted,
            INTERNAL => Self::Internal,
            other => Self::Business(other),
        }
    }

    /// Returns true for codes the framework itself produces on failure.
    #[must_use]
    pub fn is_framework_failure(self) -> bool {
        !matches!(self, Self::Success | Self::Business(_))
    }
}

impl fmt::Display for CodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::InvalidArgument => f.write_str("invalid_argument"),
            Self::FailedPrecondition => f.write_str("failed_precondition"),
            Self::Unimplemented => f.write_str("unimplemented"),
            Self::NotFound => f.write_str("not_found"),
            Self::DeadlineExceeded => f.write_str("deadline_exceeded"),
            Self::ResourceExhausted => f.write_str("resource_exhausted"),
            Self::Internal => f.write_str("internal"),
            Self::Business(code) => write!(f, "business({code})"),
        }
    }
}

// ---------------------------------------------------------------------------
// BusinessError
// ---------------------------------------------------------------------------

/// An application-level failure with an explicit code.
///
/// When a handler returns one of these, the executor propagates `code` and
/// `message` verbatim and serialises `data` (if any) as the response payload,
/// so handlers can hand back a partial result alongside the error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct BusinessError {
    code: Code,
    message: String,
    data: Option<serde_json::Value>,
}

impl BusinessError {
    /// Creates a business error with the default code (`-1`).
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(BUSINESS, message)
    }

    /// Creates a business error with an explicit code.
    pub fn with_code(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches a partial result. Values that fail to serialise are dropped.
    #[must_use]
    pub fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }

    #[must_use]
    pub fn invalid_param() -> Self {
        Self::new("invalid param")
    }

    #[must_use]
    pub fn not_found() -> Self {
        Self::new("not found")
    }

    #[must_use]
    pub fn not_exist() -> Self {
        Self::new("not exist")
    }

    #[must_use]
    pub fn reach_limit() -> Self {
        Self::new("reach limit")
    }

    #[must_use]
    pub fn no_permission() -> Self {
        Self::new("no permission")
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self::with_code(DEADLINE_EXCEEDED, "timeout")
    }

    #[must_use]
    pub fn code(&self) -> Code {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }
}

// ---------------------------------------------------------------------------
// CallError
// ---------------------------------------------------------------------------

/// Error type returned by every registered handler.
///
/// `Business` errors keep their code; anything else is reported to the
/// caller as `INTERNAL` and only described in the log.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Business(#[from] BusinessError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CallError {
    /// Wraps any error as an internal failure.
    pub fn internal<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal(anyhow::Error::new(err))
    }

    /// Shorthand for a business error with an explicit code.
    pub fn business(code: Code, message: impl Into<String>) -> Self {
        Self::Business(BusinessError::with_code(code, message))
    }
}
