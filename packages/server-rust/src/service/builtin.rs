//! Built-in apps: `sys`, served by every instance, and `debug`, served in
//! dev mode only.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use meshcall_core::{CallContext, CallError, CallParam, Empty, ValidationErrors, Validator};
use serde::{Deserialize, Serialize};

use super::registry::{Capability, Exports};

type JsonObject = serde_json::Map<String, serde_json::Value>;

/// App name of the built-in capability.
pub const SYS_APP: &str = "sys";

/// App name of the diagnostic capability stripped in release mode.
pub const DEBUG_APP: &str = "debug";

/// App -> sorted method names, filled once the dispatcher is built.
pub type MethodListing = Arc<OnceLock<BTreeMap<String, Vec<String>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Unix time in milliseconds.
    pub tick: u64,
}

/// Liveness and introspection methods.
#[derive(Debug, Clone, Default)]
pub struct Sys {
    listing: MethodListing,
}

impl Sys {
    #[must_use]
    pub fn new(listing: MethodListing) -> Self {
        Self { listing }
    }

    fn heartbeat(&self) -> Heartbeat {
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Heartbeat { tick }
    }
}

impl Capability for Sys {
    fn instantiate(&self, _ctx: &CallContext) -> Self {
        self.clone()
    }

    fn export(exports: &mut Exports<Self>) {
        exports
            .method("heartbeat", |sys: Sys, _ctx, _: Empty| async move {
                Ok::<_, CallError>(sys.heartbeat())
            })
            .method("methods", |sys: Sys, _ctx, _: Empty| async move {
                Ok::<_, CallError>(sys.listing.get().cloned().unwrap_or_default())
            });
    }
}

/// Parameter of `debug.sleep`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Sleep {
    pub ms: u64,
}

impl CallParam for Sleep {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new().range("ms", self.ms, 0, 60_000).finish()
    }
}

fn boom() -> Result<Empty, CallError> {
    panic!("debug.panic called")
}

/// Diagnostics for exercising the call path by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugApp;

impl Capability for DebugApp {
    fn instantiate(&self, _ctx: &CallContext) -> Self {
        *self
    }

    fn export(exports: &mut Exports<Self>) {
        exports
            .method("echo", |_me: DebugApp, _ctx, param: JsonObject| async move {
                Ok::<_, CallError>(param)
            })
            .method("sleep", |_me: DebugApp, ctx: CallContext, sleep: Sleep| async move {
                tokio::select! {
                    () = tokio::time::sleep(std::time::Duration::from_millis(sleep.ms)) => {
                        Ok::<_, CallError>(Empty {})
                    }
                    reason = ctx.done() => Err(CallError::business(
                        meshcall_core::code::DEADLINE_EXCEEDED,
                        reason.to_string(),
                    )),
                }
            })
            .method("panic", |_me: DebugApp, _ctx, _: Empty| async move { boom() });
    }
}
