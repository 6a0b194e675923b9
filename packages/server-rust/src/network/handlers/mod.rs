//! Axum handlers and the state they share.

pub mod gateway;
pub mod health;

pub use gateway::{api_handler, rpc_handler};
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::service::{CallPipeline, Dispatcher};

/// Cloned into every handler; all fields are cheap handles.
#[derive(Clone)]
pub struct AppState {
    /// Middleware-wrapped dispatcher used for every call.
    pub pipeline: CallPipeline,
    /// Used for introspection in health output.
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    pub start_time: Instant,
}
