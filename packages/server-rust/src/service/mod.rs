//! Call registration, resolution and execution.
//!
//! 1. **Registry** (`registry`): per-app method tables built from capabilities
//! 2. **Executor** (`executor`): decode, validate, invoke, encode, contain panics
//! 3. **Dispatcher** (`dispatcher`): proxy, then local, then remote resolution
//! 4. **Middleware** (`middleware`): Tower layers (load shedding, deadline, metrics)
//! 5. **Background workers** (`worker`): periodic tasks (refresh, announce, jobs)

pub mod builtin;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod middleware;
pub mod operation;
pub mod proxy;
pub mod registry;
pub mod worker;

pub use config::{ConfigError, ServerConfig};
pub use dispatcher::{DispatchService, Dispatcher, DispatcherBuilder};
pub use executor::{CallExecutor, InstrumentMode};
pub use middleware::{build_call_pipeline, CallPipeline};
pub use operation::{Call, CallPath};
pub use proxy::{ProxyHandler, ProxyRule, ProxyTable, ProxyTarget};
pub use registry::{Capability, Exports, MethodRegistry, RegistryError};
pub use worker::{BackgroundRunnable, BackgroundWorker, RunNow};
