//! meshcall server: method registry and dispatcher, remote routing between
//! peer instances, coordination-store backed locks and jobs, and the axum
//! gateway in front of them.

pub mod coordination;
pub mod network;
pub mod remote;
pub mod service;

pub use coordination::{
    run_exclusive, DistributedMutex, EtcdStore, LockError, LockOptions, MemoryStore,
};
pub use network::{NetworkConfig, NetworkModule, ShutdownController};
pub use remote::{RemoteRouter, ServiceAnnouncer, ServiceDirectory, ServiceEndpoint};
pub use service::{
    build_call_pipeline, Capability, Dispatcher, DispatcherBuilder, Exports, InstrumentMode,
    MethodRegistry, ServerConfig,
};
