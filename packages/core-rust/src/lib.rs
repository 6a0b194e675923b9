//! meshcall core: the call envelope, response codes, per-call context,
//! parameter validation and the coordination store contract.
//!
//! Everything here is transport-neutral and shared by handlers, the
//! dispatcher and remote peers.

pub mod code;
pub mod context;
pub mod envelope;
pub mod traits;
pub mod validate;

pub use code::{BusinessError, CallError, Code, CodeKind};
pub use context::{CallContext, ContextError};
pub use envelope::{FinalResponse, Request, Response};
pub use traits::{CallParam, CoordinationStore, Empty, KeyValue, LeaseId, ParamShape, StoreError};
pub use validate::{ValidationErrors, Validator};
