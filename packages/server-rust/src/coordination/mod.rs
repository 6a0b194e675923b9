//! Coordination store backends and the primitives built on them.

pub mod etcd;
pub mod jobs;
pub mod memory;
pub mod mutex;

pub use etcd::EtcdStore;
pub use jobs::{run_exclusive, ExclusiveJob, JobConfig};
pub use memory::MemoryStore;
pub use mutex::{DistributedMutex, LockError, LockOptions};
