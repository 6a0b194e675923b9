//! Calls to apps served by peer instances.
//!
//! - [`directory`]: app -> service -> endpoint resolution
//! - [`client`]: transport trait and the HTTP implementation
//! - [`router`]: per-app client cache and the retry loop
//! - [`announcer`]: registers this instance in the directory

pub mod announcer;
pub mod client;
pub mod directory;
pub mod router;

pub use announcer::ServiceAnnouncer;
pub use client::{ClientFactory, HttpClientFactory, HttpRemoteClient, RemoteClient, TransportError};
pub use directory::{DirectoryRefresher, ServiceDirectory, ServiceEndpoint};
pub use router::{RemoteError, RemoteRouter, RetryPolicy};
