//! Publishes this instance in the service directory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshcall_core::{CoordinationStore, LeaseId, StoreError};
use tracing::{info, warn};

use super::directory::{endpoint_key, ServiceEndpoint};
use crate::service::worker::{BackgroundRunnable, RunNow};

/// Keeps this instance's endpoint registered under a lease.
///
/// [`announce`](Self::announce) writes the entry once; afterwards each tick
/// renews the lease and re-registers if the lease was lost. The entry is
/// removed on shutdown.
pub struct ServiceAnnouncer {
    store: Arc<dyn CoordinationStore>,
    key: String,
    endpoint: ServiceEndpoint,
    ttl: Duration,
    lease: Option<LeaseId>,
}

impl ServiceAnnouncer {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        prefix: &str,
        endpoint: ServiceEndpoint,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            key: endpoint_key(prefix, &endpoint),
            endpoint,
            ttl,
            lease: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn lease(&self) -> Option<LeaseId> {
        self.lease
    }

    /// Grants a lease and writes the endpoint under it.
    pub async fn announce(&mut self) -> Result<LeaseId, StoreError> {
        let value = serde_json::to_string(&self.endpoint)
            .map_err(|e| StoreError::Request(e.to_string()))?;
        let lease = self.store.grant_lease(self.ttl).await?;
        if let Err(e) = self.store.put(&self.key, &value, Some(lease)).await {
            let _ = self.store.revoke_lease(lease).await;
            return Err(e);
        }
        self.lease = Some(lease);
        info!(
            event = "announce",
            service = %self.endpoint.service,
            instance = %self.endpoint.instance,
            address = %self.endpoint.address,
            lease = %lease,
            "registered"
        );
        Ok(lease)
    }

    /// Renews the lease, registering again when it is gone.
    pub async fn renew(&mut self) -> Result<(), StoreError> {
        let Some(lease) = self.lease else {
            return self.announce().await.map(|_| ());
        };
        match self.store.keep_alive(lease).await {
            Ok(()) => Ok(()),
            Err(StoreError::LeaseNotFound(_)) => {
                warn!(event = "announce", lease = %lease, "lease lost, registering again");
                self.lease = None;
                self.announce().await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Revokes the lease, which removes the entry.
    pub async fn withdraw(&mut self) -> Result<(), StoreError> {
        if let Some(lease) = self.lease.take() {
            self.store.revoke_lease(lease).await?;
            info!(event = "announce", key = %self.key, "withdrawn");
        }
        Ok(())
    }
}

#[async_trait]
impl BackgroundRunnable for ServiceAnnouncer {
    type Task = RunNow;

    fn name(&self) -> &'static str {
        "service-announcer"
    }

    async fn run(&mut self, _task: RunNow) {
        self.on_tick().await;
    }

    async fn on_tick(&mut self) {
        if let Err(e) = self.renew().await {
            warn!(event = "announce", key = %self.key, error = %e, "renewal failed");
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.withdraw().await {
            warn!(event = "announce", key = %self.key, error = %e, "withdraw failed");
        }
    }
}
