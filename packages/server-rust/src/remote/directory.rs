//! Application to endpoint directory.
//!
//! Resolution is two-step: app -> service name, then service -> endpoints.
//! Several apps may be served by one peer service. Static routes come from
//! configuration; announced endpoints come from the coordination store
//! under `<prefix>/services/` and are reloaded by [`DirectoryRefresher`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use meshcall_core::{CoordinationStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::service::worker::{BackgroundRunnable, RunNow};

/// An announced peer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service: String,
    pub instance: String,
    /// `host:port` or a full base URL.
    pub address: String,
    /// Apps this instance serves besides the one named like the service.
    #[serde(default)]
    pub apps: Vec<String>,
}

impl ServiceEndpoint {
    #[must_use]
    pub fn new(service: &str, instance: &str, address: &str) -> Self {
        Self {
            service: service.to_string(),
            instance: instance.to_string(),
            address: address.to_string(),
            apps: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_apps<I, S>(mut self, apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.apps = apps.into_iter().map(Into::into).collect();
        self
    }
}

/// Store key under which an endpoint is announced.
#[must_use]
pub fn endpoint_key(prefix: &str, endpoint: &ServiceEndpoint) -> String {
    format!("{}{}/{}", services_prefix(prefix), endpoint.service, endpoint.instance)
}

fn services_prefix(prefix: &str) -> String {
    format!("{}/services/", prefix.trim_end_matches('/'))
}

#[derive(Debug, Default)]
struct Snapshot {
    /// app -> service, static routes merged with announced ones.
    routes: HashMap<String, String>,
    /// service -> endpoints, sorted by instance.
    endpoints: HashMap<String, Vec<ServiceEndpoint>>,
}

/// Read-mostly directory of peer services.
pub struct ServiceDirectory {
    prefix: String,
    store: Option<Arc<dyn CoordinationStore>>,
    static_routes: ArcSwap<HashMap<String, String>>,
    static_endpoints: ArcSwap<HashMap<String, Vec<ServiceEndpoint>>>,
    announced: ArcSwap<Vec<ServiceEndpoint>>,
    snapshot: ArcSwap<Snapshot>,
    cursor: AtomicUsize,
}

impl std::fmt::Debug for ServiceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDirectory")
            .field("prefix", &self.prefix)
            .field("has_store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl ServiceDirectory {
    /// Directory without a store; only static entries resolve.
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            store: None,
            static_routes: ArcSwap::default(),
            static_endpoints: ArcSwap::default(),
            announced: ArcSwap::default(),
            snapshot: ArcSwap::default(),
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Routes `apps` to `service`.
    pub fn route_apps<S: AsRef<str>>(&self, service: &str, apps: &[S]) {
        self.static_routes.rcu(|current| {
            let mut next = HashMap::clone(current);
            for app in apps {
                next.insert(app.as_ref().to_string(), service.to_string());
            }
            next
        });
        self.rebuild();
    }

    /// Adds an endpoint that does not come from the store.
    pub fn add_static_endpoint(&self, endpoint: ServiceEndpoint) {
        self.static_endpoints.rcu(|current| {
            let mut next = HashMap::clone(current);
            let list = next.entry(endpoint.service.clone()).or_default();
            list.retain(|e| e.instance != endpoint.instance);
            list.push(endpoint.clone());
            list.sort_by(|a, b| a.instance.cmp(&b.instance));
            next
        });
        self.rebuild();
    }

    /// Service name serving `app`; an app without a route is looked up as a
    /// service of the same name.
    #[must_use]
    pub fn service_for(&self, app: &str) -> String {
        self.snapshot
            .load()
            .routes
            .get(app)
            .cloned()
            .unwrap_or_else(|| app.to_string())
    }

    /// Picks an endpoint for `app`, rotating across instances.
    #[must_use]
    pub fn resolve(&self, app: &str) -> Option<ServiceEndpoint> {
        let snapshot = self.snapshot.load();
        let service = snapshot.routes.get(app).map_or(app, String::as_str);
        let list = snapshot.endpoints.get(service)?;
        if list.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % list.len();
        Some(list[idx].clone())
    }

    /// Whether `address` is currently an endpoint of the service behind `app`.
    #[must_use]
    pub fn serves(&self, app: &str, address: &str) -> bool {
        let snapshot = self.snapshot.load();
        let service = snapshot.routes.get(app).map_or(app, String::as_str);
        snapshot
            .endpoints
            .get(service)
            .is_some_and(|list| list.iter().any(|e| e.address == address))
    }

    /// Instances announced for `service`.
    #[must_use]
    pub fn endpoints(&self, service: &str) -> Vec<ServiceEndpoint> {
        self.snapshot
            .load()
            .endpoints
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    /// Reloads announced endpoints from the store. Returns the number of
    /// announced instances; always zero without a store.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let entries = store.scan(&services_prefix(&self.prefix)).await?;
        let mut announced = Vec::with_capacity(entries.len());
        for kv in entries {
            match serde_json::from_str::<ServiceEndpoint>(&kv.value) {
                Ok(endpoint) => announced.push(endpoint),
                Err(e) => {
                    warn!(
                        event = "directory",
                        key = %kv.key,
                        error = %e,
                        "skip malformed endpoint"
                    );
                }
            }
        }
        let count = announced.len();
        self.announced.store(Arc::new(announced));
        self.rebuild();
        debug!(event = "directory", instances = count, "refreshed");
        Ok(count)
    }

    fn rebuild(&self) {
        let announced = self.announced.load();
        let mut endpoints = HashMap::clone(&self.static_endpoints.load());
        let mut routes = HashMap::new();

        for endpoint in announced.iter() {
            for app in &endpoint.apps {
                routes.insert(app.clone(), endpoint.service.clone());
            }
            let list = endpoints.entry(endpoint.service.clone()).or_default();
            if !list.iter().any(|e| e.instance == endpoint.instance) {
                list.push(endpoint.clone());
            }
        }
        for list in endpoints.values_mut() {
            list.sort_by(|a, b| a.instance.cmp(&b.instance));
        }
        // Configured routes win over announced ones.
        for (app, service) in self.static_routes.load().iter() {
            routes.insert(app.clone(), service.clone());
        }

        self.snapshot.store(Arc::new(Snapshot { routes, endpoints }));
    }
}

// ---------------------------------------------------------------------------
// DirectoryRefresher
// ---------------------------------------------------------------------------

/// Background runnable that reloads the directory on every tick.
pub struct DirectoryRefresher {
    directory: Arc<ServiceDirectory>,
    failures: u32,
}

impl DirectoryRefresher {
    #[must_use]
    pub fn new(directory: Arc<ServiceDirectory>) -> Self {
        Self {
            directory,
            failures: 0,
        }
    }

    async fn refresh(&mut self) {
        match self.directory.refresh().await {
            Ok(count) => {
                if self.failures > 0 {
                    info!(event = "directory", instances = count, "store reachable again");
                }
                self.failures = 0;
            }
            Err(e) => {
                self.failures += 1;
                // Keep serving the last snapshot.
                warn!(event = "directory", error = %e, failures = self.failures, "refresh failed");
            }
        }
    }
}

#[async_trait]
impl BackgroundRunnable for DirectoryRefresher {
    type Task = RunNow;

    fn name(&self) -> &'static str {
        "directory-refresh"
    }

    async fn run(&mut self, _task: RunNow) {
        self.refresh().await;
    }

    async fn on_tick(&mut self) {
        self.refresh().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;

    async fn announce(store: &MemoryStore, endpoint: &ServiceEndpoint) {
        let value = serde_json::to_string(endpoint).unwrap();
        store
            .put(&endpoint_key("/mesh", endpoint), &value, None)
            .await
            .unwrap();
    }

    #[test]
    fn static_routes_resolve_without_store() {
        let dir = ServiceDirectory::new("/mesh");
        dir.add_static_endpoint(ServiceEndpoint::new("backend", "b-1", "10.0.0.1:80"));
        dir.route_apps("backend", &["orders", "billing"]);

        assert_eq!(dir.service_for("orders"), "backend");
        assert_eq!(dir.resolve("billing").unwrap().address, "10.0.0.1:80");
        assert!(dir.resolve("unknown").is_none());
    }

    #[test]
    fn resolve_rotates_between_instances() {
        let dir = ServiceDirectory::new("/mesh");
        dir.add_static_endpoint(ServiceEndpoint::new("orders", "o-1", "a:1"));
        dir.add_static_endpoint(ServiceEndpoint::new("orders", "o-2", "b:1"));

        let first = dir.resolve("orders").unwrap().instance;
        let second = dir.resolve("orders").unwrap().instance;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn refresh_loads_announced_endpoints_and_apps() {
        let store = Arc::new(MemoryStore::new());
        announce(
            &store,
            &ServiceEndpoint::new("backend", "b-1", "10.0.0.9:80").with_apps(["stock"]),
        )
        .await;
        store.put("/mesh/services/broken/x", "not json", None).await.unwrap();

        let dir = ServiceDirectory::new("/mesh").with_store(store.clone());
        assert_eq!(dir.refresh().await.unwrap(), 1);
        assert_eq!(dir.service_for("stock"), "backend");
        assert_eq!(dir.resolve("stock").unwrap().instance, "b-1");
        assert_eq!(dir.resolve("backend").unwrap().instance, "b-1");

        store.delete("/mesh/services/backend/b-1").await.unwrap();
        dir.refresh().await.unwrap();
        assert!(dir.resolve("stock").is_none());
    }

    #[tokio::test]
    async fn static_route_wins_over_announced_route() {
        let store = Arc::new(MemoryStore::new());
        announce(
            &store,
            &ServiceEndpoint::new("backend", "b-1", "x:1").with_apps(["stock"]),
        )
        .await;
        let dir = ServiceDirectory::new("/mesh").with_store(store);
        dir.route_apps("warehouse", &["stock"]);
        dir.refresh().await.unwrap();
        assert_eq!(dir.service_for("stock"), "warehouse");
    }
}
