//! Forwards calls for apps that are not registered locally.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use meshcall_core::{CallContext, Code, ContextError, Request, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::client::{ClientFactory, RemoteClient, TransportError};
use super::directory::ServiceDirectory;
use crate::service::config::millis;
use crate::service::middleware::metrics::CallMetrics;
use crate::service::operation::CallPath;

/// Attempts and pacing for one remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Upper bound of a single attempt when the context has no deadline.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a remote call produced no peer response.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("app [{app}] not found in service directory")]
    NotFound { app: String },

    #[error("context ended before the call completed: {0}")]
    Expired(ContextError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("cannot encode param: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone)]
struct CachedClient {
    address: String,
    client: Arc<dyn RemoteClient>,
}

/// Routes calls to peers through the [`ServiceDirectory`].
///
/// Holds one long-lived client per app. The client is replaced once its
/// address is no longer announced for the app.
pub struct RemoteRouter {
    directory: Arc<ServiceDirectory>,
    factory: Arc<dyn ClientFactory>,
    clients: DashMap<String, CachedClient>,
    policy: RetryPolicy,
    instance: String,
    metrics: CallMetrics,
}

impl std::fmt::Debug for RemoteRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRouter")
            .field("policy", &self.policy)
            .field("instance", &self.instance)
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl RemoteRouter {
    #[must_use]
    pub fn new(
        directory: Arc<ServiceDirectory>,
        factory: Arc<dyn ClientFactory>,
        instance: &str,
        metrics: CallMetrics,
    ) -> Self {
        Self {
            directory,
            factory,
            clients: DashMap::new(),
            policy: RetryPolicy::default(),
            instance: instance.to_string(),
            metrics,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<ServiceDirectory> {
        &self.directory
    }

    /// Forwards `req` and converts every failure into a response.
    pub async fn call(&self, ctx: &CallContext, req: &Request) -> Response {
        let start = Instant::now();
        let rsp = match self.try_call(ctx, req).await {
            Ok(rsp) => rsp,
            Err(RemoteError::NotFound { app }) => Response::app_not_found(&app),
            Err(RemoteError::Expired(_)) => Response::timeout(req.app()),
            Err(RemoteError::Transport(e)) if e.is_timeout() => Response::timeout(req.app()),
            Err(e) => {
                warn!(
                    event = "remote",
                    app = req.app(),
                    method = req.method(),
                    error = %e,
                    "call failed"
                );
                Response::call_failed(req.app())
            }
        };
        self.metrics
            .record(CallPath::Remote, req.app(), req.method(), rsp.code(), start.elapsed());
        rsp
    }

    /// Forwards `req`, retrying transport failures only.
    ///
    /// The context is checked before every attempt and raced against every
    /// pause, so an expired or cancelled context is observed within one
    /// retry interval.
    pub async fn try_call(
        &self,
        ctx: &CallContext,
        req: &Request,
    ) -> Result<Response, RemoteError> {
        let client = self.client_for(req.app())?;
        let attempts = self.policy.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if let Some(reason) = ctx.err() {
                return Err(RemoteError::Expired(reason));
            }

            let timeout = ctx
                .remaining()
                .map_or(self.policy.request_timeout, |left| left.min(self.policy.request_timeout));
            let metadata = ctx.outbound_metadata(&self.instance);

            match client.call(req, &metadata, timeout).await {
                Ok(rsp) => return Ok(rsp),
                Err(e) => {
                    debug!(
                        event = "remote",
                        app = req.app(),
                        method = req.method(),
                        attempt,
                        address = client.address(),
                        error = %e,
                        "attempt failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    reason = ctx.done() => return Err(RemoteError::Expired(reason)),
                    () = tokio::time::sleep(self.policy.interval) => {}
                }
            }
        }

        match last_error {
            Some(e) => Err(e.into()),
            None => Err(RemoteError::NotFound {
                app: req.app().to_string(),
            }),
        }
    }

    /// Typed call: encodes `param`, returns the response code and the
    /// decoded result when the data matches `R`.
    pub async fn rpc<T, R>(
        &self,
        ctx: &CallContext,
        app: &str,
        method: &str,
        param: &T,
    ) -> Result<(Code, Option<R>), RemoteError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let req = Request::encode(app, method, param)?;
        let rsp = self.call(ctx, &req).await;
        Ok((rsp.code(), rsp.decode::<R>().ok()))
    }

    /// Drops the cached client of `app`.
    pub fn evict(&self, app: &str) -> bool {
        self.clients.remove(app).is_some()
    }

    fn client_for(&self, app: &str) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        if let Some(cached) = self.clients.get(app) {
            if self.directory.serves(app, &cached.address) {
                return Ok(cached.client.clone());
            }
        }

        let endpoint = self.directory.resolve(app).ok_or_else(|| RemoteError::NotFound {
            app: app.to_string(),
        })?;

        // The entry lock makes concurrent first use create a single client.
        match self.clients.entry(app.to_string()) {
            Entry::Occupied(mut slot) => {
                if !self.directory.serves(app, &slot.get().address) {
                    let client = self.factory.connect(&endpoint)?;
                    debug!(event = "remote", app, address = %endpoint.address, "client replaced");
                    slot.insert(CachedClient {
                        address: endpoint.address,
                        client,
                    });
                }
                Ok(slot.get().client.clone())
            }
            Entry::Vacant(slot) => {
                let client = self.factory.connect(&endpoint)?;
                debug!(event = "remote", app, address = %endpoint.address, "client created");
                let cached = slot.insert(CachedClient {
                    address: endpoint.address,
                    client,
                });
                Ok(cached.client.clone())
            }
        }
    }

    #[cfg(test)]
    fn cached_clients(&self) -> usize {
        self.clients.len()
    }
}
