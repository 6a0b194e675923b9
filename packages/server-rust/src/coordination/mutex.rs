//! Lease-backed distributed mutex.
//!
//! The holder writes its owner id under the lock key with a lease attached.
//! A renewal task keeps the lease alive every `ttl / 2` and releases the lock
//! when the owning context ends, so a crashed or cancelled holder never
//! leaves the key behind for longer than one TTL.

use std::sync::Arc;
use std::time::Duration;

use meshcall_core::{CallContext, ContextError, CoordinationStore, LeaseId, StoreError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::service::config::secs;

/// Lock acquisition and lease settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Lease TTL; renewed every half TTL while held.
    #[serde(with = "secs")]
    pub ttl: Duration,
    /// Give up acquiring after this long, even if the context is still live.
    #[serde(with = "secs")]
    pub lock_timeout: Duration,
    /// Base pause between acquisition attempts; jittered by up to 50%.
    #[serde(skip)]
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {key} abandoned: {reason}")]
    Cancelled { key: String, reason: ContextError },

    #[error("lock {key} not acquired within {waited:?}")]
    Timeout { key: String, waited: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Held {
    lease: LeaseId,
    scope: CallContext,
    renewal: JoinHandle<Result<(), StoreError>>,
}

/// Mutual exclusion across instances sharing a coordination store.
pub struct DistributedMutex {
    store: Arc<dyn CoordinationStore>,
    key: String,
    owner: String,
    options: LockOptions,
    held: Option<Held>,
}

impl std::fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("held", &self.held.is_some())
            .finish_non_exhaustive()
    }
}

impl DistributedMutex {
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, key: &str, options: LockOptions) -> Self {
        Self {
            store,
            key: key.to_string(),
            owner: uuid::Uuid::new_v4().to_string(),
            options,
            held: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this handle believes it holds the lock and its renewal task
    /// is still running.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.as_ref().is_some_and(|h| !h.renewal.is_finished())
    }

    /// Acquires the lock, waiting until it is free, the context ends, or
    /// `lock_timeout` elapses. Locking an already held mutex is a no-op.
    pub async fn lock(&mut self, ctx: &CallContext) -> Result<(), LockError> {
        if self.is_held() {
            return Ok(());
        }
        self.held = None;

        if let Some(reason) = ctx.err() {
            return Err(self.cancelled(reason));
        }

        let mut lease = self.store.grant_lease(self.options.ttl).await?;
        let started = Instant::now();
        let mut give_up = started + self.options.lock_timeout;
        if let Some(remaining) = ctx.remaining() {
            give_up = give_up.min(Instant::now() + remaining);
        }
        // The wait may outlast the TTL, so the lease is refreshed while
        // waiting too.
        let refresh_every = (self.options.ttl / 2).max(Duration::from_millis(10));
        let mut refresh_at = started + refresh_every;

        loop {
            match self.store.create_if_absent(&self.key, &self.owner, Some(lease)).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(StoreError::LeaseNotFound(_)) => {
                    debug!(
                        event = "mutex",
                        key = %self.key,
                        lease = %lease,
                        "lease expired while waiting"
                    );
                    lease = self.store.grant_lease(self.options.ttl).await?;
                    refresh_at = Instant::now() + refresh_every;
                }
                Err(e) => {
                    self.release_lease(lease).await;
                    return Err(e.into());
                }
            }

            let now = Instant::now();
            if now >= give_up {
                self.release_lease(lease).await;
                return Err(match ctx.err() {
                    Some(reason) => self.cancelled(reason),
                    None => LockError::Timeout {
                        key: self.key.clone(),
                        waited: started.elapsed(),
                    },
                });
            }

            if now >= refresh_at {
                lease = match self.refresh_lease(lease).await {
                    Ok(lease) => lease,
                    Err(e) => {
                        self.release_lease(lease).await;
                        return Err(e.into());
                    }
                };
                refresh_at = now + refresh_every;
            }

            let pause = jittered(self.options.retry_interval).min(give_up - now);
            tokio::select! {
                reason = ctx.done() => {
                    self.release_lease(lease).await;
                    return Err(self.cancelled(reason));
                }
                () = tokio::time::sleep(pause) => {}
            }
        }

        let scope = ctx.child();
        let renewal = tokio::spawn(renew(
            self.store.clone(),
            scope.clone(),
            self.key.clone(),
            lease,
            self.options.ttl / 2,
        ));
        info!(event = "mutex", key = %self.key, lease = %lease, "acquired");
        self.held = Some(Held {
            lease,
            scope,
            renewal,
        });
        Ok(())
    }

    /// Releases the lock and stops renewal. Safe to call when the lock was
    /// never acquired or is already released.
    pub async fn unlock(&mut self) -> Result<(), LockError> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        held.scope.cancel();
        let outcome = match held.renewal.await {
            Ok(result) => result,
            Err(e) => {
                warn!(event = "mutex", key = %self.key, error = %e, "renewal task failed");
                self.store.revoke_lease(held.lease).await
            }
        };
        debug!(event = "mutex", key = %self.key, "released");
        outcome.map_err(LockError::from)
    }

    fn cancelled(&self, reason: ContextError) -> LockError {
        LockError::Cancelled {
            key: self.key.clone(),
            reason,
        }
    }

    /// Keeps a waiting lease alive, granting a fresh one if it already
    /// expired.
    async fn refresh_lease(&self, lease: LeaseId) -> Result<LeaseId, StoreError> {
        match self.store.keep_alive(lease).await {
            Ok(()) => Ok(lease),
            Err(StoreError::LeaseNotFound(_)) => {
                debug!(
                    event = "mutex",
                    key = %self.key,
                    lease = %lease,
                    "re-granting expired lease"
                );
                self.store.grant_lease(self.options.ttl).await
            }
            Err(e) => Err(e),
        }
    }

    async fn release_lease(&self, lease: LeaseId) {
        if let Err(e) = self.store.revoke_lease(lease).await {
            warn!(
                event = "mutex",
                key = %self.key,
                lease = %lease,
                error = %e,
                "lease revoke failed"
            );
        }
    }
}

impl Drop for DistributedMutex {
    fn drop(&mut self) {
        // The renewal task releases the lease once its scope ends.
        if let Some(held) = self.held.take() {
            held.scope.cancel();
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX).max(1);
    let extra = rand::rng().random_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + extra)
}

/// Keeps the lease alive until `scope` ends, then revokes it.
async fn renew(
    store: Arc<dyn CoordinationStore>,
    scope: CallContext,
    key: String,
    lease: LeaseId,
    period: Duration,
) -> Result<(), StoreError> {
    let period = period.max(Duration::from_millis(10));
    loop {
        tokio::select! {
            reason = scope.done() => {
                debug!(
                    event = "mutex",
                    key = %key,
                    lease = %lease,
                    ?reason,
                    "scope ended, releasing"
                );
                return store.revoke_lease(lease).await;
            }
            () = tokio::time::sleep(period) => {
                match store.keep_alive(lease).await {
                    Ok(()) => {}
                    Err(StoreError::LeaseNotFound(_)) => {
                        warn!(event = "mutex", key = %key, lease = %lease, "lease lost while held");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(
                            event = "mutex",
                            key = %key,
                            lease = %lease,
                            error = %e,
                            "keep-alive failed"
                        );
                    }
                }
            }
        }
    }
}
