//! In-process coordination store.
//!
//! Used in dev mode and tests. Leases expire on the tokio clock, so tests can
//! drive expiry with `tokio::time::pause`/`advance`. Expired leases are
//! purged lazily at the start of every operation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use meshcall_core::{CoordinationStore, KeyValue, LeaseId, StoreError};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    create_revision: i64,
    mod_revision: i64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    expires_at: Instant,
    keys: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    revision: i64,
    next_lease: i64,
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
}

impl State {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(event = "memory-store", lease = %id, "lease expired");
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let mut removed = false;
        for key in lease.keys {
            if self.entries.get(&key).is_some_and(|e| e.lease == Some(id)) {
                self.entries.remove(&key);
                removed = true;
            }
        }
        if removed {
            self.revision += 1;
        }
        true
    }

    fn write(&mut self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<i64, StoreError> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }
        self.revision += 1;
        let revision = self.revision;

        let previous_lease = self.entries.get(key).and_then(|e| e.lease);
        if let Some(old) = previous_lease.filter(|old| Some(*old) != lease) {
            if let Some(l) = self.leases.get_mut(&old) {
                l.keys.remove(key);
            }
        }
        if let Some(id) = lease {
            if let Some(l) = self.leases.get_mut(&id) {
                l.keys.insert(key.to_string());
            }
        }

        let create_revision = self.entries.get(key).map_or(revision, |e| e.create_revision);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                create_revision,
                mod_revision: revision,
                lease,
            },
        );
        Ok(revision)
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                if let Some(l) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
                    l.keys.remove(key);
                }
                self.revision += 1;
                true
            }
            None => false,
        }
    }
}

fn to_kv(key: &str, entry: &Entry) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: entry.value.clone(),
        create_revision: entry.create_revision,
        mod_revision: entry.mod_revision,
        lease: entry.lease,
    }
}

/// Coordination store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        f(&mut state)
    }

    /// Number of live leases.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.with_state(|s| s.leases.len())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        Ok(self.with_state(|s| s.entries.get(key).map(|e| to_kv(key, e))))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        Ok(self.with_state(|s| {
            s.entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, e)| to_kv(k, e))
                .collect()
        }))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<i64, StoreError> {
        self.with_state(|s| s.write(key, value, lease))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.with_state(|s| s.remove(key)))
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError> {
        self.with_state(|s| {
            if s.entries.contains_key(key) {
                return Ok(false);
            }
            s.write(key, value, lease).map(|_| true)
        })
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        Ok(self.with_state(|s| {
            if s.entries.get(key).is_some_and(|e| e.value == expected) {
                s.remove(key)
            } else {
                false
            }
        }))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        Ok(self.with_state(|s| {
            s.next_lease += 1;
            let id = LeaseId(s.next_lease);
            s.leases.insert(
                id,
                Lease {
                    ttl,
                    expires_at: Instant::now() + ttl,
                    keys: BTreeSet::new(),
                },
            );
            id
        }))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.with_state(|s| match s.leases.get_mut(&lease) {
            Some(l) => {
                l.expires_at = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(StoreError::LeaseNotFound(lease)),
        })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        // Revoking an unknown lease is a no-op.
        self.with_state(|s| s.drop_lease(lease));
        Ok(())
    }
}
