//! Seams between the dispatch core and its collaborators: the parameter
//! contract handlers declare, and the coordination store used for service
//! discovery and distributed locking.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::validate::ValidationErrors;

// ---------------------------------------------------------------------------
// Handler parameters
// ---------------------------------------------------------------------------

/// Shape of a handler's parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    /// A plain data record; field validation runs after decoding.
    Record,
    /// A generic string-keyed map; decoded as-is without validation.
    Map,
}

impl ParamShape {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Map => "map",
        }
    }
}

/// Implemented by every type a registered method accepts as its parameter.
///
/// Records override [`CallParam::validate`] to declare field constraints:
///
/// ```
/// use meshcall_core::traits::CallParam;
/// use meshcall_core::validate::{ValidationErrors, Validator};
///
/// #[derive(serde::Deserialize)]
/// struct Transfer {
///     account: String,
///     amount: i64,
/// }
///
/// impl CallParam for Transfer {
///     fn validate(&self) -> Result<(), ValidationErrors> {
///         Validator::new()
///             .required("account", &self.account)
///             .range("amount", self.amount, 1, 1_000_000)
///             .finish()
///     }
/// }
/// ```
pub trait CallParam: DeserializeOwned + Send + 'static {
    const SHAPE: ParamShape = ParamShape::Record;

    /// Checks declarative field constraints. Only called for records.
    ///
    /// # Errors
    ///
    /// Returns the violated constraints.
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

impl<V: DeserializeOwned + Send + 'static> CallParam for HashMap<String, V> {
    const SHAPE: ParamShape = ParamShape::Map;
}

impl<V: DeserializeOwned + Send + 'static> CallParam for BTreeMap<String, V> {
    const SHAPE: ParamShape = ParamShape::Map;
}

impl CallParam for serde_json::Map<String, serde_json::Value> {
    const SHAPE: ParamShape = ParamShape::Map;
}

/// Parameter or result of a method that takes or returns nothing.
///
/// Serialises as `{}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

impl CallParam for Empty {}

// ---------------------------------------------------------------------------
// Coordination store
// ---------------------------------------------------------------------------

/// Identifier of a time-bounded lease granted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A stored entry with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Store revision at which the key was created.
    pub create_revision: i64,
    /// Store revision of the last modification.
    pub mod_revision: i64,
    /// Lease the key is attached to, if any.
    pub lease: Option<LeaseId>,
}

/// Errors returned by coordination store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lease {0} not found or expired")]
    LeaseNotFound(LeaseId),
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("coordination store request failed: {0}")]
    Request(String),
    #[error("malformed coordination store response: {0}")]
    Decode(String),
}

/// Key/value store with leases and compare-and-set writes.
///
/// Keys attached to a lease disappear when the lease is revoked or expires.
/// Used by the service directory, the announcer and the distributed mutex.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Every key starting with `prefix`, sorted by key.
    async fn scan(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// Unconditional write; returns the new store revision.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<i64, StoreError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Writes only if the key does not exist (create revision is zero).
    /// Returns whether the write happened.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError>;

    /// Deletes only if the key currently holds `expected`.
    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Refreshes the lease to its full TTL.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Revokes the lease and deletes every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: CoordinationStore + ?Sized> CoordinationStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        (**self).get(key).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        (**self).scan(prefix).await
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<i64, StoreError> {
        (**self).put(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError> {
        (**self).create_if_absent(key, value, lease).await
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).delete_if_value(key, expected).await
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        (**self).grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError> {
        (**self).keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        (**self).revoke_lease(lease).await
    }
}
