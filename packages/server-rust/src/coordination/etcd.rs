//! etcd v3 store over the JSON gRPC gateway.
//!
//! Keys and values travel base64-encoded; 64-bit integers come back as JSON
//! strings. Only the calls the directory, announcer and mutex need are
//! implemented.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use meshcall_core::{CoordinationStore, KeyValue, LeaseId, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use tracing::debug;

/// Default timeout of one gateway request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordination store backed by an etcd cluster.
#[derive(Debug, Clone)]
pub struct EtcdStore {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl EtcdStore {
    /// `endpoint` is the gateway base URL, e.g. `http://127.0.0.1:2379`.
    #[must_use]
    pub fn new(http: reqwest::Client, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, StoreError> {
        let url = format!("{}{path}", self.endpoint);
        let reply = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{url}: {e}")))?;

        let status = reply.status();
        let text = reply
            .text()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{url}: {e}")))?;
        if !status.is_success() {
            let error = serde_json::from_str::<GatewayError>(&text).unwrap_or_default();
            debug!(
                event = "etcd",
                path,
                status = status.as_u16(),
                error = %error.message,
                "request rejected"
            );
            return Err(StoreError::Request(format!(
                "{path}: http {}: {}",
                status.as_u16(),
                if error.message.is_empty() { text.as_str() } else { error.message.as_str() }
            )));
        }
        serde_json::from_str(&text).map_err(|e| StoreError::Decode(format!("{path}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Gateway wire types
// ---------------------------------------------------------------------------

fn encode(raw: &str) -> String {
    STANDARD.encode(raw.as_bytes())
}

fn decode(field: &str, encoded: &str) -> Result<String, StoreError> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::Decode(format!("{field}: {e}")))?;
    String::from_utf8(raw).map_err(|e| StoreError::Decode(format!("{field}: {e}")))
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff (or empty): range to the end of the keyspace.
    vec![0]
}

fn de_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int {
        Num(i64),
        Str(String),
    }
    match Int::deserialize(d)? {
        Int::Num(n) => Ok(n),
        Int::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize)]
struct GatewayError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct Header {
    #[serde(default, deserialize_with = "de_i64")]
    revision: i64,
}

#[derive(Debug, Deserialize)]
struct RawKeyValue {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "de_i64")]
    create_revision: i64,
    #[serde(default, deserialize_with = "de_i64")]
    mod_revision: i64,
    #[serde(default, deserialize_with = "de_i64")]
    lease: i64,
}

impl RawKeyValue {
    fn into_kv(self) -> Result<KeyValue, StoreError> {
        Ok(KeyValue {
            key: decode("key", &self.key)?,
            value: decode("value", &self.value)?,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            lease: (self.lease != 0).then_some(LeaseId(self.lease)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RangeReply {
    #[serde(default)]
    kvs: Vec<RawKeyValue>,
}

#[derive(Debug, Deserialize)]
struct PutReply {
    #[serde(default)]
    header: Header,
}

#[derive(Debug, Deserialize)]
struct DeleteReply {
    #[serde(default, deserialize_with = "de_i64")]
    deleted: i64,
}

#[derive(Debug, Deserialize)]
struct TxnReply {
    #[serde(default)]
    succeeded: bool,
}

#[derive(Debug, Deserialize)]
struct GrantReply {
    #[serde(rename = "ID", deserialize_with = "de_i64")]
    id: i64,
}

#[derive(Debug, Deserialize)]
struct KeepAliveReply {
    #[serde(default)]
    result: Option<KeepAliveResult>,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Debug, Serialize)]
struct PutRequest<'a> {
    key: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// CoordinationStore
// ---------------------------------------------------------------------------

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let reply: RangeReply = self.post("/v3/kv/range", json!({ "key": encode(key) })).await?;
        reply.kvs.into_iter().next().map(RawKeyValue::into_kv).transpose()
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let body = json!({
            "key": encode(prefix),
            "range_end": STANDARD.encode(prefix_end(prefix)),
            "sort_order": "ASCEND",
            "sort_target": "KEY",
        });
        let reply: RangeReply = self.post("/v3/kv/range", body).await?;
        reply.kvs.into_iter().map(RawKeyValue::into_kv).collect()
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<i64, StoreError> {
        let lease = lease.map(|l| l.0.to_string());
        let body = PutRequest {
            key: encode(key),
            value: encode(value),
            lease: lease.as_deref(),
        };
        let body = serde_json::to_value(body).map_err(|e| StoreError::Request(e.to_string()))?;
        let reply: PutReply = self.post("/v3/kv/put", body).await?;
        Ok(reply.header.revision)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let reply: DeleteReply = self
            .post("/v3/kv/deleterange", json!({ "key": encode(key) }))
            .await?;
        Ok(reply.deleted > 0)
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError> {
        let mut put = json!({ "key": encode(key), "value": encode(value) });
        if let Some(lease) = lease {
            put["lease"] = json!(lease.0.to_string());
        }
        let body = json!({
            "compare": [{
                "key": encode(key),
                "result": "EQUAL",
                "target": "CREATE",
                "create_revision": "0",
            }],
            "success": [{ "request_put": put }],
        });
        let reply: TxnReply = self.post("/v3/kv/txn", body).await?;
        Ok(reply.succeeded)
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let body = json!({
            "compare": [{
                "key": encode(key),
                "result": "EQUAL",
                "target": "VALUE",
                "value": encode(expected),
            }],
            "success": [{ "request_delete_range": { "key": encode(key) } }],
        });
        let reply: TxnReply = self.post("/v3/kv/txn", body).await?;
        Ok(reply.succeeded)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let secs = ttl.as_secs().max(1);
        let reply: GrantReply = self
            .post("/v3/lease/grant", json!({ "TTL": secs.to_string() }))
            .await?;
        Ok(LeaseId(reply.id))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError> {
        let reply: KeepAliveReply = self
            .post("/v3/lease/keepalive", json!({ "ID": lease.0.to_string() }))
            .await?;
        // An expired lease answers with TTL 0 (or no TTL at all).
        match reply.result {
            Some(result) if result.ttl > 0 => Ok(()),
            _ => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        match self
            .post::<serde_json::Value>("/v3/lease/revoke", json!({ "ID": lease.0.to_string() }))
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::Request(msg)) if msg.contains("lease not found") => Ok(()),
            Err(e) => Err(e),
        }
    }
}
