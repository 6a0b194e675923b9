//! Transport to peer instances.
//!
//! A [`RemoteClient`] performs one round trip of the envelope to a single
//! endpoint. It reports transport failures only: a peer that answers with a
//! non-zero business code is a successful round trip.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshcall_core::{Request, Response};

use super::directory::ServiceEndpoint;

/// Outbound metadata headers, as built by
/// [`CallContext::outbound_metadata`](meshcall_core::CallContext::outbound_metadata).
pub type Metadata = BTreeMap<&'static str, String>;

/// Path of the peer envelope route.
pub const RPC_PATH: &str = "/rpc";

/// Transport-level failure of a single attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("call to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("cannot reach {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("{endpoint} answered with http status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("malformed reply from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
}

impl TransportError {
    /// Whether this failure looks like an elapsed deadline.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// One long-lived client bound to a peer endpoint.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Address this client talks to.
    fn address(&self) -> &str;

    /// Sends the envelope and waits at most `timeout` for the reply.
    async fn call(
        &self,
        req: &Request,
        metadata: &Metadata,
        timeout: Duration,
    ) -> Result<Response, TransportError>;
}

/// Creates clients for endpoints discovered by the directory.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, endpoint: &ServiceEndpoint) -> Result<Arc<dyn RemoteClient>, TransportError>;
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// Posts the JSON envelope to `{address}/rpc`.
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    http: reqwest::Client,
    address: String,
    url: String,
}

impl HttpRemoteClient {
    #[must_use]
    pub fn new(http: reqwest::Client, address: &str) -> Self {
        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        Self {
            http,
            address: address.to_string(),
            url: format!("{base}{RPC_PATH}"),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn classify(&self, err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                endpoint: self.address.clone(),
            }
        } else if err.is_decode() {
            TransportError::Decode {
                endpoint: self.address.clone(),
                reason: err.to_string(),
            }
        } else {
            TransportError::Connect {
                endpoint: self.address.clone(),
                reason: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn call(
        &self,
        req: &Request,
        metadata: &Metadata,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let mut builder = self.http.post(&self.url).timeout(timeout).json(req);
        for (key, value) in metadata {
            builder = builder.header(*key, value.as_str());
        }

        let reply = builder.send().await.map_err(|e| self.classify(&e))?;
        let status = reply.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                endpoint: self.address.clone(),
                status: status.as_u16(),
            });
        }
        reply
            .json::<Response>()
            .await
            .map_err(|e| self.classify(&e))
    }
}

/// Builds [`HttpRemoteClient`]s sharing one connection pool.
#[derive(Debug, Clone, Default)]
pub struct HttpClientFactory {
    http: reqwest::Client,
}

impl HttpClientFactory {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ClientFactory for HttpClientFactory {
    fn connect(&self, endpoint: &ServiceEndpoint) -> Result<Arc<dyn RemoteClient>, TransportError> {
        if endpoint.address.is_empty() {
            return Err(TransportError::Connect {
                endpoint: endpoint.service.clone(),
                reason: "empty address".to_string(),
            });
        }
        Ok(Arc::new(HttpRemoteClient::new(self.http.clone(), &endpoint.address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address_gets_http_scheme() {
        let client = HttpRemoteClient::new(reqwest::Client::new(), "10.0.0.5:8080");
        assert_eq!(client.url(), "http://10.0.0.5:8080/rpc");
        assert_eq!(client.address(), "10.0.0.5:8080");

        let client = HttpRemoteClient::new(reqwest::Client::new(), "https://orders.internal/");
        assert_eq!(client.url(), "https://orders.internal/rpc");
    }

    #[test]
    fn factory_rejects_empty_address() {
        let factory = HttpClientFactory::default();
        let endpoint = ServiceEndpoint::new("orders", "i-1", "");
        assert!(matches!(
            factory.connect(&endpoint),
            Err(TransportError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_transport_error() {
        // Port 9 on localhost is the discard service and is normally closed.
        let client = HttpRemoteClient::new(reqwest::Client::new(), "127.0.0.1:9");
        let err = client
            .call(
                &Request::new("x", "ping", "{}"),
                &Metadata::new(),
                Duration::from_millis(500),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect { .. } | TransportError::Timeout { .. }
        ));
    }
}
