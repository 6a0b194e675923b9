//! Process configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config. The
//! binary loads an optional file and then applies command-line overrides.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::executor::{InstrumentMode, DEFAULT_SLOW_THRESHOLD};
use super::proxy::ProxyRule;
use crate::coordination::{JobConfig, LockOptions};
use crate::network::NetworkConfig;
use crate::remote::{RetryPolicy, ServiceEndpoint};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Durations written as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Durations written as integer seconds.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Call pipeline limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Deadline applied to calls that arrive without one.
    #[serde(with = "millis")]
    pub default_call_timeout: Duration,
    /// Calls beyond this many in flight are shed.
    pub max_concurrent_calls: u32,
    #[serde(with = "millis")]
    pub slow_threshold: Duration,
    /// Apps removed at startup in release mode.
    pub release_forbidden_apps: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_call_timeout: Duration::from_secs(30),
            max_concurrent_calls: 1000,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            release_forbidden_apps: vec!["debug".to_string()],
        }
    }
}

/// Peer routing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub retry: RetryPolicy,
    #[serde(with = "millis")]
    pub refresh_interval: Duration,
    /// service -> apps it serves.
    pub routes: BTreeMap<String, Vec<String>>,
    /// Endpoints known without discovery.
    pub endpoints: Vec<ServiceEndpoint>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry: RetryPolicy::default(),
            refresh_interval: Duration::from_secs(5),
            routes: BTreeMap::new(),
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Etcd,
}

/// Coordination store and announcement.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub backend: StoreBackend,
    pub etcd_endpoint: String,
    /// Root of every key this process writes.
    pub prefix: String,
    #[serde(with = "secs")]
    pub lease_ttl: Duration,
    #[serde(with = "secs")]
    pub announce_interval: Duration,
    /// Address peers use to reach this instance; `{port}` is replaced by
    /// the bound port. Announcement is skipped when unset.
    pub advertise_address: Option<String>,
    pub lock: LockOptions,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            etcd_endpoint: "http://127.0.0.1:2379".to_string(),
            prefix: "/meshcall".to_string(),
            lease_ttl: Duration::from_secs(10),
            announce_interval: Duration::from_secs(3),
            advertise_address: None,
            lock: LockOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape listener; no exporter when unset.
    pub listen: Option<SocketAddr>,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Whole-process configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host label for metrics.
    pub host: String,
    /// Unique id of this process.
    pub instance: String,
    /// Service name announced to peers.
    pub service: String,
    pub mode: InstrumentMode,
    pub network: NetworkConfig,
    pub dispatch: DispatchConfig,
    pub remote: RemoteConfig,
    pub coordination: CoordinationConfig,
    pub proxies: Vec<ProxyRule>,
    pub jobs: Vec<JobConfig>,
    pub metrics: MetricsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            instance: String::new(),
            service: "meshcall".to_string(),
            mode: InstrumentMode::Dev,
            network: NetworkConfig::default(),
            dispatch: DispatchConfig::default(),
            remote: RemoteConfig::default(),
            coordination: CoordinationConfig::default(),
            proxies: Vec::new(),
            jobs: Vec::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Loads `path`, or the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fills derived defaults and rejects inconsistent settings.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        if self.instance.is_empty() {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            self.instance = format!("{}-{}", self.service, &suffix[..8]);
        }
        if self.dispatch.max_concurrent_calls == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_concurrent_calls must be positive".into(),
            ));
        }
        if self.remote.retry.attempts == 0 {
            return Err(ConfigError::Invalid("remote.retry.attempts must be positive".into()));
        }
        if self.coordination.lease_ttl < Duration::from_secs(1) {
            return Err(ConfigError::Invalid("coordination.lease_ttl must be at least 1s".into()));
        }
        if self.coordination.announce_interval >= self.coordination.lease_ttl {
            return Err(ConfigError::Invalid(
                "coordination.announce_interval must be shorter than lease_ttl".into(),
            ));
        }
        for job in &self.jobs {
            if job.name.is_empty() {
                return Err(ConfigError::Invalid("job without a name".into()));
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = ServerConfig::from_json("{}").unwrap();
        assert_eq!(config.mode, InstrumentMode::Dev);
        assert_eq!(config.dispatch.default_call_timeout, Duration::from_secs(30));
        assert_eq!(config.remote.retry.attempts, 3);
        assert_eq!(config.remote.retry.interval, Duration::from_millis(100));
        assert_eq!(config.coordination.backend, StoreBackend::Memory);
        assert_eq!(config.network.port, 0);
        assert!(config.metrics.listen.is_none());
    }

    #[test]
    fn sections_parse() {
        let config = ServerConfig::from_json(
            r#"{
                "instance": "gw-1",
                "mode": "release",
                "network": {"port": 8080, "request_timeout": 5000},
                "dispatch": {"max_concurrent_calls": 10},
                "remote": {
                    "retry": {"attempts": 5, "interval": 20},
                    "routes": {"backend": ["orders", "billing"]},
                    "endpoints": [
                        {"service": "backend", "instance": "b-1", "address": "10.0.0.1:80"}
                    ]
                },
                "coordination": {"backend": "etcd", "lease_ttl": 6, "announce_interval": 2},
                "proxies": [{"app": "legacy", "to_app": "orders"}],
                "jobs": [{"name": "cleanup", "app": "orders", "method": "purge"}],
                "metrics": {"listen": "127.0.0.1:9100"}
            }"#,
        )
        .unwrap()
        .finalize()
        .unwrap();

        assert_eq!(config.instance, "gw-1");
        assert_eq!(config.mode, InstrumentMode::Release);
        assert_eq!(config.network.port, 8080);
        assert_eq!(config.network.request_timeout, Duration::from_secs(5));
        assert_eq!(config.remote.retry.attempts, 5);
        assert_eq!(config.remote.retry.interval, Duration::from_millis(20));
        assert_eq!(config.remote.routes["backend"], vec!["orders", "billing"]);
        assert_eq!(config.coordination.backend, StoreBackend::Etcd);
        assert_eq!(config.coordination.lease_ttl, Duration::from_secs(6));
        assert_eq!(config.proxies.len(), 1);
        assert_eq!(config.jobs[0].name, "cleanup");
        assert_eq!(config.metrics.listen.unwrap().port(), 9100);
    }

    #[test]
    fn finalize_generates_instance_id() {
        let config = ServerConfig::default().finalize().unwrap();
        assert!(config.instance.starts_with("meshcall-"));
    }

    #[test]
    fn finalize_rejects_bad_settings() {
        let mut config = ServerConfig::default();
        config.remote.retry.attempts = 0;
        assert!(matches!(config.finalize(), Err(ConfigError::Invalid(_))));

        let mut config = ServerConfig::default();
        config.coordination.announce_interval = Duration::from_secs(20);
        assert!(matches!(config.finalize(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/meshcall.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshcall.json");
        std::fs::write(&path, r#"{"service": "orders"}"#).unwrap();
        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.service, "orders");
    }
}
