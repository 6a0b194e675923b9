//! Administrative redirects evaluated before local or remote resolution.
//!
//! Unlike method registries, the proxy table may change while serving:
//! readers load the current snapshot without locking and writers publish a
//! new one.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use meshcall_core::{CallContext, Request, Response};
use serde::Deserialize;
use tracing::info;

/// Custom proxy target.
#[async_trait]
pub trait ProxyHandler: Send + Sync {
    async fn call(&self, ctx: CallContext, req: Request) -> Response;
}

/// Where an intercepted call goes.
#[derive(Clone)]
pub enum ProxyTarget {
    /// Re-dispatch to another app (and optionally another method) through
    /// normal local or remote resolution.
    Redirect { app: String, method: Option<String> },
    /// Hand the call to a custom handler.
    Handler(Arc<dyn ProxyHandler>),
}

impl std::fmt::Debug for ProxyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redirect { app, method } => f
                .debug_struct("Redirect")
                .field("app", app)
                .field("method", method)
                .finish(),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// Redirect rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyRule {
    pub app: String,
    /// Intercept only this method; the whole app when absent.
    #[serde(default)]
    pub method: Option<String>,
    pub to_app: String,
    /// Target method; the original method when absent.
    #[serde(default)]
    pub to_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProxyKey {
    app: String,
    method: Option<String>,
}

impl ProxyKey {
    fn new(app: &str, method: Option<&str>) -> Self {
        Self {
            app: app.to_string(),
            method: method.map(str::to_string),
        }
    }
}

/// Lock-free table of proxy overrides keyed by app and optional method.
#[derive(Debug, Default)]
pub struct ProxyTable {
    entries: ArcSwap<HashMap<ProxyKey, ProxyTarget>>,
}

impl ProxyTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from configured redirect rules.
    #[must_use]
    pub fn from_rules(rules: &[ProxyRule]) -> Self {
        let table = Self::new();
        for rule in rules {
            table.install(
                &rule.app,
                rule.method.as_deref(),
                ProxyTarget::Redirect {
                    app: rule.to_app.clone(),
                    method: rule.to_method.clone(),
                },
            );
        }
        table
    }

    /// Installs or replaces an override. `method = None` intercepts the
    /// whole app.
    pub fn install(&self, app: &str, method: Option<&str>, target: ProxyTarget) {
        let key = ProxyKey::new(app, method);
        info!(event = "proxy", app, method = method.unwrap_or("*"), target = ?target, "install");
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key.clone(), target.clone());
            next
        });
    }

    /// Removes an override. Returns whether one existed.
    pub fn remove(&self, app: &str, method: Option<&str>) -> bool {
        let key = ProxyKey::new(app, method);
        if !self.entries.load().contains_key(&key) {
            return false;
        }
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&key);
            next
        });
        info!(event = "proxy", app, method = method.unwrap_or("*"), "remove");
        true
    }

    /// Finds the override for a request; method-level entries win over
    /// app-level ones.
    #[must_use]
    pub fn resolve(&self, req: &Request) -> Option<ProxyTarget> {
        let entries = self.entries.load();
        if entries.is_empty() {
            return None;
        }
        entries
            .get(&ProxyKey::new(req.app(), Some(req.method())))
            .or_else(|| entries.get(&ProxyKey::new(req.app(), None)))
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}
