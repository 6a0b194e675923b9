//! Top-level call resolution: proxy, then local, then remote.
//!
//! [`DispatcherBuilder`] collects per-app registries during startup;
//! [`DispatcherBuilder::build`] seals them and yields an immutable
//! [`Dispatcher`] that is shared by reference with the gateway and with
//! background jobs.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use meshcall_core::{CallContext, Request, Response};
use tower::Service;
use tracing::{debug, error, info, warn};

use super::builtin::{Sys, SYS_APP};
use super::executor::{panic_message, CallExecutor, InstrumentMode, DEFAULT_SLOW_THRESHOLD};
use super::middleware::metrics::CallMetrics;
use super::operation::{Call, CallFuture, CallPath};
use super::proxy::{ProxyTable, ProxyTarget};
use super::registry::{Capability, MethodRegistry, RegistryError};
use crate::remote::RemoteRouter;

fn valid_app_name(app: &str) -> bool {
    !app.is_empty()
        && app
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

// ---------------------------------------------------------------------------
// DispatcherBuilder
// ---------------------------------------------------------------------------

/// Startup-time assembly of a [`Dispatcher`].
pub struct DispatcherBuilder {
    mode: InstrumentMode,
    registries: BTreeMap<String, MethodRegistry>,
    proxies: Arc<ProxyTable>,
    remote: Option<Arc<RemoteRouter>>,
    metrics: CallMetrics,
    slow_threshold: Duration,
    builtin: bool,
}

impl DispatcherBuilder {
    #[must_use]
    pub fn new(mode: InstrumentMode) -> Self {
        Self {
            mode,
            registries: BTreeMap::new(),
            proxies: Arc::new(ProxyTable::new()),
            remote: None,
            metrics: CallMetrics::new("localhost", "local"),
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            builtin: false,
        }
    }

    /// The registry of `app`, created on first use.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::InvalidApp`] for an empty name or one
    /// with characters other than ASCII alphanumerics, `_`, `-` and `.`.
    pub fn registry(&mut self, app: &str) -> Result<&mut MethodRegistry, RegistryError> {
        if !valid_app_name(app) {
            return Err(RegistryError::InvalidApp { app: app.to_string() });
        }
        Ok(self
            .registries
            .entry(app.to_string())
            .or_insert_with(|| MethodRegistry::new(app)))
    }

    /// See [`MethodRegistry::add`].
    pub fn add<C: Capability>(
        &mut self,
        app: &str,
        capability: C,
    ) -> Result<&mut Self, RegistryError> {
        self.registry(app)?.add(capability)?;
        Ok(self)
    }

    /// See [`MethodRegistry::override_with`].
    pub fn override_with<C: Capability>(
        &mut self,
        app: &str,
        capability: C,
    ) -> Result<&mut Self, RegistryError> {
        self.registry(app)?.override_with(capability)?;
        Ok(self)
    }

    /// See [`MethodRegistry::impact`].
    pub fn impact<C: Capability>(
        &mut self,
        app: &str,
        capability: C,
        methods: &[&str],
    ) -> Result<&mut Self, RegistryError> {
        self.registry(app)?.impact(capability, methods)?;
        Ok(self)
    }

    /// See [`MethodRegistry::forbid`]. Unknown apps are ignored.
    pub fn forbid(&mut self, app: &str, methods: &[&str]) -> Result<&mut Self, RegistryError> {
        if let Some(registry) = self.registries.get_mut(app) {
            registry.forbid(methods)?;
        }
        Ok(self)
    }

    /// See [`MethodRegistry::set_verbose`]. Unknown apps are ignored.
    pub fn set_verbose(&mut self, app: &str, methods: &[&str]) -> Result<&mut Self, RegistryError> {
        if let Some(registry) = self.registries.get_mut(app) {
            registry.set_verbose(methods)?;
        }
        Ok(self)
    }

    /// See [`MethodRegistry::ignore_log`]. Unknown apps are ignored.
    pub fn ignore_log(&mut self, app: &str, methods: &[&str]) -> Result<&mut Self, RegistryError> {
        if let Some(registry) = self.registries.get_mut(app) {
            registry.ignore_log(methods)?;
        }
        Ok(self)
    }

    /// Removes whole apps, e.g. debug apps in release mode.
    pub fn forbid_app(&mut self, apps: &[&str]) -> &mut Self {
        for app in apps {
            if self.registries.remove(*app).is_some() {
                info!(event = "registry", app, "forbid app");
            }
        }
        self
    }

    pub fn with_proxies(&mut self, proxies: Arc<ProxyTable>) -> &mut Self {
        self.proxies = proxies;
        self
    }

    pub fn with_remote(&mut self, remote: Arc<RemoteRouter>) -> &mut Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_metrics(&mut self, metrics: CallMetrics) -> &mut Self {
        self.metrics = metrics;
        self
    }

    pub fn with_slow_threshold(&mut self, threshold: Duration) -> &mut Self {
        self.slow_threshold = threshold;
        self
    }

    /// Serves the built-in `sys` app (`heartbeat`, `methods`).
    pub fn with_builtin(&mut self) -> &mut Self {
        self.builtin = true;
        self
    }

    /// Seals every registry and produces the dispatcher.
    #[must_use]
    pub fn build(mut self) -> Dispatcher {
        let listing = Arc::new(OnceLock::new());
        if self.builtin {
            let sys = Sys::new(listing.clone());
            if let Err(e) = self.add(SYS_APP, sys) {
                warn!(event = "registry", error = %e, "built-in app not registered");
            }
        }

        let mut registries = HashMap::with_capacity(self.registries.len());
        let mut methods = BTreeMap::new();
        for (app, mut registry) in self.registries {
            registry.seal();
            methods.insert(app.clone(), registry.methods());
            registries.insert(app, registry);
        }
        let _ = listing.set(methods);

        Dispatcher {
            registries,
            executor: CallExecutor::new(self.mode, self.metrics.clone())
                .with_slow_threshold(self.slow_threshold),
            proxies: self.proxies,
            remote: self.remote,
            metrics: self.metrics,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Resolves and executes calls. Immutable once built.
pub struct Dispatcher {
    registries: HashMap<String, MethodRegistry>,
    executor: CallExecutor,
    proxies: Arc<ProxyTable>,
    remote: Option<Arc<RemoteRouter>>,
    metrics: CallMetrics,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("apps", &self.apps())
            .field("mode", &self.executor.mode())
            .field("proxies", &self.proxies.len())
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

impl Dispatcher {
    /// Executes one call. Never fails: every outcome is a [`Response`].
    pub async fn call(&self, mut ctx: CallContext, req: Request) -> Response {
        ctx.app = req.app().to_string();
        ctx.method = req.method().to_string();
        if ctx.trace_id.is_empty() {
            ctx.trace_id = uuid::Uuid::new_v4().simple().to_string();
        }

        match self.proxies.resolve(&req) {
            Some(target) => self.call_proxy(ctx, req, target).await,
            None => self.resolve(&ctx, &req).await,
        }
    }

    async fn resolve(&self, ctx: &CallContext, req: &Request) -> Response {
        if let Some(registry) = self.registries.get(req.app()) {
            return self
                .executor
                .execute(ctx, registry.lookup(req.method()), req)
                .await;
        }
        match &self.remote {
            Some(remote) => remote.call(ctx, req).await,
            None => Response::app_not_implemented(req.app()),
        }
    }

    async fn call_proxy(
        &self,
        mut ctx: CallContext,
        req: Request,
        target: ProxyTarget,
    ) -> Response {
        match target {
            ProxyTarget::Redirect { app, method } => {
                let method = method.unwrap_or_else(|| req.method().to_string());
                debug!(
                    event = "proxy",
                    from_app = req.app(),
                    from_method = req.method(),
                    to_app = %app,
                    to_method = %method,
                    "redirect"
                );
                let redirected = req.redirect(app, method);
                ctx.app = redirected.app().to_string();
                ctx.method = redirected.method().to_string();
                self.resolve(&ctx, &redirected).await
            }
            ProxyTarget::Handler(handler) => {
                let start = Instant::now();
                let rsp = match AssertUnwindSafe(handler.call(ctx, req.clone()))
                    .catch_unwind()
                    .await
                {
                    Ok(rsp) => rsp,
                    Err(payload) => {
                        error!(
                            event = "panic occur @ proxy",
                            processor = req.method(),
                            app = req.app(),
                            error = %panic_message(payload.as_ref()),
                        );
                        Response::call_failed(req.method())
                    }
                };
                self.metrics
                    .record(CallPath::Proxy, req.app(), req.method(), rsp.code(), start.elapsed());
                rsp
            }
        }
    }

    /// Registry of a local app.
    #[must_use]
    pub fn registry(&self, app: &str) -> Option<&MethodRegistry> {
        self.registries.get(app)
    }

    /// Local app names, sorted.
    #[must_use]
    pub fn apps(&self) -> Vec<String> {
        let mut apps: Vec<String> = self.registries.keys().cloned().collect();
        apps.sort();
        apps
    }

    /// App -> sorted method names.
    #[must_use]
    pub fn methods(&self) -> BTreeMap<String, Vec<String>> {
        self.registries
            .iter()
            .map(|(app, registry)| (app.clone(), registry.methods()))
            .collect()
    }

    #[must_use]
    pub fn proxies(&self) -> &Arc<ProxyTable> {
        &self.proxies
    }

    #[must_use]
    pub fn remote(&self) -> Option<&Arc<RemoteRouter>> {
        self.remote.as_ref()
    }

    #[must_use]
    pub fn mode(&self) -> InstrumentMode {
        self.executor.mode()
    }

    /// Logs the imported and overridden methods of every app.
    pub fn log_summary(&self) {
        for app in self.apps() {
            if let Some(registry) = self.registries.get(&app) {
                let (imported, overridden) = registry.abstract_view();
                info!(
                    event = "registry",
                    app = %app,
                    imported = ?imported,
                    overridden = ?overridden,
                    "summary"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchService
// ---------------------------------------------------------------------------

/// Tower adapter: the innermost service of the call pipeline.
#[derive(Debug, Clone)]
pub struct DispatchService {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchService {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl Service<Call> for DispatchService {
    type Response = Response;
    type Error = Infallible;
    type Future = CallFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: Call) -> Self::Future {
        let dispatcher = self.dispatcher.clone();
        Box::pin(async move { Ok(dispatcher.call(call.ctx, call.request).await) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use meshcall_core::code;
    use meshcall_core::{CallError, Empty};
    use serde::Serialize;
    use tower::ServiceExt;

    use super::*;
    use crate::remote::{ServiceDirectory, TransportError};
    use crate::remote::client::{ClientFactory, RemoteClient};
    use crate::remote::directory::ServiceEndpoint;
    use crate::service::proxy::ProxyHandler;
    use crate::service::registry::Exports;

    #[derive(Serialize)]
    struct Pong {
        ok: bool,
    }

    #[derive(Clone)]
    struct X;

    impl Capability for X {
        fn instantiate(&self, _ctx: &CallContext) -> Self {
            X
        }

        fn export(exports: &mut Exports<Self>) {
            exports
                .method("ping", |_: X, _ctx, _: Empty| async {
                    Ok::<_, CallError>(Pong { ok: true })
                })
                .method("whoami", |_: X, ctx: CallContext, _: Empty| async move {
                    Ok::<_, CallError>(serde_json::json!({
                        "app": ctx.app,
                        "method": ctx.method,
                        "traced": !ctx.trace_id.is_empty(),
                    }))
                });
        }
    }

    #[derive(Clone)]
    struct Y;

    impl Capability for Y {
        fn instantiate(&self, _ctx: &CallContext) -> Self {
            Y
        }

        fn export(exports: &mut Exports<Self>) {
            exports.method("ping", |_: Y, _ctx, _: Empty| async {
                Ok::<_, CallError>(serde_json::json!({"from": "y"}))
            });
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut builder = DispatcherBuilder::new(InstrumentMode::Dev);
        builder.add("x", X).unwrap().add("y", Y).unwrap();
        builder.build()
    }

    #[tokio::test]
    async fn local_call_succeeds() {
        let rsp = dispatcher()
            .call(CallContext::new(), Request::new("x", "ping", "{}"))
            .await;
        assert_eq!(rsp.code(), code::OK);
        assert_eq!(rsp.msg(), "success");
        assert_eq!(rsp.data().as_ref(), br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn context_is_enriched_before_execution() {
        let rsp = dispatcher()
            .call(CallContext::new(), Request::new("x", "whoami", ""))
            .await;
        let seen: serde_json::Value = rsp.decode().unwrap();
        assert_eq!(seen["app"], "x");
        assert_eq!(seen["method"], "whoami");
        assert_eq!(seen["traced"], true);
    }

    #[tokio::test]
    async fn unknown_app_without_remote_is_unimplemented() {
        let rsp = dispatcher()
            .call(CallContext::new(), Request::new("z", "ping", "{}"))
            .await;
        assert_eq!(rsp.code(), code::UNIMPLEMENTED);
        assert_eq!(rsp.msg(), "app [z] not implemented");
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let rsp = dispatcher()
            .call(CallContext::new(), Request::new("x", "missing", "{}"))
            .await;
        assert_eq!(rsp.code(), code::UNIMPLEMENTED);
    }

    #[tokio::test]
    async fn redirect_proxy_reaches_other_local_app() {
        let d = dispatcher();
        d.proxies().install(
            "x",
            Some("ping"),
            ProxyTarget::Redirect {
                app: "y".into(),
                method: None,
            },
        );
        let rsp = d.call(CallContext::new(), Request::new("x", "ping", "{}")).await;
        assert_eq!(rsp.data().as_ref(), br#"{"from":"y"}"#);

        // Other methods of x are untouched.
        let rsp = d.call(CallContext::new(), Request::new("x", "whoami", "{}")).await;
        assert!(rsp.is_ok());
    }

    #[tokio::test]
    async fn redirect_is_not_proxied_twice() {
        let d = dispatcher();
        let to = |app: &str| ProxyTarget::Redirect {
            app: app.into(),
            method: None,
        };
        d.proxies().install("x", None, to("y"));
        d.proxies().install("y", None, to("x"));
        let rsp = d.call(CallContext::new(), Request::new("x", "ping", "{}")).await;
        assert_eq!(rsp.data().as_ref(), br#"{"from":"y"}"#);
    }

    struct Exploding;

    #[async_trait]
    impl ProxyHandler for Exploding {
        async fn call(&self, _ctx: CallContext, req: Request) -> Response {
            if req.method() == "boom" {
                panic!("proxy exploded");
            }
            Response::success(r#"{"proxied":true}"#)
        }
    }

    #[tokio::test]
    async fn proxy_handler_intercepts_unknown_app_and_contains_panics() {
        let d = dispatcher();
        d.proxies()
            .install("legacy", None, ProxyTarget::Handler(Arc::new(Exploding)));

        let rsp = d.call(CallContext::new(), Request::new("legacy", "get", "")).await;
        assert_eq!(rsp.data().as_ref(), br#"{"proxied":true}"#);

        let rsp = d.call(CallContext::new(), Request::new("legacy", "boom", "")).await;
        assert_eq!(rsp.code(), code::INTERNAL);
    }

    #[tokio::test]
    async fn builtin_lists_methods_and_beats() {
        let mut builder = DispatcherBuilder::new(InstrumentMode::Release);
        builder.add("x", X).unwrap().with_builtin();
        let d = builder.build();

        let rsp = d.call(CallContext::new(), Request::new("sys", "methods", "")).await;
        let listing: BTreeMap<String, Vec<String>> = rsp.decode().unwrap();
        assert_eq!(listing["x"], vec!["ping", "whoami"]);
        assert_eq!(listing["sys"], vec!["heartbeat", "methods"]);

        let rsp = d.call(CallContext::new(), Request::new("sys", "heartbeat", "")).await;
        let beat: serde_json::Value = rsp.decode().unwrap();
        assert!(beat["tick"].as_u64().unwrap() > 0);
    }

    #[test]
    fn builder_rejects_invalid_app_and_duplicates() {
        let mut builder = DispatcherBuilder::new(InstrumentMode::Dev);
        assert!(matches!(
            builder.add("", X),
            Err(RegistryError::InvalidApp { .. })
        ));
        assert!(matches!(
            builder.add("bad/app", X),
            Err(RegistryError::InvalidApp { .. })
        ));
        builder.add("x", X).unwrap();
        assert!(matches!(
            builder.add("x", X),
            Err(RegistryError::Duplicate { .. })
        ));
        builder.override_with("x", X).unwrap();
    }

    #[test]
    fn built_registries_are_sealed_and_forbid_app_removes() {
        let mut builder = DispatcherBuilder::new(InstrumentMode::Dev);
        builder.add("x", X).unwrap().add("debug", Y).unwrap();
        builder.forbid_app(&["debug"]);
        let d = builder.build();
        assert_eq!(d.apps(), vec!["x"]);
        assert!(d.registry("x").unwrap().is_sealed());
        d.log_summary();
    }

    struct Unreachable;

    impl ClientFactory for Unreachable {
        fn connect(
            &self,
            endpoint: &ServiceEndpoint,
        ) -> Result<Arc<dyn RemoteClient>, TransportError> {
            Err(TransportError::Connect {
                endpoint: endpoint.address.clone(),
                reason: "test".into(),
            })
        }
    }

    #[tokio::test]
    async fn unknown_app_goes_to_remote_router() {
        let directory = Arc::new(ServiceDirectory::new("/mesh"));
        let remote = Arc::new(RemoteRouter::new(
            directory,
            Arc::new(Unreachable),
            "inst",
            CallMetrics::new("h", "inst"),
        ));
        let mut builder = DispatcherBuilder::new(InstrumentMode::Dev);
        builder.add("x", X).unwrap().with_remote(remote);
        let d = builder.build();

        let rsp = d.call(CallContext::new(), Request::new("orders", "get", "")).await;
        assert_eq!(rsp.code(), code::NOT_FOUND);

        // Local apps still win.
        let rsp = d.call(CallContext::new(), Request::new("x", "ping", "")).await;
        assert!(rsp.is_ok());
    }

    #[tokio::test]
    async fn dispatch_service_via_oneshot() {
        let svc = DispatchService::new(Arc::new(dispatcher()));
        let rsp = svc
            .oneshot(Call::new(CallContext::new(), Request::new("x", "ping", "{}")))
            .await
            .unwrap();
        assert!(rsp.is_ok());
    }
}
