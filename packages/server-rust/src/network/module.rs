//! Gateway server with deferred startup.
//!
//! `new()` allocates shared state, `start()` binds the listener and
//! `serve()` accepts connections. Between `start()` and `serve()` the
//! caller knows the bound port and can announce it to peers.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::handlers::{
    api_handler, health_handler, liveness_handler, readiness_handler, rpc_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::remote::client::RPC_PATH;
use crate::service::{CallPipeline, Dispatcher};

/// Owns the listener and the routes around one call pipeline.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    pipeline: CallPipeline,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, pipeline: CallPipeline, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            listener: None,
            pipeline,
            dispatcher,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Shared so the binary can trigger shutdown and probes can read state.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Routes:
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - `POST /api/{app}/{method}` -- client calls
    /// - `POST /rpc` -- peer envelope calls
    pub fn build_router(&self) -> Router {
        let state = AppState {
            pipeline: self.pipeline.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/api/{app}/{method}", post(api_handler))
            .route(RPC_PATH, post(rpc_handler))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener and returns the actual port (port 0 asks the OS).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot bind {addr}"))?;
        let port = listener.local_addr()?.port();
        info!(event = "network", host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight calls.
    ///
    /// # Errors
    ///
    /// Fails when called before [`start`](Self::start), when TLS material
    /// cannot be loaded, or on a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .context("start() must be called before serve()")?;
        let router = self.build_router();
        let controller = Arc::clone(&self.shutdown);

        // Flip to Draining as soon as the signal fires so new calls are
        // refused while the server finishes open connections.
        let signal = {
            let controller = Arc::clone(&controller);
            async move {
                shutdown.await;
                controller.trigger_shutdown();
            }
        };

        controller.set_ready();
        match &self.config.tls {
            Some(tls) => serve_tls(listener, router, tls, signal).await?,
            None => serve_plain(listener, router, signal).await?,
        }

        if controller.wait_for_drain(self.config.drain_timeout).await {
            info!(event = "network", "drained");
        } else {
            warn!(
                event = "network",
                in_flight = controller.in_flight_count(),
                "drain timeout expired"
            );
        }
        Ok(())
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(event = "network", tls = false, "serving");
    axum::serve(listener, router).with_graceful_shutdown(signal).await?;
    Ok(())
}

/// Reuses the pre-bound listener through `axum-server` with rustls.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .with_context(|| format!("cannot load TLS material from {}", tls.cert_path.display()))?;

    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        signal.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(event = "network", tls = true, "serving");
    axum_server::from_tcp_rustls(std_listener, rustls)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::network::HealthState;
    use crate::service::config::DispatchConfig;
    use crate::service::{build_call_pipeline, DispatcherBuilder, InstrumentMode};

    fn module(config: NetworkConfig) -> NetworkModule {
        let mut builder = DispatcherBuilder::new(InstrumentMode::Dev);
        builder.with_builtin();
        let dispatcher = Arc::new(builder.build());
        let pipeline = build_call_pipeline(dispatcher.clone(), &DispatchConfig::default());
        NetworkModule::new(config, pipeline, dispatcher)
    }

    fn local() -> NetworkConfig {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn router_serves_api_route() {
        let module = module(local());
        module.shutdown_controller().set_ready();

        let rsp = module
            .build_router()
            .oneshot(Request::post("/api/sys/heartbeat").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], 0);
        assert!(json["data"]["tick"].is_u64());
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let rsp = module(local())
            .build_router()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module(local());
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module(local()).serve(std::future::pending()).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serve_stops_on_signal_and_drains() {
        let mut module = module(local());
        let port = module.start().await.unwrap();
        let controller = module.shutdown_controller();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(module.serve(async move {
            let _ = rx.await;
        }));

        let url = format!("http://127.0.0.1:{port}/api/sys/heartbeat");
        let client = reqwest::Client::new();
        let mut body = None;
        for _ in 0..50 {
            if let Ok(rsp) = client.post(&url).send().await {
                body = Some(rsp.json::<serde_json::Value>().await.unwrap());
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(body.unwrap()["code"], 0);
        drop(client);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }
}
