//! meshcall gateway: serves the built-in apps, forwards everything else to
//! peers found in the coordination store, and runs configured jobs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use meshcall_core::CoordinationStore;
use meshcall_server::coordination::{EtcdStore, ExclusiveJob, MemoryStore};
use meshcall_server::remote::{
    DirectoryRefresher, HttpClientFactory, RemoteRouter, ServiceAnnouncer, ServiceDirectory,
    ServiceEndpoint,
};
use meshcall_server::service::builtin::{DebugApp, DEBUG_APP};
use meshcall_server::service::config::StoreBackend;
use meshcall_server::service::middleware::metrics::{CallMetrics, CALL_DURATION, DURATION_BUCKETS};
use meshcall_server::service::{
    build_call_pipeline, BackgroundWorker, DispatcherBuilder, InstrumentMode, ProxyTable,
    ServerConfig,
};
use meshcall_server::NetworkModule;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meshcall-gateway")]
#[command(about = "HTTP gateway and call dispatcher for meshcall services")]
struct Args {
    /// JSON configuration file; every field is optional
    #[arg(short, long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long, env = "MESHCALL_HOST")]
    host: Option<String>,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, env = "MESHCALL_PORT")]
    port: Option<u16>,

    /// Service name announced to peers
    #[arg(long, env = "MESHCALL_SERVICE")]
    service: Option<String>,

    /// Unique instance id (generated when unset)
    #[arg(long, env = "MESHCALL_INSTANCE")]
    instance: Option<String>,

    /// Release mode: JSON logs, quiet payloads, no debug app
    #[arg(long, env = "MESHCALL_RELEASE")]
    release: bool,

    /// Coordination store backend: memory or etcd
    #[arg(long, env = "MESHCALL_STORE")]
    store: Option<String>,

    /// etcd JSON gateway endpoint
    #[arg(long, env = "MESHCALL_ETCD")]
    etcd_endpoint: Option<String>,

    /// Address peers use to reach this instance
    #[arg(long, env = "MESHCALL_ADVERTISE")]
    advertise: Option<String>,

    /// Prometheus listener, e.g. 0.0.0.0:9100
    #[arg(long, env = "MESHCALL_METRICS")]
    metrics_listen: Option<SocketAddr>,
}

fn load_config(args: Args) -> Result<ServerConfig> {
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.network.host = host;
    }
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(service) = args.service {
        config.service = service;
    }
    if let Some(instance) = args.instance {
        config.instance = instance;
    }
    if args.release {
        config.mode = InstrumentMode::Release;
    }
    if let Some(store) = args.store {
        config.coordination.backend = match store.as_str() {
            "memory" => StoreBackend::Memory,
            "etcd" => StoreBackend::Etcd,
            other => anyhow::bail!("unknown store backend {other:?}"),
        };
    }
    if let Some(endpoint) = args.etcd_endpoint {
        config.coordination.etcd_endpoint = endpoint;
    }
    if let Some(advertise) = args.advertise {
        config.coordination.advertise_address = Some(advertise);
    }
    if let Some(listen) = args.metrics_listen {
        config.metrics.listen = Some(listen);
    }
    Ok(config.finalize()?)
}

/// JSON lines in release mode, compact text in dev mode; `RUST_LOG`
/// overrides the `info` default.
fn init_tracing(mode: InstrumentMode) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if mode.is_release() {
        builder.json().flatten_event(true).init();
    } else {
        builder.compact().init();
    }
}

fn init_metrics(listen: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .set_buckets_for_metric(Matcher::Full(CALL_DURATION.to_string()), DURATION_BUCKETS)?
        .install()
        .context("cannot install prometheus exporter")?;
    info!(event = "metrics", %listen, "prometheus exporter listening");
    Ok(())
}

/// SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, draining"),
        () = terminate => info!("received SIGTERM, draining"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(Args::parse())?;
    init_tracing(config.mode);
    if let Some(listen) = config.metrics.listen {
        init_metrics(listen)?;
    }
    info!(
        event = "startup",
        service = %config.service,
        instance = %config.instance,
        mode = ?config.mode,
        "starting meshcall gateway"
    );

    let http = reqwest::Client::new();
    let store: Arc<dyn CoordinationStore> = match config.coordination.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Etcd => Arc::new(EtcdStore::new(
            http.clone(),
            &config.coordination.etcd_endpoint,
        )),
    };
    let prefix = config.coordination.prefix.as_str();

    // Directory: static routes and endpoints first, then whatever peers
    // announced.
    let directory = Arc::new(ServiceDirectory::new(prefix).with_store(store.clone()));
    for (service, apps) in &config.remote.routes {
        directory.route_apps(service, apps.as_slice());
    }
    for endpoint in &config.remote.endpoints {
        directory.add_static_endpoint(endpoint.clone());
    }
    if let Err(e) = directory.refresh().await {
        warn!(event = "directory", error = %e, "initial refresh failed");
    }

    let metrics = CallMetrics::new(&config.host, &config.instance);
    let mut builder = DispatcherBuilder::new(config.mode);
    builder
        .with_builtin()
        .with_metrics(metrics.clone())
        .with_slow_threshold(config.dispatch.slow_threshold)
        .with_proxies(Arc::new(ProxyTable::from_rules(&config.proxies)))
        .add(DEBUG_APP, DebugApp)?;
    if config.remote.enabled {
        let router = RemoteRouter::new(
            directory.clone(),
            Arc::new(HttpClientFactory::new(http.clone())),
            &config.instance,
            metrics,
        )
        .with_policy(config.remote.retry);
        builder.with_remote(Arc::new(router));
    }
    if config.mode.is_release() {
        let forbidden: Vec<&str> = config
            .dispatch
            .release_forbidden_apps
            .iter()
            .map(String::as_str)
            .collect();
        builder.forbid_app(&forbidden);
    }
    let dispatcher = Arc::new(builder.build());
    dispatcher.log_summary();

    let pipeline = build_call_pipeline(dispatcher.clone(), &config.dispatch);
    let mut network = NetworkModule::new(config.network.clone(), pipeline, dispatcher.clone());
    let port = network.start().await?;

    let mut refresher = BackgroundWorker::start(
        DirectoryRefresher::new(directory),
        config.remote.refresh_interval,
    );

    let mut announcer = None;
    if let Some(address) = &config.coordination.advertise_address {
        let address = address.replace("{port}", &port.to_string());
        let endpoint = ServiceEndpoint::new(&config.service, &config.instance, &address)
            .with_apps(dispatcher.apps());
        let mut runnable =
            ServiceAnnouncer::new(store.clone(), prefix, endpoint, config.coordination.lease_ttl);
        if let Err(e) = runnable.announce().await {
            warn!(event = "announce", error = %e, "initial registration failed, retrying on tick");
        }
        announcer = Some(BackgroundWorker::start(runnable, config.coordination.announce_interval));
    }

    let mut jobs = Vec::with_capacity(config.jobs.len());
    for job in &config.jobs {
        let lock = config.coordination.lock;
        let runnable = ExclusiveJob::new(job, prefix, store.clone(), dispatcher.clone(), lock)
            .with_context(|| format!("job {} has an unencodable param", job.name))?;
        jobs.push(BackgroundWorker::start(runnable, job.interval()));
    }

    info!(event = "startup", port, jobs = jobs.len(), "gateway ready");
    network.serve(shutdown_signal()).await?;

    for job in &mut jobs {
        job.stop().await;
    }
    if let Some(announcer) = announcer.as_mut() {
        announcer.stop().await;
    }
    refresher.stop().await;
    info!(event = "shutdown", "gateway stopped");
    Ok(())
}
