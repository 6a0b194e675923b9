//! Periodic jobs that run on at most one instance per tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshcall_core::{CallContext, CoordinationStore, Request};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::mutex::{DistributedMutex, LockError, LockOptions};
use crate::service::dispatcher::Dispatcher;
use crate::service::worker::{BackgroundRunnable, RunNow};

/// Runs `job` while holding the mutex at `key`.
///
/// Returns `Ok(None)` when the lock is held elsewhere, the lock timeout
/// elapses or the context ends: the caller skips this tick. Store failures
/// while acquiring are returned as errors; a failed release is only logged
/// because the job already ran.
pub async fn run_exclusive<F, Fut, T>(
    store: Arc<dyn CoordinationStore>,
    ctx: &CallContext,
    key: &str,
    options: LockOptions,
    job: F,
) -> Result<Option<T>, LockError>
where
    F: FnOnce(CallContext) -> Fut,
    Fut: Future<Output = T>,
{
    let mut mutex = DistributedMutex::new(store, key, options);
    match mutex.lock(ctx).await {
        Ok(()) => {}
        Err(LockError::Timeout { .. } | LockError::Cancelled { .. }) => {
            debug!(event = "job", key, "lock busy, skipping tick");
            return Ok(None);
        }
        Err(e) => return Err(e),
    }

    let out = job(ctx.clone()).await;

    if let Err(e) = mutex.unlock().await {
        warn!(event = "job", key, error = %e, "release failed");
    }
    Ok(Some(out))
}

/// A job as written in configuration: dispatch `app.method(param)` every
/// `interval_secs`, cluster-wide exclusive.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub app: String,
    pub method: String,
    #[serde(default)]
    pub param: Option<serde_json::Value>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl JobConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Builds the request this job dispatches.
    pub fn request(&self) -> Result<Request, serde_json::Error> {
        match &self.param {
            Some(param) => Request::encode(self.app.as_str(), self.method.as_str(), param),
            None => Ok(Request::new(self.app.as_str(), self.method.as_str(), "")),
        }
    }
}

/// Background runnable dispatching one request per tick under a mutex.
pub struct ExclusiveJob {
    name: String,
    key: String,
    store: Arc<dyn CoordinationStore>,
    dispatcher: Arc<Dispatcher>,
    request: Request,
    timeout: Duration,
    options: LockOptions,
}

impl ExclusiveJob {
    /// `prefix` is the coordination key prefix; the lock lives at
    /// `<prefix>/jobs/<name>`.
    pub fn new(
        config: &JobConfig,
        prefix: &str,
        store: Arc<dyn CoordinationStore>,
        dispatcher: Arc<Dispatcher>,
        options: LockOptions,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            name: config.name.clone(),
            key: format!("{}/jobs/{}", prefix.trim_end_matches('/'), config.name),
            store,
            dispatcher,
            request: config.request()?,
            timeout: Duration::from_millis(config.timeout_ms),
            options,
        })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    async fn tick(&self) {
        let mut ctx = CallContext::new().with_timeout(self.timeout);
        ctx.trace_id = uuid::Uuid::new_v4().to_string();
        ctx.user = format!("job:{}", self.name);

        let dispatcher = self.dispatcher.clone();
        let request = self.request.clone();
        let store = self.store.clone();
        let outcome = run_exclusive(store, &ctx, &self.key, self.options, |ctx| async move {
            dispatcher.call(ctx, request).await
        })
        .await;

        match outcome {
            Ok(Some(rsp)) if rsp.is_ok() => {
                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = ctx.elapsed().as_millis() as u64;
                info!(event = "job", job = %self.name, duration_ms, "done");
            }
            Ok(Some(rsp)) => {
                warn!(
                    event = "job",
                    job = %self.name,
                    code = rsp.code(),
                    error = %rsp.msg(),
                    "job returned failure"
                );
            }
            Ok(None) => {}
            Err(e) => warn!(event = "job", job = %self.name, error = %e, "lock unavailable"),
        }
    }
}

#[async_trait]
impl BackgroundRunnable for ExclusiveJob {
    type Task = RunNow;

    fn name(&self) -> &'static str {
        "exclusive-job"
    }

    async fn run(&mut self, _task: RunNow) {
        self.tick().await;
    }

    async fn on_tick(&mut self) {
        self.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use meshcall_core::{CallError, Empty};

    use super::*;
    use crate::coordination::MemoryStore;
    use crate::service::executor::InstrumentMode;
    use crate::service::registry::{Capability, Exports};
    use crate::service::DispatcherBuilder;

    #[tokio::test]
    async fn second_runner_skips_while_first_holds() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let options = LockOptions {
            lock_timeout: Duration::from_millis(50),
            retry_interval: Duration::from_millis(10),
            ..LockOptions::default()
        };
        let ctx = CallContext::new();

        let mut holder = DistributedMutex::new(store.clone(), "/jobs/report", options);
        holder.lock(&ctx).await.unwrap();

        let skipped = run_exclusive(store.clone(), &ctx, "/jobs/report", options, |_| async { 1 })
            .await
            .unwrap();
        assert_eq!(skipped, None);

        holder.unlock().await.unwrap();
        let ran = run_exclusive(store.clone(), &ctx, "/jobs/report", options, |_| async { 2 })
            .await
            .unwrap();
        assert_eq!(ran, Some(2));
        assert!(store.get("/jobs/report").await.unwrap().is_none());
    }

    #[derive(Clone)]
    struct Reports {
        runs: Arc<AtomicU32>,
    }

    impl Capability for Reports {
        fn instantiate(&self, _ctx: &CallContext) -> Self {
            self.clone()
        }

        fn export(exports: &mut Exports<Self>) {
            exports.method("build", |me: Reports, _ctx, _p: Empty| async move {
                me.runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CallError>(Empty {})
            });
        }
    }

    #[tokio::test]
    async fn exclusive_job_dispatches_configured_request() {
        let runs = Arc::new(AtomicU32::new(0));
        let mut builder = DispatcherBuilder::new(InstrumentMode::Dev);
        builder
            .add("reports", Reports { runs: runs.clone() })
            .unwrap();
        let dispatcher = Arc::new(builder.build());
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());

        let config: JobConfig = serde_json::from_str(
            r#"{"name": "nightly", "app": "reports", "method": "build"}"#,
        )
        .unwrap();
        assert_eq!(config.interval(), Duration::from_secs(60));

        let mut job =
            ExclusiveJob::new(&config, "/mesh", store, dispatcher, LockOptions::default()).unwrap();
        assert_eq!(job.key(), "/mesh/jobs/nightly");
        job.on_tick().await;
        job.run(RunNow).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
