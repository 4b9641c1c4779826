//! Job type registry and job execution.
//!
//! The [`Engine`] maps job types to workers. It is:
//! - Cheap to clone and shared across all callers
//! - Hot-swappable: re-registering a job type replaces its worker, while
//!   jobs already running keep the worker they started on
//! - Backend-agnostic: it only sees `dyn RuntimeBuilder`

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use capsule_common::{BackendKind, ExecutionConfig, RuntimeConfig, RuntimeError};

use crate::bus::{Bus, Message};
use crate::job::{Job, JobHandle, JobResult};
use crate::runtime::{Backend, HostApi};
use crate::scheduler::{
    RegisterOptions, Schedule, ScheduleHandle, Scheduler, SchedulerMetrics, Worker, WorkerMetrics,
};
use crate::ModuleRef;

/// Callback invoked with each bus message and the result of its job.
pub type ListenCallback = dyn Fn(Message, JobResult) + Send + Sync;

/// Snapshot of engine activity.
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    /// Backend every module is compiled with.
    pub backend: String,
    /// Scheduler counters.
    pub jobs: SchedulerMetrics,
    /// One entry per registered job type, sorted by job type.
    pub workers: Vec<WorkerMetrics>,
}

struct EngineInner {
    backend: Backend,
    api: HostApi,
    execution: ExecutionConfig,
    workers: RwLock<HashMap<String, Arc<Worker>>>,
    scheduler: Scheduler,
}

/// Registry of job types and the entry point for running jobs.
///
/// # Example
///
/// ```ignore
/// use capsule_core::{Engine, Job, ModuleRef, RegisterOptions};
///
/// let engine = Engine::from_config(&RuntimeConfig::default(), HostApi::default())?;
/// engine.register("hello", ModuleRef::from_file("hello.wasm")?, RegisterOptions::default())?;
/// let output = engine.execute(Job::new("hello", b"world".to_vec())).then().await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine over an initialized backend.
    pub fn new(backend: Backend, api: HostApi, execution: ExecutionConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                backend,
                api,
                execution,
                workers: RwLock::new(HashMap::new()),
                scheduler: Scheduler::new(),
            }),
        }
    }

    /// Create the configured backend and an engine over it.
    pub fn from_config(config: &RuntimeConfig, api: HostApi) -> Result<Self, RuntimeError> {
        let backend = Backend::new(&config.engine, &config.execution)?;
        Ok(Self::new(backend, api, config.execution.clone()))
    }

    /// Backend modules are compiled with.
    pub fn backend(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    /// Host functions linked into every module.
    pub fn host_api(&self) -> &HostApi {
        &self.inner.api
    }

    /// Registration options derived from the execution config.
    pub fn default_options(&self) -> RegisterOptions {
        RegisterOptions::from_execution(&self.inner.execution)
    }

    /// Register `module_ref` under `job_type`, replacing any previous module.
    ///
    /// Compilation is deferred to the first job unless `options.pre_warm` is
    /// set, in which case compile, link and initialization errors are returned
    /// here and nothing is registered.
    #[instrument(skip(self, module_ref, options), fields(module = %module_ref.name(), version = %module_ref.version()))]
    pub fn register(
        &self,
        job_type: &str,
        module_ref: ModuleRef,
        options: RegisterOptions,
    ) -> Result<(), RuntimeError> {
        let builder = self.inner.backend.builder(module_ref, self.inner.api.clone());
        let worker = Arc::new(Worker::new(job_type, builder, options));

        if worker.options().pre_warm {
            worker.warm()?;
            debug!("Module pre-warmed");
        }

        let previous = self.inner.workers.write().insert(job_type.to_string(), worker);
        if previous.is_some() {
            info!("Module replaced");
        } else {
            info!("Module registered");
        }

        Ok(())
    }

    /// Load a module from disk and register it.
    pub fn register_from_file(
        &self,
        job_type: &str,
        path: impl AsRef<Path>,
        options: RegisterOptions,
    ) -> Result<(), RuntimeError> {
        let module_ref = ModuleRef::from_file(path)?;
        self.register(job_type, module_ref, options)
    }

    /// Remove a job type. Returns `false` if it was not registered.
    pub fn deregister(&self, job_type: &str) -> bool {
        let removed = self.inner.workers.write().remove(job_type).is_some();
        if removed {
            info!(job_type, "Module deregistered");
        }
        removed
    }

    /// Returns `true` if `job_type` has a registered module.
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.inner.workers.read().contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn registered(&self) -> Vec<String> {
        let mut job_types: Vec<String> = self.inner.workers.read().keys().cloned().collect();
        job_types.sort();
        job_types
    }

    /// Module currently registered under `job_type`.
    pub fn module_ref(&self, job_type: &str) -> Option<ModuleRef> {
        self.inner
            .workers
            .read()
            .get(job_type)
            .map(|worker| worker.builder().module_ref().clone())
    }

    /// Run a job.
    ///
    /// Unknown job types resolve immediately with
    /// [`RuntimeError::ModuleNotFound`].
    pub fn execute(&self, job: Job) -> JobHandle {
        let worker = self.inner.workers.read().get(&job.job_type).cloned();
        match worker {
            Some(worker) => self.inner.scheduler.submit(worker, job),
            None => {
                debug!(job_type = %job.job_type, "No module registered for job");
                JobHandle::ready(job.id, Err(RuntimeError::module_not_found(job.job_type)))
            }
        }
    }

    /// Current activity counters.
    pub fn metrics(&self) -> EngineMetrics {
        let mut workers: Vec<WorkerMetrics> = self
            .inner
            .workers
            .read()
            .values()
            .map(|worker| worker.metrics())
            .collect();
        workers.sort_by(|a, b| a.job_type.cmp(&b.job_type));

        EngineMetrics {
            backend: self.backend().to_string(),
            jobs: self.inner.scheduler.metrics(),
            workers,
        }
    }

    /// Install a recurring job. The first run happens one interval from now.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&self, schedule: Schedule) -> Result<ScheduleHandle, RuntimeError> {
        let runtime = current_runtime()?;
        let engine = self.clone();

        info!(
            job_type = schedule.job_type(),
            interval_ms = u64::try_from(schedule.interval().as_millis()).unwrap_or(u64::MAX),
            "Schedule installed"
        );

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(schedule.interval());
            // The first tick completes immediately.
            ticker.tick().await;

            let mut runs = 0_u64;
            while schedule.limit().is_none_or(|limit| runs < limit) {
                ticker.tick().await;
                runs += 1;

                let job = Job::new(schedule.job_type(), schedule.payload().to_vec());
                match engine.execute(job).then().await {
                    Ok(output) => debug!(
                        job_type = schedule.job_type(),
                        output_len = output.len(),
                        "Scheduled job completed"
                    ),
                    Err(e) => warn!(
                        job_type = schedule.job_type(),
                        error = %e,
                        "Scheduled job failed"
                    ),
                }
            }
        });

        Ok(ScheduleHandle::new(task))
    }

    /// Run a job for every bus message whose subject is `msg_type`.
    ///
    /// The job type is `msg_type` and the payload is the message payload.
    /// `callback` receives each message with its result. The listener stops
    /// when the bus closes.
    pub fn listen_and_run<F>(
        &self,
        bus: &Arc<dyn Bus>,
        msg_type: impl Into<String>,
        callback: F,
    ) -> Result<JoinHandle<()>, RuntimeError>
    where
        F: Fn(Message, JobResult) + Send + Sync + 'static,
    {
        let runtime = current_runtime()?;
        let mut rx = bus.subscribe();
        let msg_type = msg_type.into();
        let callback: Arc<ListenCallback> = Arc::new(callback);
        let engine = self.clone();

        info!(msg_type = %msg_type, "Listening for bus messages");

        Ok(runtime.spawn(async move {
            loop {
                let message = match rx.recv().await {
                    Ok(message) => message,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(msg_type = %msg_type, skipped, "Listener lagged behind the bus");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                if message.subject != msg_type {
                    continue;
                }

                let handle = engine.execute(Job::new(msg_type.clone(), message.payload.clone()));
                let callback = Arc::clone(&callback);
                tokio::spawn(async move {
                    let result = handle.then().await;
                    callback(message, result);
                });
            }

            debug!(msg_type = %msg_type, "Bus listener stopped");
        }))
    }
}

fn current_runtime() -> Result<Handle, RuntimeError> {
    Handle::try_current()
        .map_err(|_| RuntimeError::invalid_config("a Tokio runtime is required"))
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.inner.backend)
            .field("registered", &self.registered())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "wasmtime"))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use capsule_common::CapabilityConfig;

    use super::*;
    use crate::bus::LocalBus;

    const ECHO: &str = r#"
        (module
            (import "env" "return_result" (func $return_result (param i32 i32) (result i32)))
            (memory (export "memory") 1)
            (func (export "allocate") (param i32) (result i32) (i32.const 1024))
            (func (export "run_e") (param i32 i32)
                (drop (call $return_result (local.get 0) (local.get 1)))))
    "#;

    const CONSTANT: &str = r#"
        (module
            (import "env" "return_result" (func $return_result (param i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "v2")
            (func (export "allocate") (param i32) (result i32) (i32.const 1024))
            (func (export "run_e") (param i32 i32)
                (drop (call $return_result (i32.const 0) (i32.const 2)))))
    "#;

    fn module(name: &str, wat_src: &str) -> ModuleRef {
        ModuleRef::new(name, "1.0.0", wat::parse_str(wat_src).unwrap())
    }

    fn engine() -> Engine {
        Engine::from_config(
            &RuntimeConfig::default(),
            HostApi::new(CapabilityConfig::none()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_registered() {
        let engine = engine();
        engine
            .register("echo", module("echo", ECHO), RegisterOptions::default())
            .unwrap();

        let output = engine
            .execute(Job::new("echo", b"ping".to_vec()))
            .then()
            .await
            .unwrap();
        assert_eq!(output, b"ping");
    }

    #[tokio::test]
    async fn test_execute_unknown_job_type() {
        let engine = engine();
        let result = engine.execute(Job::new("missing", b"x".to_vec())).then().await;
        assert!(matches!(result, Err(RuntimeError::ModuleNotFound { .. })));
    }

    #[tokio::test]
    async fn test_hot_swap() {
        let engine = engine();
        engine
            .register("svc", module("echo", ECHO), RegisterOptions::default())
            .unwrap();
        engine
            .register("svc", module("constant", CONSTANT), RegisterOptions::default())
            .unwrap();

        let output = engine
            .execute(Job::new("svc", b"ping".to_vec()))
            .then()
            .await
            .unwrap();
        assert_eq!(output, b"v2");
        assert_eq!(engine.module_ref("svc").unwrap().name(), "constant");
        assert_eq!(engine.registered(), vec!["svc".to_string()]);
    }

    #[test]
    fn test_pre_warm_reports_compile_errors() {
        let engine = engine();
        let bad = ModuleRef::new("bad", "1.0.0", b"\0asm\x01\0\0\0garbage".to_vec());

        let err = engine
            .register("bad", bad, RegisterOptions::default().with_pre_warm(true))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
        assert!(!engine.is_registered("bad"));
    }

    #[test]
    fn test_deregister() {
        let engine = engine();
        engine
            .register("echo", module("echo", ECHO), RegisterOptions::default())
            .unwrap();

        assert!(engine.deregister("echo"));
        assert!(!engine.deregister("echo"));
        assert!(!engine.is_registered("echo"));
    }

    #[tokio::test]
    async fn test_metrics() {
        let engine = engine();
        engine
            .register("echo", module("echo", ECHO), RegisterOptions::default())
            .unwrap();
        engine
            .execute(Job::new("echo", b"a".to_vec()))
            .then()
            .await
            .unwrap();

        let metrics = engine.metrics();
        assert_eq!(metrics.backend, "wasmtime");
        assert_eq!(metrics.jobs.completed, 1);
        assert_eq!(metrics.workers.len(), 1);
        assert_eq!(metrics.workers[0].compilations, 1);
        assert_eq!(metrics.workers[0].idle_instances, 1);
    }

    #[tokio::test]
    async fn test_schedule_runs_limited_times() {
        let engine = engine();
        engine
            .register("echo", module("echo", ECHO), RegisterOptions::default())
            .unwrap();

        let handle = engine
            .schedule(Schedule::every("echo", Duration::from_millis(5)).times(3))
            .unwrap();

        for _ in 0..200 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(handle.is_finished());
        assert_eq!(engine.metrics().jobs.completed, 3);
    }

    #[tokio::test]
    async fn test_listen_and_run() {
        let engine = engine();
        engine
            .register("echo", module("echo", ECHO), RegisterOptions::default())
            .unwrap();

        let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let counter = Arc::clone(&seen);
        let _listener = engine
            .listen_and_run(&bus, "echo", move |message, result| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send((message.payload, result.unwrap()));
            })
            .unwrap();

        bus.send(Message::new("other", b"ignored".to_vec())).unwrap();
        bus.send(Message::new("echo", b"hi".to_vec())).unwrap();

        let (payload, output) = rx.recv().await.unwrap();
        assert_eq!(payload, b"hi");
        assert_eq!(output, b"hi");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_schedule_requires_runtime() {
        let engine = engine();
        let err = engine
            .schedule(Schedule::every("echo", Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }
}
