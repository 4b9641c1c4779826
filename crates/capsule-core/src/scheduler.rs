//! Worker pools and job scheduling.
//!
//! Every registered job type gets a [`Worker`]: one builder plus a pool of
//! idle instances. The [`Scheduler`] runs each job on the blocking thread pool
//! with exclusive ownership of one instance, then hands the instance back to
//! the pool unless the call left it in an unknown state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info_span, warn, Instrument, Span};

use capsule_common::{ExecutionConfig, RuntimeError};

use crate::job::{self, Job, JobHandle, JobResult};
use crate::runtime::{RuntimeBuilder, RuntimeInstance, RUN_EXPORT};

/// Per-registration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Maximum number of idle instances kept for reuse. `0` disables pooling.
    pub pool_size: usize,
    /// Build one instance during registration and surface its errors.
    pub pre_warm: bool,
    /// Resolve jobs with [`RuntimeError::ExecutionTimeout`] after this long.
    pub timeout: Option<Duration>,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            pre_warm: false,
            timeout: None,
        }
    }
}

impl RegisterOptions {
    /// Options derived from the execution config.
    pub fn from_execution(config: &ExecutionConfig) -> Self {
        Self {
            pool_size: config.pool_size,
            pre_warm: false,
            timeout: config.timeout(),
        }
    }

    /// Set whether the module is built eagerly.
    #[must_use]
    pub fn with_pre_warm(mut self, pre_warm: bool) -> Self {
        self.pre_warm = pre_warm;
        self
    }

    /// Set the per-job timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the idle pool capacity.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }
}

/// One job type's builder and its idle instances.
pub struct Worker {
    job_type: String,
    builder: Arc<dyn RuntimeBuilder>,
    pool: Mutex<Vec<Box<dyn RuntimeInstance>>>,
    options: RegisterOptions,
}

impl Worker {
    /// Create a worker with an empty pool.
    pub fn new(
        job_type: impl Into<String>,
        builder: Arc<dyn RuntimeBuilder>,
        options: RegisterOptions,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            builder,
            pool: Mutex::new(Vec::new()),
            options,
        }
    }

    /// Job type this worker serves.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// The builder producing this worker's instances.
    pub fn builder(&self) -> &Arc<dyn RuntimeBuilder> {
        &self.builder
    }

    /// Registration options.
    pub fn options(&self) -> &RegisterOptions {
        &self.options
    }

    /// Number of idle instances in the pool.
    pub fn idle(&self) -> usize {
        self.pool.lock().len()
    }

    /// Build one instance now and park it in the pool.
    pub fn warm(&self) -> Result<(), RuntimeError> {
        let instance = self.builder.build()?;
        self.release(instance);
        Ok(())
    }

    /// Run the module's run export with `input` on an exclusively owned instance.
    ///
    /// The instance goes back to the pool afterwards unless the call trapped,
    /// ran out of fuel, or `abandoned` was set by a timed out waiter.
    pub fn run(&self, input: &[u8], abandoned: &AtomicBool) -> JobResult {
        let mut instance = self.acquire()?;
        let result = instance.call(RUN_EXPORT, input);

        match &result {
            Err(err) if err.discards_instance() => {
                debug!(job_type = %self.job_type, error = %err, "Discarding instance");
            }
            _ if abandoned.load(Ordering::Acquire) => {
                debug!(job_type = %self.job_type, "Discarding instance of timed out job");
            }
            _ => self.release(instance),
        }

        result
    }

    /// Pool and compilation counters for this worker.
    pub fn metrics(&self) -> WorkerMetrics {
        let module = self.builder.module_ref();
        WorkerMetrics {
            job_type: self.job_type.clone(),
            module: module.name().to_string(),
            version: module.version().to_string(),
            backend: self.builder.backend().to_string(),
            idle_instances: self.idle(),
            compilations: self.builder.compilations(),
        }
    }

    fn acquire(&self) -> Result<Box<dyn RuntimeInstance>, RuntimeError> {
        let pooled = self.pool.lock().pop();
        match pooled {
            Some(instance) => Ok(instance),
            None => self.builder.build(),
        }
    }

    fn release(&self, instance: Box<dyn RuntimeInstance>) {
        let mut pool = self.pool.lock();
        if pool.len() < self.options.pool_size {
            pool.push(instance);
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("job_type", &self.job_type)
            .field("module", self.builder.module_ref())
            .field("idle", &self.idle())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Snapshot of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerMetrics {
    /// Registered job type.
    pub job_type: String,
    /// Module name.
    pub module: String,
    /// Module version.
    pub version: String,
    /// Backend that compiled the module.
    pub backend: String,
    /// Idle instances ready for reuse.
    pub idle_instances: usize,
    /// Times the module was compiled (0 or 1).
    pub compilations: usize,
}

/// Snapshot of the scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerMetrics {
    /// Jobs handed to the scheduler.
    pub submitted: u64,
    /// Jobs waiting for their result.
    pub in_flight: u64,
    /// Jobs resolved with output.
    pub completed: u64,
    /// Jobs resolved with an error, timeouts included.
    pub failed: u64,
    /// Jobs resolved by their timeout.
    pub timed_out: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    in_flight: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl Counters {
    fn finish(&self, result: &JobResult) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        match result {
            Ok(_) => self.completed.fetch_add(1, Ordering::Relaxed),
            Err(RuntimeError::ExecutionTimeout { .. }) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                self.failed.fetch_add(1, Ordering::Relaxed)
            }
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Runs jobs against workers on the Tokio blocking pool.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    counters: Arc<Counters>,
}

impl Scheduler {
    /// Create a scheduler with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` on `worker`, returning the handle its result arrives on.
    ///
    /// Must be called from within a Tokio runtime; otherwise the handle
    /// resolves immediately with [`RuntimeError::InvalidConfig`].
    pub fn submit(&self, worker: Arc<Worker>, job: Job) -> JobHandle {
        let (mut resolver, handle) = job::channel(job.id);

        let Ok(runtime) = Handle::try_current() else {
            resolver.resolve(Err(RuntimeError::invalid_config(
                "jobs must be submitted from within a Tokio runtime",
            )));
            return handle;
        };

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);

        let counters = Arc::clone(&self.counters);
        let span = info_span!("job", job_id = %job.id, job_type = %job.job_type);

        runtime.spawn(
            async move {
                let timeout = worker.options().timeout;
                let abandoned = Arc::new(AtomicBool::new(false));

                let task = {
                    let abandoned = Arc::clone(&abandoned);
                    let span = Span::current();
                    tokio::task::spawn_blocking(move || {
                        span.in_scope(|| worker.run(&job.payload, &abandoned))
                    })
                };

                let result = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, task).await {
                        Ok(joined) => flatten(joined),
                        Err(_) => {
                            abandoned.store(true, Ordering::Release);
                            let duration_ms =
                                u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                            warn!(timeout_ms = duration_ms, "Job timed out");
                            Err(RuntimeError::ExecutionTimeout { duration_ms })
                        }
                    },
                    None => flatten(task.await),
                };

                match &result {
                    Ok(output) => debug!(output_len = output.len(), "Job completed"),
                    Err(err) => debug!(error = %err, "Job failed"),
                }

                counters.finish(&result);
                if !resolver.resolve(result) {
                    debug!("Job result abandoned by caller");
                }
            }
            .instrument(span),
        );

        handle
    }

    /// Current counter values.
    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }
}

fn flatten(joined: Result<JobResult, JoinError>) -> JobResult {
    joined.unwrap_or_else(|err| Err(RuntimeError::trap(format!("job task failed: {err}"))))
}

/// A recurring job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    job_type: String,
    interval: Duration,
    payload: Vec<u8>,
    times: Option<u64>,
}

impl Schedule {
    /// Run `job_type` every `interval`, starting one interval from now.
    ///
    /// Intervals shorter than a millisecond are rounded up to one.
    pub fn every(job_type: impl Into<String>, interval: Duration) -> Self {
        Self {
            job_type: job_type.into(),
            interval: interval.max(Duration::from_millis(1)),
            payload: Vec::new(),
            times: None,
        }
    }

    /// Payload passed to every run.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Stop after `times` runs.
    #[must_use]
    pub fn times(mut self, times: u64) -> Self {
        self.times = Some(times);
        self
    }

    /// Job type to run.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Time between runs.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Payload for each run.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Run limit, if any.
    pub fn limit(&self) -> Option<u64> {
        self.times
    }
}

/// Handle to an installed [`Schedule`].
#[derive(Debug)]
pub struct ScheduleHandle {
    task: JoinHandle<()>,
}

impl ScheduleHandle {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Stop scheduling further runs. A run already in progress completes.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Returns `true` once the schedule has run its course or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
