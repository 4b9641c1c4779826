//! Uniform job execution facade.
//!
//! Callers hand the [`Executor`] a job type and payload and get output bytes
//! or a typed error back, regardless of where the job runs. Today every job
//! runs on the local [`Engine`]; job types the engine does not know are
//! reported as [`ExecutorError::CannotHandle`], the point where dispatch to
//! remote peers plugs in.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use capsule_common::ExecutorError;

use crate::bus::{local_subject, Bus, BusEmitter, Message, MSG_TYPE_RESULT, MSG_TYPE_RUN_ERR};
use crate::engine::{Engine, EngineMetrics};
use crate::job::{Job, JobResult};
use crate::scheduler::{RegisterOptions, Schedule, ScheduleHandle};
use crate::ModuleRef;

/// Facade over an optional [`Engine`] and an optional bus.
#[derive(Debug, Default)]
pub struct Executor {
    engine: Option<Engine>,
    emitter: Option<BusEmitter>,
}

impl Executor {
    /// Create an executor running jobs on `engine`.
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Some(engine),
            emitter: None,
        }
    }

    /// Create an executor with no engine; every job fails with
    /// [`ExecutorError::NotConfigured`].
    pub fn unconfigured() -> Self {
        Self::default()
    }

    /// Report job progress on `bus`. Must be called from within a Tokio runtime.
    pub fn use_bus(&mut self, bus: Arc<dyn Bus>) {
        self.emitter = Some(BusEmitter::spawn(bus, BusEmitter::DEFAULT_CAPACITY));
    }

    /// The engine, if configured.
    pub fn engine(&self) -> Option<&Engine> {
        self.engine.as_ref()
    }

    /// Run a job and wait for its output.
    ///
    /// With a bus attached, emits `local/<job_type>` when the job starts and
    /// then either the output under [`MSG_TYPE_RESULT`] or the error text
    /// under [`MSG_TYPE_RUN_ERR`], all with `request_id` as parent. Nothing is
    /// emitted for jobs that are rejected before they start.
    ///
    /// Only the local engine is consulted; a job type it does not know is
    /// [`ExecutorError::CannotHandle`] even when a connected peer could run it.
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn do_job(
        &self,
        job_type: &str,
        request_id: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, ExecutorError> {
        let engine = self.require_engine()?;

        if !engine.is_registered(job_type) {
            debug!("Job type not registered locally");
            return Err(ExecutorError::CannotHandle {
                job_type: job_type.to_string(),
            });
        }

        let handle = engine.execute(Job::new(job_type, payload));
        self.emit(
            Message::new(local_subject(job_type), Vec::<u8>::new()).with_parent(request_id),
        );

        match handle.then().await {
            Ok(output) => {
                self.emit(Message::new(MSG_TYPE_RESULT, output.clone()).with_parent(request_id));
                Ok(output)
            }
            Err(err) => {
                self.emit(
                    Message::new(MSG_TYPE_RUN_ERR, err.to_string().into_bytes())
                        .with_parent(request_id),
                );
                Err(err.into())
            }
        }
    }

    /// Register a module. See [`Engine::register`].
    pub fn register(
        &self,
        job_type: &str,
        module_ref: ModuleRef,
        options: RegisterOptions,
    ) -> Result<(), ExecutorError> {
        Ok(self.require_engine()?.register(job_type, module_ref, options)?)
    }

    /// Register a module from disk. See [`Engine::register_from_file`].
    pub fn register_from_file(
        &self,
        job_type: &str,
        path: impl AsRef<Path>,
        options: RegisterOptions,
    ) -> Result<(), ExecutorError> {
        Ok(self.require_engine()?.register_from_file(job_type, path, options)?)
    }

    /// See [`Engine::listen_and_run`].
    pub fn listen_and_run<F>(
        &self,
        bus: &Arc<dyn Bus>,
        msg_type: impl Into<String>,
        callback: F,
    ) -> Result<JoinHandle<()>, ExecutorError>
    where
        F: Fn(Message, JobResult) + Send + Sync + 'static,
    {
        Ok(self.require_engine()?.listen_and_run(bus, msg_type, callback)?)
    }

    /// Install a recurring job. See [`Engine::schedule`].
    pub fn set_schedule(&self, schedule: Schedule) -> Result<ScheduleHandle, ExecutorError> {
        Ok(self.require_engine()?.schedule(schedule)?)
    }

    /// Engine activity counters.
    pub fn metrics(&self) -> Result<EngineMetrics, ExecutorError> {
        Ok(self.require_engine()?.metrics())
    }

    fn require_engine(&self) -> Result<&Engine, ExecutorError> {
        self.engine.as_ref().ok_or(ExecutorError::NotConfigured)
    }

    fn emit(&self, message: Message) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::broadcast;

    use capsule_common::{BusError, CapabilityConfig, RunErr, RuntimeConfig, RuntimeError};

    use super::*;
    use crate::runtime::HostApi;

    const DONE: &str = r#"
        (module
            (import "env" "return_result" (func $ret (param i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "done")
            (func (export "run_e")
                (drop (call $ret (i32.const 0) (i32.const 4)))))
    "#;

    const TEAPOT: &str = r#"
        (module
            (import "env" "return_error" (func $err (param i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "short and stout")
            (func (export "run_e")
                (drop (call $err (i32.const 418) (i32.const 0) (i32.const 15)))))
    "#;

    fn engine() -> Engine {
        let engine = Engine::from_config(
            &RuntimeConfig::default(),
            HostApi::new(CapabilityConfig::none()),
        )
        .unwrap();
        for (job_type, src) in [("done", DONE), ("teapot", TEAPOT)] {
            let module_ref = ModuleRef::new(job_type, "1.0.0", wat::parse_str(src).unwrap());
            engine
                .register(job_type, module_ref, RegisterOptions::default())
                .unwrap();
        }
        engine
    }

    /// Forwards nothing while `gate` is held.
    #[derive(Default)]
    struct StalledBus {
        gate: Mutex<()>,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl Bus for StalledBus {
        fn send(&self, _message: Message) -> Result<(), BusError> {
            drop(self.gate.lock());
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<Message> {
            broadcast::channel(1).1
        }

        async fn connect_endpoint(&self, _endpoint: &str) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unconfigured() {
        let executor = Executor::unconfigured();

        let err = executor.do_job("hello", "req", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotConfigured));
        assert_eq!(err.to_string(), "executor not fully configured");

        assert!(matches!(executor.metrics(), Err(ExecutorError::NotConfigured)));
        let module_ref = ModuleRef::new("m", "1", vec![0_u8; 8]);
        assert!(matches!(
            executor.register("hello", module_ref, RegisterOptions::default()),
            Err(ExecutorError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_jobs_without_bus() {
        let executor = Executor::new(engine());

        let output = executor.do_job("done", "req", Vec::new()).await.unwrap();
        assert_eq!(output, b"done");

        let err = executor.do_job("teapot", "req", Vec::new()).await.unwrap_err();
        match err {
            ExecutorError::Runtime(RuntimeError::Run(run_err)) => {
                assert_eq!(run_err, RunErr::new(418, "short and stout"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = executor.do_job("missing", "req", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::CannotHandle { job_type } if job_type == "missing"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[allow(clippy::await_holding_lock)]
    async fn test_full_emitter_drops_messages_without_blocking_jobs() {
        let bus = Arc::new(StalledBus::default());
        let held = bus.gate.lock();

        let executor = Executor {
            engine: Some(engine()),
            emitter: Some(BusEmitter::spawn(Arc::clone(&bus) as Arc<dyn Bus>, 1)),
        };

        for _ in 0..5 {
            let output = tokio::time::timeout(
                Duration::from_secs(5),
                executor.do_job("done", "req", Vec::new()),
            )
            .await
            .expect("job blocked on a full bus queue")
            .unwrap();
            assert_eq!(output, b"done");
        }
        assert_eq!(bus.delivered.load(Ordering::SeqCst), 0);

        drop(held);
        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.delivered.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // At most the message in flight and the one queued behind it got through.
        assert!(bus.delivered.load(Ordering::SeqCst) <= 2);
    }
}
