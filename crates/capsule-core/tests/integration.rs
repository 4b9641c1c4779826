//! Integration tests for capsule-core.
//!
//! These tests drive real modules (WAT compiled with the `wat` crate) through
//! the whole pipeline:
//! - Builder compile-once and entry conventions
//! - The capability gate as seen from a guest
//! - Engine registration, hot swap and fault isolation
//! - Executor results and bus notifications

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use capsule_common::{
    Capability, CapabilityConfig, ExecutorError, RunErr, RuntimeConfig, RuntimeError,
};
use capsule_core::{
    Backend, Bus, Engine, Executor, HostApi, HostFn, Job, LocalBus, Message, ModuleRef,
    RegisterOptions, MSG_TYPE_RESULT, MSG_TYPE_RUN_ERR, RUN_EXPORT,
};

// ============================================================================
// Fixtures
// ============================================================================

/// Prefixes the input with "hello ".
const HELLO: &str = r#"
    (module
        (import "env" "return_result" (func $return_result (param i32 i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 1018) "hello ")
        (func (export "allocate") (param i32) (result i32) (i32.const 1024))
        (func (export "run_e") (param $ptr i32) (param $len i32)
            (drop (call $return_result
                (i32.sub (local.get $ptr) (i32.const 6))
                (i32.add (local.get $len) (i32.const 6))))))
"#;

/// Always fails with 401.
const UNAUTHORIZED: &str = r#"
    (module
        (import "env" "return_error" (func $return_error (param i32 i32 i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 0) "don't go there")
        (func (export "allocate") (param i32) (result i32) (i32.const 1024))
        (func (export "run_e") (param i32 i32)
            (drop (call $return_error (i32.const 401) (i32.const 0) (i32.const 14)))))
"#;

/// Traps on every call.
const PANIC: &str = r#"
    (module
        (memory (export "memory") 1)
        (func (export "allocate") (param i32) (result i32) (i32.const 1024))
        (func (export "run_e") (param i32 i32) unreachable))
"#;

/// Reports whether `_start` ran before the first call.
const STARTED: &str = r#"
    (module
        (import "env" "return_result" (func $return_result (param i32 i32) (result i32)))
        (memory (export "memory") 1)
        (global $ready (mut i32) (i32.const 0))
        (data (i32.const 0) "readycold")
        (func (export "_start") (global.set $ready (i32.const 1)))
        (func (export "run_e")
            (if (global.get $ready)
                (then (drop (call $return_result (i32.const 0) (i32.const 5))))
                (else (drop (call $return_result (i32.const 5) (i32.const 4)))))))
"#;

/// `_start` traps.
const BROKEN_START: &str = r#"
    (module
        (func (export "_start") unreachable)
        (func (export "run_e")))
"#;

/// Calls the `counted` host function and returns whatever it left behind.
const COUNTED: &str = r#"
    (module
        (import "env" "counted" (func $counted (param i32) (result i32)))
        (import "env" "get_ffi_result" (func $get_ffi_result (param i32) (result i32)))
        (import "env" "return_result" (func $return_result (param i32 i32) (result i32)))
        (memory (export "memory") 1)
        (func (export "run_e")
            (local $n i32)
            (local.set $n (call $counted (i32.const 7)))
            (if (i32.lt_s (local.get $n) (i32.const 0))
                (then (local.set $n (i32.sub (i32.const 0) (local.get $n)))))
            (drop (call $get_ffi_result (i32.const 0)))
            (drop (call $return_result (i32.const 0) (local.get $n)))))
"#;

/// Spins forever.
const SPIN: &str = r#"
    (module
        (func (export "run_e") (loop $l (br $l))))
"#;

/// Imports a function nobody provides.
const UNRESOLVED: &str = r#"
    (module
        (import "env" "does_not_exist" (func (param i32) (result i32)))
        (func (export "run_e")))
"#;

fn module(name: &str, src: &str) -> ModuleRef {
    ModuleRef::new(name, "1.0.0", wat::parse_str(src).unwrap())
}

fn engine_with(config: &RuntimeConfig, api: HostApi) -> Engine {
    Engine::from_config(config, api).unwrap()
}

fn engine() -> Engine {
    engine_with(&RuntimeConfig::default(), HostApi::new(CapabilityConfig::none()))
}

fn backend() -> Backend {
    let config = RuntimeConfig::default();
    Backend::new(&config.engine, &config.execution).unwrap()
}

/// A `counted` host function gated on HTTP that counts how often its body runs.
fn counted(calls: Arc<AtomicUsize>) -> HostFn {
    HostFn::new("counted", 1, Capability::Http, move |call, args| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(call.ctx.set_ffi_result(format!("counted {}", args[0]).into_bytes()))
    })
}

// ============================================================================
// Test: Builder and entry protocol
// ============================================================================

#[test]
fn test_builder_compiles_once() {
    let builder = backend().builder(module("hello", HELLO), HostApi::default());

    for _ in 0..5 {
        let mut instance = builder.build().unwrap();
        assert_eq!(instance.call(RUN_EXPORT, b"you").unwrap(), b"hello you");
    }

    assert_eq!(builder.compilations(), 1);
}

#[test]
fn test_builder_compiles_once_under_concurrency() {
    let builder = backend().builder(module("hello", HELLO), HostApi::default());

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let builder = Arc::clone(&builder);
            std::thread::spawn(move || builder.build().map(|_| ()))
        })
        .collect();

    for thread in threads {
        thread.join().unwrap().unwrap();
    }

    assert_eq!(builder.compilations(), 1);
}

#[test]
fn test_link_failure_is_cached() {
    let builder = backend().builder(module("unresolved", UNRESOLVED), HostApi::default());

    for _ in 0..3 {
        let err = builder.build().map(|_| ()).unwrap_err();
        assert!(matches!(err, RuntimeError::LinkFailed { .. }), "got {err:?}");
    }

    assert_eq!(builder.compilations(), 1);
}

#[test]
fn test_module_without_start_instantiates() {
    let builder = backend().builder(module("hello", HELLO), HostApi::default());
    assert!(builder.build().is_ok());
}

#[test]
fn test_start_runs_before_first_call() {
    let builder = backend().builder(module("started", STARTED), HostApi::default());
    let mut instance = builder.build().unwrap();

    assert_eq!(instance.call(RUN_EXPORT, b"").unwrap(), b"ready");
}

#[test]
fn test_failing_start_is_init_failed() {
    let builder = backend().builder(module("broken", BROKEN_START), HostApi::default());

    match builder.build().map(|_| ()) {
        Err(RuntimeError::InitFailed { export, .. }) => assert_eq!(export, "_start"),
        other => panic!("expected InitFailed, got {other:?}"),
    }
}

#[test]
fn test_missing_export() {
    let builder = backend().builder(module("hello", HELLO), HostApi::default());
    let mut instance = builder.build().unwrap();

    let err = instance.call("nope", b"").unwrap_err();
    assert!(err.is_export_not_found());
}

#[test]
fn test_invalid_abi() {
    let builder = backend().builder(module("hello", HELLO), HostApi::default());
    let mut instance = builder.build().unwrap();

    // allocate takes one parameter
    let err = instance.call("allocate", b"").unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidAbi { .. }));
}

// ============================================================================
// Test: Capability gate
// ============================================================================

#[test]
fn test_disabled_capability_returns_canonical_payload() {
    let calls = Arc::new(AtomicUsize::new(0));
    let api = HostApi::new(CapabilityConfig::none()).with_function(counted(Arc::clone(&calls)));
    let builder = backend().builder(module("counted", COUNTED), api);

    let mut instance = builder.build().unwrap();
    let output = instance.call(RUN_EXPORT, b"").unwrap();

    assert_eq!(output, br#"{"code":1,"message":"capability is not enabled"}"#);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_enabled_capability_runs_body() {
    let calls = Arc::new(AtomicUsize::new(0));
    let capabilities = CapabilityConfig::none().with(Capability::Http, true);
    let api = HostApi::new(capabilities).with_function(counted(Arc::clone(&calls)));
    let builder = backend().builder(module("counted", COUNTED), api);

    let mut instance = builder.build().unwrap();
    assert_eq!(instance.call(RUN_EXPORT, b"").unwrap(), b"counted 7");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Test: Engine
// ============================================================================

#[tokio::test]
async fn test_hello() {
    let engine = engine();
    engine
        .register("hello", module("hello", HELLO), RegisterOptions::default())
        .unwrap();

    let output = engine
        .execute(Job::new("hello", b"my friend".to_vec()))
        .then()
        .await
        .unwrap();
    assert_eq!(output, b"hello my friend");
}

#[tokio::test]
async fn test_guest_error() {
    let engine = engine();
    engine
        .register("unauthorized", module("unauthorized", UNAUTHORIZED), RegisterOptions::default())
        .unwrap();

    let result = engine
        .execute(Job::new("unauthorized", b"x".to_vec()))
        .then()
        .await;
    match result {
        Err(RuntimeError::Run(err)) => assert_eq!(err, RunErr::new(401, "don't go there")),
        other => panic!("expected a guest error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fault_does_not_take_down_engine() {
    let engine = engine();
    engine
        .register("panic", module("panic", PANIC), RegisterOptions::default())
        .unwrap();
    engine
        .register("hello", module("hello", HELLO), RegisterOptions::default())
        .unwrap();

    for _ in 0..3 {
        let result = engine.execute(Job::new("panic", b"x".to_vec())).then().await;
        assert!(matches!(result, Err(RuntimeError::Trap { .. })));
    }

    let output = engine
        .execute(Job::new("hello", b"again".to_vec()))
        .then()
        .await
        .unwrap();
    assert_eq!(output, b"hello again");
}

#[tokio::test]
async fn test_fuel_exhaustion() {
    let mut config = RuntimeConfig::default();
    config.execution.max_fuel = 10_000;
    let engine = engine_with(&config, HostApi::default());
    engine
        .register("spin", module("spin", SPIN), RegisterOptions::default())
        .unwrap();

    let result = engine.execute(Job::new("spin", b"".to_vec())).then().await;
    assert!(matches!(result, Err(RuntimeError::FuelExhausted)), "got {result:?}");
    assert_eq!(engine.metrics().workers[0].idle_instances, 0);
}

#[tokio::test]
async fn test_reregistering_replaces_behavior() {
    let engine = engine();
    engine
        .register("svc", module("hello", HELLO), RegisterOptions::default())
        .unwrap();
    assert_eq!(
        engine.execute(Job::new("svc", b"a".to_vec())).then().await.unwrap(),
        b"hello a"
    );

    engine
        .register("svc", module("unauthorized", UNAUTHORIZED), RegisterOptions::default())
        .unwrap();
    let result = engine.execute(Job::new("svc", b"a".to_vec())).then().await;
    assert!(matches!(result, Err(RuntimeError::Run(_))));
}

#[tokio::test]
async fn test_concurrent_jobs() {
    let engine = engine();
    engine
        .register("hello", module("hello", HELLO), RegisterOptions::default())
        .unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| engine.execute(Job::new("hello", format!("#{i}").into_bytes())))
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.then().await.unwrap(), format!("hello #{i}").into_bytes());
    }

    let metrics = engine.metrics();
    assert_eq!(metrics.jobs.completed, 16);
    assert_eq!(metrics.workers[0].compilations, 1);
}

// ============================================================================
// Test: Executor
// ============================================================================

async fn next(rx: &mut tokio::sync::broadcast::Receiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("bus message")
        .unwrap()
}

#[tokio::test]
async fn test_executor_emits_started_and_result() {
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
    let mut rx = bus.subscribe();

    let mut executor = Executor::new(engine());
    executor.use_bus(Arc::clone(&bus));
    executor
        .register("hello", module("hello", HELLO), RegisterOptions::default())
        .unwrap();

    let output = executor
        .do_job("hello", "req-1", b"my friend".to_vec())
        .await
        .unwrap();
    assert_eq!(output, b"hello my friend");

    let started = next(&mut rx).await;
    assert_eq!(started.subject, "local/hello");
    assert_eq!(started.parent_id.as_deref(), Some("req-1"));

    let result = next(&mut rx).await;
    assert_eq!(result.subject, MSG_TYPE_RESULT);
    assert_eq!(result.parent_id.as_deref(), Some("req-1"));
    assert_eq!(result.payload, b"hello my friend");
}

#[tokio::test]
async fn test_executor_emits_run_err() {
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
    let mut rx = bus.subscribe();

    let mut executor = Executor::new(engine());
    executor.use_bus(Arc::clone(&bus));
    executor
        .register("unauthorized", module("unauthorized", UNAUTHORIZED), RegisterOptions::default())
        .unwrap();

    let err = executor
        .do_job("unauthorized", "req-2", b"x".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Runtime(RuntimeError::Run(_))));

    assert_eq!(next(&mut rx).await.subject, "local/unauthorized");
    let failed = next(&mut rx).await;
    assert_eq!(failed.subject, MSG_TYPE_RUN_ERR);
    assert_eq!(failed.payload, br#"{"code":401,"message":"don't go there"}"#);
}

#[tokio::test]
async fn test_executor_cannot_handle_emits_nothing() {
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
    let mut rx = bus.subscribe();

    let mut executor = Executor::new(engine());
    executor.use_bus(Arc::clone(&bus));
    executor
        .register("hello", module("hello", HELLO), RegisterOptions::default())
        .unwrap();

    let err = executor
        .do_job("unknown", "req-3", b"x".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::CannotHandle { ref job_type } if job_type == "unknown"));

    // The first message on the bus belongs to the next job.
    executor.do_job("hello", "req-4", b"x".to_vec()).await.unwrap();
    let first = next(&mut rx).await;
    assert_eq!(first.subject, "local/hello");
    assert_eq!(first.parent_id.as_deref(), Some("req-4"));
}

// ============================================================================
// Test: Interpreter backend
// ============================================================================

#[cfg(feature = "wasmi")]
mod wasmi_backend {
    use capsule_common::BackendKind;

    use super::*;

    fn wasmi_engine(api: HostApi) -> Engine {
        let mut config = RuntimeConfig::default();
        config.engine.backend = BackendKind::Wasmi;
        engine_with(&config, api)
    }

    #[tokio::test]
    async fn test_hello_on_wasmi() {
        let engine = wasmi_engine(HostApi::default());
        engine
            .register("hello", module("hello", HELLO), RegisterOptions::default())
            .unwrap();

        let output = engine
            .execute(Job::new("hello", b"my friend".to_vec()))
            .then()
            .await
            .unwrap();
        assert_eq!(output, b"hello my friend");
    }

    #[tokio::test]
    async fn test_gate_on_wasmi() {
        let calls = Arc::new(AtomicUsize::new(0));
        let api = HostApi::new(CapabilityConfig::none()).with_function(counted(Arc::clone(&calls)));
        let engine = wasmi_engine(api);
        engine
            .register("counted", module("counted", COUNTED), RegisterOptions::default())
            .unwrap();

        let output = engine
            .execute(Job::new("counted", b"".to_vec()))
            .then()
            .await
            .unwrap();
        assert_eq!(output, br#"{"code":1,"message":"capability is not enabled"}"#);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
