//! Core runtime for capsule.
//!
//! This crate turns precompiled WebAssembly modules into sandboxed functions:
//! - [`ModuleRef`]: An immutable module artifact
//! - [`RuntimeBuilder`] / [`RuntimeInstance`]: One contract over every backend
//! - [`HostApi`]: Host functions and the capability gate in front of them
//! - [`Engine`]: Job type registry, worker pools and scheduling
//! - [`Executor`]: The single call site for running a job
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Executor                          │
//! │  - do_job(job_type, request_id, payload)                │
//! │  - Bus notifications (local/<type>, result, runerr)     │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Engine                           │
//! │  (Shared, cheap to clone)                               │
//! │  - job_type → Worker { RuntimeBuilder, instance pool }  │
//! │  - Scheduler on the blocking thread pool                │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              RuntimeBuilder (per backend)               │
//! │  - Compiles and links once                              │
//! │  - Runs `_start` (and `init` where supported)           │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   RuntimeInstance                       │
//! │  (Exclusively owned per job)                            │
//! │  - Fuel metering                                        │
//! │  - Host calls through the capability gate               │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod engine;
pub mod executor;
pub mod job;
pub mod module_ref;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use bus::{
    connect_static_peers, Bus, BusEmitter, LocalBus, Message, RetryPolicy, MSG_TYPE_RESULT,
    MSG_TYPE_RUN_ERR,
};
pub use engine::{Engine, EngineMetrics};
pub use executor::Executor;
pub use job::{Job, JobHandle, JobResolver, JobResult};
pub use module_ref::ModuleRef;
pub use runtime::{
    Backend, EntryConvention, HostApi, HostCall, HostFn, RuntimeBuilder, RuntimeInstance,
    RUN_EXPORT,
};
pub use scheduler::{RegisterOptions, Schedule, ScheduleHandle, SchedulerMetrics, WorkerMetrics};
pub use store::{ExecutionMetrics, InstanceContext, LogEntry, LogLevel};
