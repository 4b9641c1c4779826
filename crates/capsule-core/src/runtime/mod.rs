//! Backend-neutral runtime abstraction.
//!
//! A [`RuntimeBuilder`] owns one module and turns it into ready-to-call
//! [`RuntimeInstance`]s. Each backend (wasmtime, wasmi) provides its own pair;
//! everything above this module only sees the traits.
//!
//! # Lifecycle
//!
//! ```text
//! Backend::builder(module_ref, host_api)     pure construction
//!        │
//!        ▼
//! RuntimeBuilder::build()                    compile + link once, then instantiate
//!        │                                   and run the entry conventions
//!        ▼
//! RuntimeInstance::call(export, input)       any number of times, one caller at a time
//! ```

pub mod abi;
pub mod host_fn;
#[cfg(feature = "wasmi")]
pub mod wasmi;
#[cfg(feature = "wasmtime")]
pub mod wasmtime;

use std::sync::Arc;

use tracing::{debug, info};

use capsule_common::{BackendKind, EngineConfig, ExecutionConfig, RuntimeError};

use crate::ModuleRef;

pub use abi::{ALLOCATE_EXPORT, IMPORT_MODULE, MEMORY_EXPORT, RUN_EXPORT};
pub use host_fn::{HostApi, HostCall, HostFn};

#[cfg(not(any(feature = "wasmtime", feature = "wasmi")))]
compile_error!("capsule-core needs at least one backend feature: `wasmtime` or `wasmi`");

/// Produces instances of one module.
///
/// Implementations compile lazily: the first [`build`](Self::build) compiles
/// and links, every later call reuses that artifact (or its failure).
pub trait RuntimeBuilder: Send + Sync {
    /// Instantiate the module and run its entry conventions.
    fn build(&self) -> Result<Box<dyn RuntimeInstance>, RuntimeError>;

    /// The module this builder owns.
    fn module_ref(&self) -> &ModuleRef;

    /// How many times compilation actually ran (0 or 1).
    fn compilations(&self) -> usize;

    /// Which backend produced this builder.
    fn backend(&self) -> BackendKind;
}

/// A live, initialized module instance.
///
/// Instances are used by one caller at a time; the scheduler guarantees
/// exclusivity by moving the box in and out of its pool.
pub trait RuntimeInstance: Send {
    /// Call an export with a byte buffer.
    ///
    /// - missing export: [`RuntimeError::ExportNotFound`]
    /// - `()` export: called with no arguments
    /// - `(i32, i32)` export: `input` is copied into memory obtained from the
    ///   guest's `allocate` export and passed as `(ptr, len)`
    /// - anything else: [`RuntimeError::InvalidAbi`]
    fn call(&mut self, export: &str, input: &[u8]) -> Result<Vec<u8>, RuntimeError>;
}

/// Initialization exports a backend attempts after instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryConvention {
    /// WASI-style `_start`.
    Start,
    /// Deprecated `init`.
    Init,
}

impl EntryConvention {
    /// Export name for this convention.
    pub fn export(self) -> &'static str {
        match self {
            EntryConvention::Start => "_start",
            EntryConvention::Init => "init",
        }
    }
}

/// Walk `conventions` in order against a freshly created instance.
///
/// `invoke` calls the named export with no arguments. A missing export is
/// skipped; any other failure is fatal for the instance.
pub(crate) fn run_entrypoints<F>(
    conventions: &[EntryConvention],
    mut invoke: F,
) -> Result<(), RuntimeError>
where
    F: FnMut(&str) -> Result<(), RuntimeError>,
{
    for convention in conventions {
        let export = convention.export();
        match invoke(export) {
            Ok(()) => debug!(export, "Entry convention ran"),
            Err(err) if err.is_export_not_found() => debug!(export, "Entry convention skipped"),
            Err(err) => return Err(RuntimeError::init_failed(export, err)),
        }
    }

    Ok(())
}

/// Cached outcome of a failed compile or link, replayed to every caller.
#[derive(Debug, Clone)]
pub(crate) enum BuildFailure {
    Compile(String),
    Link(String),
}

impl BuildFailure {
    pub(crate) fn to_error(&self) -> RuntimeError {
        match self {
            BuildFailure::Compile(reason) => RuntimeError::compilation_failed(reason.clone()),
            BuildFailure::Link(reason) => RuntimeError::link_failed(reason.clone()),
        }
    }
}

impl From<RuntimeError> for BuildFailure {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::LinkFailed { reason } => BuildFailure::Link(reason),
            RuntimeError::CompilationFailed { reason } => BuildFailure::Compile(reason),
            other => BuildFailure::Compile(other.to_string()),
        }
    }
}

/// A configured backend, the factory for [`RuntimeBuilder`]s.
///
/// Holds the backend's engine, which is shared by every module compiled
/// through it.
#[derive(Clone)]
pub enum Backend {
    /// Cranelift JIT.
    #[cfg(feature = "wasmtime")]
    Wasmtime(self::wasmtime::WasmtimeEngine),
    /// Interpreter.
    #[cfg(feature = "wasmi")]
    Wasmi(self::wasmi::WasmiEngine),
}

impl Backend {
    /// Create the backend selected by `engine.backend`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] if the backend was not compiled
    /// in, or if its engine rejects the configuration.
    pub fn new(engine: &EngineConfig, execution: &ExecutionConfig) -> Result<Self, RuntimeError> {
        let backend = match engine.backend {
            #[cfg(feature = "wasmtime")]
            BackendKind::Wasmtime => {
                Self::Wasmtime(self::wasmtime::WasmtimeEngine::new(engine, execution)?)
            }
            #[cfg(feature = "wasmi")]
            BackendKind::Wasmi => Self::Wasmi(self::wasmi::WasmiEngine::new(engine, execution)?),
            #[allow(unreachable_patterns)]
            other => {
                return Err(RuntimeError::invalid_config(format!(
                    "backend '{other}' is not compiled into this build"
                )));
            }
        };

        info!(backend = %backend.kind(), "Runtime backend initialized");
        Ok(backend)
    }

    /// Which backend this is.
    pub fn kind(&self) -> BackendKind {
        match self {
            #[cfg(feature = "wasmtime")]
            Self::Wasmtime(_) => BackendKind::Wasmtime,
            #[cfg(feature = "wasmi")]
            Self::Wasmi(_) => BackendKind::Wasmi,
        }
    }

    /// Create a builder for a module. Nothing is compiled until the first build.
    pub fn builder(&self, module_ref: ModuleRef, api: HostApi) -> Arc<dyn RuntimeBuilder> {
        match self {
            #[cfg(feature = "wasmtime")]
            Self::Wasmtime(engine) => Arc::new(self::wasmtime::WasmtimeBuilder::new(
                engine.clone(),
                module_ref,
                api,
            )),
            #[cfg(feature = "wasmi")]
            Self::Wasmi(engine) => Arc::new(self::wasmi::WasmiBuilder::new(
                engine.clone(),
                module_ref,
                api,
            )),
        }
    }

    /// Backends compiled into this build.
    pub fn available() -> Vec<BackendKind> {
        vec![
            #[cfg(feature = "wasmtime")]
            BackendKind::Wasmtime,
            #[cfg(feature = "wasmi")]
            BackendKind::Wasmi,
        ]
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}
