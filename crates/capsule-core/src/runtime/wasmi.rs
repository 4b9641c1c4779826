//! wasmi backend.
//!
//! An interpreter for hosts where a JIT is unavailable or undesirable. Only
//! the host functions of the [`HostApi`] are linked (no WASI), and both `_start`
//! and the deprecated `init` export are honored after instantiation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use ::wasmi::core::TrapCode;
use ::wasmi::{
    Config, Engine, Extern, FuncType, Instance, Linker, Module, Store, StoreLimits,
    StoreLimitsBuilder, Val, ValType,
};
use tracing::{debug, info, instrument, warn};

use capsule_common::{BackendKind, EngineConfig, ExecutionConfig, RuntimeError};

use super::{
    ALLOCATE_EXPORT, BuildFailure, EntryConvention, HostApi, HostCall, IMPORT_MODULE,
    MEMORY_EXPORT, RuntimeBuilder, RuntimeInstance, run_entrypoints,
};
use crate::ModuleRef;
use crate::store::InstanceContext;

/// Entry conventions attempted after instantiation, in order.
const ENTRY_CONVENTIONS: &[EntryConvention] = &[EntryConvention::Start, EntryConvention::Init];

/// Shared, configured wasmi engine.
#[derive(Clone)]
pub struct WasmiEngine {
    engine: Engine,
    execution: ExecutionConfig,
}

impl WasmiEngine {
    /// Create a new engine. Pooling options do not apply to the interpreter.
    pub fn new(config: &EngineConfig, execution: &ExecutionConfig) -> Result<Self, RuntimeError> {
        if config.pooling_allocator {
            warn!("Pooling allocator is not supported by the wasmi backend, ignoring");
        }

        let mut wasmi_config = Config::default();
        wasmi_config.consume_fuel(execution.fuel_metering);

        info!(
            fuel_metering = execution.fuel_metering,
            "wasmi engine initialized"
        );

        Ok(Self {
            engine: Engine::new(&wasmi_config),
            execution: execution.clone(),
        })
    }

    /// Get a reference to the inner wasmi engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }
}

impl std::fmt::Debug for WasmiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmiEngine")
            .field("fuel_metering", &self.execution.fuel_metering)
            .finish_non_exhaustive()
    }
}

struct WasmiState {
    ctx: InstanceContext,
    limits: StoreLimits,
}

struct Compiled {
    module: Module,
    linker: Linker<WasmiState>,
}

/// Builder for one module on the wasmi backend.
pub struct WasmiBuilder {
    engine: WasmiEngine,
    module_ref: ModuleRef,
    api: HostApi,
    compiled: OnceLock<Result<Arc<Compiled>, BuildFailure>>,
    compilations: AtomicUsize,
}

impl WasmiBuilder {
    /// Create a builder. Nothing is compiled until the first [`build`](RuntimeBuilder::build).
    pub fn new(engine: WasmiEngine, module_ref: ModuleRef, api: HostApi) -> Self {
        Self {
            engine,
            module_ref,
            api,
            compiled: OnceLock::new(),
            compilations: AtomicUsize::new(0),
        }
    }

    fn compiled(&self) -> Result<Arc<Compiled>, RuntimeError> {
        self.compiled
            .get_or_init(|| self.compile())
            .as_ref()
            .map(Arc::clone)
            .map_err(BuildFailure::to_error)
    }

    #[instrument(
        skip(self),
        fields(module = %self.module_ref.name(), version = %self.module_ref.version())
    )]
    fn compile(&self) -> Result<Arc<Compiled>, BuildFailure> {
        self.compilations.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();

        self.module_ref.validate_header()?;

        let engine = self.engine.inner();
        let module = Module::new(engine, self.module_ref.bytes())
            .map_err(|e| BuildFailure::Compile(e.to_string()))?;

        // The interpreter only resolves imports at instantiation; check them
        // now so a bad module fails once, at build time.
        for import in module.imports() {
            if import.module() != IMPORT_MODULE || self.api.get(import.name()).is_none() {
                return Err(BuildFailure::Link(format!(
                    "unknown import `{}::{}`",
                    import.module(),
                    import.name()
                )));
            }
        }

        let mut linker: Linker<WasmiState> = Linker::new(engine);
        for host_fn in self.api.functions() {
            let name = host_fn.name().to_string();
            let ty = FuncType::new(
                std::iter::repeat(ValType::I32).take(host_fn.arg_count()),
                [ValType::I32],
            );
            let host_fn = host_fn.clone();

            linker
                .func_new(IMPORT_MODULE, &name, ty, move |mut caller, params, results| {
                    let args: Vec<i32> =
                        params.iter().map(|v| v.i32().unwrap_or_default()).collect();
                    let memory = caller
                        .get_export(MEMORY_EXPORT)
                        .and_then(Extern::into_memory);

                    let ret = if let Some(memory) = memory {
                        let (data, state) = memory.data_and_store_mut(&mut caller);
                        host_fn.invoke(&mut HostCall::new(data, &mut state.ctx), &args)
                    } else {
                        let ctx = &mut caller.data_mut().ctx;
                        host_fn.invoke(&mut HostCall::new(&mut [], ctx), &args)
                    };

                    results[0] = Val::I32(ret);
                    Ok(())
                })
                .map_err(|e| BuildFailure::Link(format!("Failed to define `{name}`: {e}")))?;
        }

        info!(
            content_hash = %self.module_ref.content_hash(),
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        Ok(Arc::new(Compiled { module, linker }))
    }
}

impl RuntimeBuilder for WasmiBuilder {
    fn build(&self) -> Result<Box<dyn RuntimeInstance>, RuntimeError> {
        let compiled = self.compiled()?;
        let execution = &self.engine.execution;

        let state = WasmiState {
            ctx: self.api.new_context(),
            limits: StoreLimitsBuilder::new()
                .memory_size(execution.max_memory_bytes())
                .build(),
        };

        let mut store = Store::new(self.engine.inner(), state);
        store.limiter(|state| &mut state.limits);

        let mut instance = WasmiInstance {
            store,
            instance: None,
            fuel: execution.fuel_metering.then_some(execution.max_fuel),
        };

        instance.refuel()?;
        let inner = compiled
            .linker
            .instantiate(&mut instance.store, &compiled.module)
            .and_then(|pre| pre.start(&mut instance.store))
            .map_err(|e| RuntimeError::init_failed("instantiate", classify(&e)))?;
        instance.instance = Some(inner);

        run_entrypoints(ENTRY_CONVENTIONS, |export| instance.call_entry(export))?;

        debug!(module = %self.module_ref.name(), "Instance ready");
        Ok(Box::new(instance))
    }

    fn module_ref(&self) -> &ModuleRef {
        &self.module_ref
    }

    fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Wasmi
    }
}

impl std::fmt::Debug for WasmiBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmiBuilder")
            .field("module_ref", &self.module_ref)
            .field("compilations", &self.compilations())
            .finish_non_exhaustive()
    }
}

struct WasmiInstance {
    store: Store<WasmiState>,
    instance: Option<Instance>,
    fuel: Option<u64>,
}

impl WasmiInstance {
    fn instance(&self) -> Result<Instance, RuntimeError> {
        self.instance
            .ok_or_else(|| RuntimeError::invalid_config("instance used before instantiation"))
    }

    fn refuel(&mut self) -> Result<(), RuntimeError> {
        if let Some(fuel) = self.fuel {
            self.store
                .set_fuel(fuel)
                .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
        }
        Ok(())
    }

    fn fuel_consumed(&self) -> u64 {
        let remaining = self.store.get_fuel().unwrap_or(0);
        self.fuel.unwrap_or(0).saturating_sub(remaining)
    }

    fn call_entry(&mut self, export: &str) -> Result<(), RuntimeError> {
        let instance = self.instance()?;
        let func = instance
            .get_func(&self.store, export)
            .ok_or_else(|| RuntimeError::export_not_found(export))?;
        let func = func.typed::<(), ()>(&self.store).map_err(|e| {
            RuntimeError::invalid_abi(format!("`{export}` must take no arguments: {e}"))
        })?;

        self.refuel()?;
        func.call(&mut self.store, ()).map_err(|e| classify(&e))
    }

    fn write_input(
        &mut self,
        instance: Instance,
        input: &[u8],
    ) -> Result<(i32, i32), RuntimeError> {
        let len = i32::try_from(input.len())
            .map_err(|_| RuntimeError::invalid_abi("input larger than guest address space"))?;

        let allocate = instance
            .get_typed_func::<i32, i32>(&self.store, ALLOCATE_EXPORT)
            .map_err(|e| {
                RuntimeError::invalid_abi(format!(
                    "module must export `{ALLOCATE_EXPORT}(i32) -> i32`: {e}"
                ))
            })?;
        let ptr = allocate
            .call(&mut self.store, len)
            .map_err(|e| classify(&e))?;

        let memory = instance
            .get_memory(&self.store, MEMORY_EXPORT)
            .ok_or_else(|| RuntimeError::invalid_abi("module does not export memory"))?;
        let offset = usize::try_from(ptr)
            .map_err(|_| RuntimeError::invalid_abi("allocator returned a negative pointer"))?;
        memory.write(&mut self.store, offset, input).map_err(|e| {
            RuntimeError::invalid_abi(format!("allocator returned an invalid pointer: {e}"))
        })?;

        Ok((ptr, len))
    }
}

impl RuntimeInstance for WasmiInstance {
    fn call(&mut self, export: &str, input: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        let instance = self.instance()?;
        let func = instance
            .get_func(&self.store, export)
            .ok_or_else(|| RuntimeError::export_not_found(export))?;
        let ty = func.ty(&self.store);

        self.store.data_mut().ctx.begin_call();
        self.refuel()?;

        let params = match ty.params() {
            [] => Vec::new(),
            [ValType::I32, ValType::I32] => {
                let (ptr, len) = self.write_input(instance, input)?;
                vec![Val::I32(ptr), Val::I32(len)]
            }
            _ => {
                return Err(RuntimeError::invalid_abi(format!(
                    "`{export}` must take () or (i32, i32)"
                )));
            }
        };
        let mut results = vec![Val::I32(0); ty.results().len()];

        let result = func.call(&mut self.store, &params, &mut results);
        let fuel_consumed = self.fuel_consumed();
        let outcome = self.store.data_mut().ctx.finish_call(fuel_consumed);

        match result {
            Ok(()) => {
                debug!(export, fuel_consumed, "Call completed");
                outcome.map_err(RuntimeError::Run)
            }
            Err(e) => {
                let err = classify(&e);
                warn!(export, fuel_consumed, error = %err, "Call failed");
                Err(err)
            }
        }
    }
}

fn classify(error: &::wasmi::Error) -> RuntimeError {
    match error.as_trap_code() {
        Some(TrapCode::OutOfFuel) => RuntimeError::FuelExhausted,
        _ => RuntimeError::trap(error.to_string()),
    }
}
