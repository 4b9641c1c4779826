//! Wasmtime backend.
//!
//! The [`WasmtimeEngine`] is shared by every module compiled through it and is
//! configured once:
//! - **Fuel metering** for deterministic CPU limiting, refilled before each call
//! - **Pooling allocator** (optional) to pre-allocate instance memory
//! - **WASI preview1** linked next to the host functions so `_start`-style
//!   guests that write to stdout run unmodified
//!
//! Instances run `_start` after instantiation; the deprecated `init` export is
//! never attempted on this backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use ::wasmtime::{
    Config, Engine, Extern, FuncType, Instance, InstanceAllocationStrategy, InstancePre,
    Linker, Module, OptLevel, PoolingAllocationConfig, Store, StoreLimits, StoreLimitsBuilder,
    Trap, Val, ValType,
};
use tracing::{debug, info, instrument, warn};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use capsule_common::{BackendKind, EngineConfig, ExecutionConfig, RuntimeError};

use super::{
    ALLOCATE_EXPORT, BuildFailure, EntryConvention, HostApi, HostCall, IMPORT_MODULE,
    MEMORY_EXPORT, RuntimeBuilder, RuntimeInstance, run_entrypoints,
};
use crate::ModuleRef;
use crate::store::InstanceContext;

/// Entry conventions attempted after instantiation.
const ENTRY_CONVENTIONS: &[EntryConvention] = &[EntryConvention::Start];

/// Shared, configured Wasmtime engine.
#[derive(Clone)]
pub struct WasmtimeEngine {
    engine: Engine,
    config: EngineConfig,
    execution: ExecutionConfig,
}

impl WasmtimeEngine {
    /// Create a new engine.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    pub fn new(config: &EngineConfig, execution: &ExecutionConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.consume_fuel(execution.fuel_metering);
        wasmtime_config.cranelift_opt_level(OptLevel::Speed);

        if config.pooling_allocator {
            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config(config)));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            fuel_metering = execution.fuel_metering,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine,
            config: config.clone(),
            execution: execution.clone(),
        })
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmtimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("fuel_metering", &self.execution.fuel_metering)
            .finish_non_exhaustive()
    }
}

fn pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
    let mut pooling = PoolingAllocationConfig::default();

    pooling.total_component_instances(config.max_instances);
    pooling.total_core_instances(config.max_instances);
    pooling.total_memories(config.max_instances);
    pooling.total_tables(config.max_instances);

    let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
    pooling.max_memory_size(max_memory_bytes);

    pooling
}

/// Store data for a Wasmtime instance.
struct WasmtimeState {
    ctx: InstanceContext,
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// Compiled module plus its pre-linked instantiation template.
struct Compiled {
    pre: InstancePre<WasmtimeState>,
}

/// Builder for one module on the Wasmtime backend.
pub struct WasmtimeBuilder {
    engine: WasmtimeEngine,
    module_ref: ModuleRef,
    api: HostApi,
    compiled: OnceLock<Result<Arc<Compiled>, BuildFailure>>,
    compilations: AtomicUsize,
}

impl WasmtimeBuilder {
    /// Create a builder. Nothing is compiled until the first [`build`](RuntimeBuilder::build).
    pub fn new(engine: WasmtimeEngine, module_ref: ModuleRef, api: HostApi) -> Self {
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
            .map_err(|e| BuildFailure::Compile(format!("{e:#}")))?;

        let mut linker: Linker<WasmtimeState> = Linker::new(engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut WasmtimeState| &mut state.wasi)
            .map_err(|e| BuildFailure::Link(format!("Failed to link WASI: {e:#}")))?;

        for host_fn in self.api.functions() {
            let name = host_fn.name().to_string();
            let ty = FuncType::new(
                engine,
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
                .map_err(|e| BuildFailure::Link(format!("Failed to define `{name}`: {e:#}")))?;
        }

        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| BuildFailure::Link(format!("{e:#}")))?;

        info!(
            content_hash = %self.module_ref.content_hash(),
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        Ok(Arc::new(Compiled { pre }))
    }
}

impl RuntimeBuilder for WasmtimeBuilder {
    fn build(&self) -> Result<Box<dyn RuntimeInstance>, RuntimeError> {
        let compiled = self.compiled()?;
        let execution = &self.engine.execution;

        let state = WasmtimeState {
            ctx: self.api.new_context(),
            wasi: WasiCtxBuilder::new()
                .inherit_stdout()
                .inherit_stderr()
                .build_p1(),
            limits: StoreLimitsBuilder::new()
                .memory_size(execution.max_memory_bytes())
                .build(),
        };

        let mut store = Store::new(self.engine.inner(), state);
        store.limiter(|state| &mut state.limits);

        let mut instance = WasmtimeInstance {
            instance: None,
            store,
            fuel: execution.fuel_metering.then_some(execution.max_fuel),
        };

        instance.refuel()?;
        let inner = compiled
            .pre
            .instantiate(&mut instance.store)
            .map_err(|e| RuntimeError::init_failed("instantiate", classify(e)))?;
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
        BackendKind::Wasmtime
    }
}

impl std::fmt::Debug for WasmtimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeBuilder")
            .field("module_ref", &self.module_ref)
            .field("compilations", &self.compilations())
            .finish_non_exhaustive()
    }
}

/// A live Wasmtime instance.
struct WasmtimeInstance {
    store: Store<WasmtimeState>,
    instance: Option<Instance>,
    fuel: Option<u64>,
}

impl WasmtimeInstance {
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
            .get_func(&mut self.store, export)
            .ok_or_else(|| RuntimeError::export_not_found(export))?;
        let func = func
            .typed::<(), ()>(&self.store)
            .map_err(|e| {
                RuntimeError::invalid_abi(format!("`{export}` must take no arguments: {e}"))
            })?;

        self.refuel()?;
        match func.call(&mut self.store, ()) {
            Ok(()) => Ok(()),
            Err(e) if e.downcast_ref::<I32Exit>().is_some_and(|exit| exit.0 == 0) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    /// Copy the input into guest memory via the guest's allocator.
    fn write_input(
        &mut self,
        instance: Instance,
        input: &[u8],
    ) -> Result<(i32, i32), RuntimeError> {
        let len = i32::try_from(input.len())
            .map_err(|_| RuntimeError::invalid_abi("input larger than guest address space"))?;

        let allocate = instance
            .get_typed_func::<i32, i32>(&mut self.store, ALLOCATE_EXPORT)
            .map_err(|e| {
                RuntimeError::invalid_abi(format!(
                    "module must export `{ALLOCATE_EXPORT}(i32) -> i32`: {e}"
                ))
            })?;
        let ptr = allocate.call(&mut self.store, len).map_err(classify)?;

        let memory = instance
            .get_memory(&mut self.store, MEMORY_EXPORT)
            .ok_or_else(|| RuntimeError::invalid_abi("module does not export memory"))?;
        let offset = usize::try_from(ptr)
            .map_err(|_| RuntimeError::invalid_abi("allocator returned a negative pointer"))?;
        memory.write(&mut self.store, offset, input).map_err(|e| {
            RuntimeError::invalid_abi(format!("allocator returned an invalid pointer: {e}"))
        })?;

        Ok((ptr, len))
    }
}

impl RuntimeInstance for WasmtimeInstance {
    fn call(&mut self, export: &str, input: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        let instance = self.instance()?;
        let func = instance
            .get_func(&mut self.store, export)
            .ok_or_else(|| RuntimeError::export_not_found(export))?;
        let ty = func.ty(&self.store);

        self.store.data_mut().ctx.begin_call();
        self.refuel()?;

        let params = match ty.params().len() {
            0 => Vec::new(),
            2 if ty.params().all(|p| matches!(p, ValType::I32)) => {
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
                let err = classify(e);
                warn!(export, fuel_consumed, error = %err, "Call failed");
                Err(err)
            }
        }
    }
}

/// Map a Wasmtime error to a runtime error.
fn classify(error: ::wasmtime::Error) -> RuntimeError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => RuntimeError::FuelExhausted,
        _ => RuntimeError::trap(format!("{error:#}")),
    }
}
