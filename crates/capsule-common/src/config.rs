//! Configuration structures for capsule.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Backend selection and engine-wide settings
//! - [`ExecutionConfig`]: Per-instance execution limits (fuel, memory, pooling, timeout)

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CapabilityConfig;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the engine.
/// It can be loaded from files (TOML, JSON).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Backend and engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-instance execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Host capabilities available to guests.
    #[serde(default)]
    pub capabilities: CapabilityConfig,
}

/// WebAssembly backend used to compile and run modules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Cranelift-based JIT (wasmtime).
    #[default]
    Wasmtime,
    /// Interpreter (wasmi).
    Wasmi,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Wasmtime => write!(f, "wasmtime"),
            BackendKind::Wasmi => write!(f, "wasmi"),
        }
    }
}

/// Engine configuration.
///
/// These settings apply to every module compiled by the engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Backend to compile and run modules with.
    #[serde(default)]
    pub backend: BackendKind,

    /// Enable the pooling allocator (wasmtime only).
    ///
    /// When enabled, memory is pre-allocated for a pool of instances,
    /// reducing instantiation time.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
        }
    }
}

/// Per-instance execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (CPU instructions) per call.
    ///
    /// Fuel is refilled before every call into an instance.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Enable fuel metering.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Maximum linear memory in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Idle instances kept per job type for reuse.
    #[serde(default = "defaults::pool_size")]
    pub pool_size: usize,

    /// Job timeout in milliseconds, unset for no timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            fuel_metering: defaults::fuel_metering(),
            max_memory_mb: defaults::max_memory_mb(),
            pool_size: defaults::pool_size(),
            timeout_ms: None,
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Maximum linear memory in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn max_fuel() -> u64 {
        100_000_000
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn max_memory_mb() -> u32 {
        128
    }

    pub const fn pool_size() -> usize {
        4
    }
}
