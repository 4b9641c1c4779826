//! Common types, errors, and configuration for capsule.
//!
//! This crate provides shared functionality used across the capsule workspace:
//! - Error types using `thiserror`, including the guest-visible [`RunErr`]
//! - Configuration structures for the engine and the binary
//! - Capability configuration consulted by every host function

pub mod capabilities;
pub mod config;
pub mod config_file;
pub mod error;

pub use capabilities::{
    AuthConfig, AuthHeader, Capability, CapabilityConfig, GraphQLConfig, HttpConfig, LoggerConfig,
};
pub use config::{BackendKind, EngineConfig, ExecutionConfig, RuntimeConfig};
pub use config_file::{
    AdminConfig, BusConfig, ConfigFile, ConfigFileError, ModuleEntry, ServerConfigFile,
};
pub use error::{
    BusError, CAPABILITY_DISABLED_CODE, CAPABILITY_DISABLED_MESSAGE, ExecutorError,
    HostFunctionError, RunErr, RuntimeError,
};
