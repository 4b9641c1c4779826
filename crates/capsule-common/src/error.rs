//! Error types for capsule.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Module lifecycle errors, from compilation to a finished call
//! - [`HostFunctionError`]: Typed failures of host functions, reported back to the guest
//! - [`RunErr`]: The guest-visible `{"code":..,"message":..}` error value
//! - [`ExecutorError`]: Errors of the executor facade
//! - [`BusError`]: Message bus failures

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Code carried by the payload returned when a capability is disabled.
pub const CAPABILITY_DISABLED_CODE: i32 = 1;

/// Message carried by the payload returned when a capability is disabled.
pub const CAPABILITY_DISABLED_MESSAGE: &str = "capability is not enabled";

/// Module lifecycle errors.
///
/// Compilation and link failures are fatal for a registration: no instance can
/// ever be produced for that module. Everything else is scoped to a single
/// instantiation or call.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// No module is registered under the requested job type.
    #[error("Module not found: {module_id}")]
    ModuleNotFound {
        /// The job type that was looked up.
        module_id: String,
    },

    /// The module bytes could not be compiled.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The module's imports could not be resolved against the host functions.
    #[error("Link failed: {reason}")]
    LinkFailed {
        /// Description of the link failure.
        reason: String,
    },

    /// An initialization export exists but failed.
    #[error("Initialization via `{export}` failed: {reason}")]
    InitFailed {
        /// The initialization export that was invoked.
        export: String,
        /// Description of the failure.
        reason: String,
    },

    /// The requested export does not exist.
    #[error("Export not found: {export}")]
    ExportNotFound {
        /// Name of the missing export.
        export: String,
    },

    /// The module does not follow the calling convention.
    #[error("Invalid module ABI: {reason}")]
    InvalidAbi {
        /// Description of the mismatch.
        reason: String,
    },

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// Execution exceeded the configured timeout.
    #[error("Execution timeout after {duration_ms}ms")]
    ExecutionTimeout {
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// The guest finished the call by reporting an error.
    #[error("{0}")]
    Run(RunErr),

    /// The job was dropped before it produced a result.
    #[error("Job dropped before completion")]
    JobDropped,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Failures of host function implementations.
///
/// These never escape to the host as errors: the gate serializes them into a
/// [`RunErr`] payload that the guest reads back through the FFI result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostFunctionError {
    /// The capability that owns the function is disabled.
    #[error("capability is not enabled")]
    CapabilityDisabled,

    /// An HTTP request made by the guest module failed.
    #[error("HTTP request failed: {url} (status: {status})")]
    HttpRequestFailed {
        /// The URL that was requested.
        url: String,
        /// The HTTP status code (0 if the connection failed).
        status: u16,
    },

    /// The destination was rejected by the capability's options.
    #[error("Permission denied: {resource}")]
    PermissionDenied {
        /// Description of the resource that access was denied to.
        resource: String,
    },

    /// The per-call request budget was exhausted.
    #[error("Rate limit exceeded: {operation}")]
    RateLimitExceeded {
        /// The operation that was rate-limited.
        operation: String,
    },

    /// The GraphQL endpoint answered with errors.
    #[error("GraphQL query failed: {message}")]
    GraphQLFailed {
        /// The first error reported by the endpoint.
        message: String,
    },

    /// The guest passed malformed arguments.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },
}

impl HostFunctionError {
    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a new `PermissionDenied` error.
    pub fn permission_denied(resource: impl Into<String>) -> Self {
        Self::PermissionDenied {
            resource: resource.into(),
        }
    }

    /// The guest-visible code for this failure.
    pub fn code(&self) -> i32 {
        match self {
            Self::CapabilityDisabled => CAPABILITY_DISABLED_CODE,
            Self::HttpRequestFailed { status, .. } if *status > 0 => i32::from(*status),
            Self::HttpRequestFailed { .. } => 500,
            Self::PermissionDenied { .. } => 403,
            Self::RateLimitExceeded { .. } => 429,
            Self::GraphQLFailed { .. } => 502,
            Self::InvalidArgument { .. } => 400,
        }
    }

    /// Convert into the value handed back to the guest.
    pub fn to_run_err(&self) -> RunErr {
        RunErr::new(self.code(), self.to_string())
    }
}

/// Error value exchanged with guest modules.
///
/// Serializes (and displays) as `{"code":<code>,"message":"<message>"}`; field
/// order is part of the guest contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunErr {
    /// Error code, an HTTP status for most guest-reported errors.
    pub code: i32,
    /// Human readable message.
    pub message: String,
}

impl RunErr {
    /// Create a new error value.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The payload every disabled capability returns.
    pub fn capability_disabled() -> Self {
        Self::new(CAPABILITY_DISABLED_CODE, CAPABILITY_DISABLED_MESSAGE)
    }

    /// Serialize to the wire form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"message":"unknown error"}}"#, self.code)
        })
    }
}

impl fmt::Display for RunErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

impl std::error::Error for RunErr {}

/// Errors returned by the executor facade.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// No engine is attached to the executor.
    #[error("executor not fully configured")]
    NotConfigured,

    /// The job type is not registered locally.
    #[error("cannot handle job: {job_type}")]
    CannotHandle {
        /// The requested job type.
        job_type: String,
    },

    /// The job ran and failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Message bus failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The endpoint could not be parsed.
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        /// The endpoint as given.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Connecting to a peer failed.
    #[error("Failed to connect to '{endpoint}': {reason}")]
    ConnectFailed {
        /// The endpoint that was dialed.
        endpoint: String,
        /// Description of the failure.
        reason: String,
    },

    /// The bus has shut down.
    #[error("Bus closed")]
    Closed,
}

impl RuntimeError {
    /// Create a new `ModuleNotFound` error.
    pub fn module_not_found(module_id: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module_id: module_id.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `LinkFailed` error.
    pub fn link_failed(reason: impl Into<String>) -> Self {
        Self::LinkFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InitFailed` error.
    pub fn init_failed(export: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InitFailed {
            export: export.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new `ExportNotFound` error.
    pub fn export_not_found(export: impl Into<String>) -> Self {
        Self::ExportNotFound {
            export: export.into(),
        }
    }

    /// Create a new `InvalidAbi` error.
    pub fn invalid_abi(reason: impl Into<String>) -> Self {
        Self::InvalidAbi {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates the module was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ModuleNotFound { .. })
    }

    /// Returns `true` if a requested export was missing.
    pub fn is_export_not_found(&self) -> bool {
        matches!(self, Self::ExportNotFound { .. })
    }

    /// Returns `true` if the instance that produced this error must not be reused.
    pub fn discards_instance(&self) -> bool {
        matches!(
            self,
            Self::Trap { .. } | Self::FuelExhausted | Self::ExecutionTimeout { .. }
        )
    }
}
