//! Per-instance state shared with host functions.
//!
//! This module provides:
//! - [`InstanceContext`]: State every backend keeps in its store and hands to host functions
//! - [`LogEntry`] and [`LogLevel`]: Structured logging from guest code
//! - [`ExecutionMetrics`]: Metrics of the most recent call

use std::sync::Arc;
use std::time::{Duration, Instant};

use capsule_common::{CapabilityConfig, RunErr};

/// Per-instance execution context.
///
/// Lives inside the backend store for as long as the instance does. Everything
/// scoped to a single call (the outcome, the pending FFI result, logs and the
/// request budget) is reset by [`InstanceContext::begin_call`].
pub struct InstanceContext {
    /// Capability snapshot consulted by every gated host function.
    pub capabilities: Arc<CapabilityConfig>,

    /// Outcome reported by the guest through `return_result` / `return_error`.
    pub outcome: Option<Result<Vec<u8>, RunErr>>,

    /// Value waiting to be copied out with `get_ffi_result`.
    pub ffi_result: Option<Vec<u8>>,

    /// Logs collected from guest code during the current call.
    pub logs: Vec<LogEntry>,

    /// Outbound requests made during the current call.
    pub http_requests: u32,

    /// Metrics of the current (or last) call.
    pub metrics: ExecutionMetrics,

    /// Start time of the current call.
    start_time: Instant,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Log message content.
    pub message: String,

    /// Timestamp when the log was recorded.
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl LogLevel {
    /// Map the guest's numeric level. Unknown values log at info.
    pub fn from_i32(level: i32) -> Self {
        match level {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            4 => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Execution performance metrics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Fuel consumed during execution.
    pub fuel_consumed: u64,

    /// Total execution duration.
    pub duration: Option<Duration>,
}

impl InstanceContext {
    /// Create a context bound to a capability snapshot.
    pub fn new(capabilities: Arc<CapabilityConfig>) -> Self {
        Self {
            capabilities,
            outcome: None,
            ffi_result: None,
            logs: Vec::new(),
            http_requests: 0,
            metrics: ExecutionMetrics::default(),
            start_time: Instant::now(),
        }
    }

    /// Reset per-call state before entering the guest.
    pub fn begin_call(&mut self) {
        self.outcome = None;
        self.ffi_result = None;
        self.logs.clear();
        self.http_requests = 0;
        self.metrics = ExecutionMetrics::default();
        self.start_time = Instant::now();
    }

    /// Take the guest's outcome after a call. No outcome means empty output.
    pub fn finish_call(&mut self, fuel_consumed: u64) -> Result<Vec<u8>, RunErr> {
        self.metrics.fuel_consumed = fuel_consumed;
        self.metrics.duration = Some(self.start_time.elapsed());
        self.ffi_result = None;
        self.outcome.take().unwrap_or_else(|| Ok(Vec::new()))
    }

    /// Add a log entry.
    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
    }

    /// Store a successful FFI result and return its length for the guest.
    pub fn set_ffi_result(&mut self, bytes: Vec<u8>) -> i32 {
        let len = ffi_len(bytes.len());
        self.ffi_result = Some(bytes);
        len
    }

    /// Store an error payload and return its negated length for the guest.
    pub fn set_ffi_error(&mut self, err: &RunErr) -> i32 {
        let bytes = err.to_json().into_bytes();
        let len = ffi_len(bytes.len());
        self.ffi_result = Some(bytes);
        -len
    }

    /// Get elapsed time since the current call started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl std::fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceContext")
            .field("logs", &self.logs.len())
            .field("http_requests", &self.http_requests)
            .field("has_outcome", &self.outcome.is_some())
            .finish_non_exhaustive()
    }
}

fn ffi_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}
