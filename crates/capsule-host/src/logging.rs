//! The `log_msg` host function.
//!
//! Guest logs are both:
//! 1. Stored in the [`InstanceContext`](capsule_core::InstanceContext) of the call
//! 2. Emitted via the `tracing` crate with `guest_log = true`
//!
//! A call may record at most `logger.max_logs_per_call` entries; later calls
//! to `log_msg` fail with a rate limit error and are neither stored nor
//! emitted.

use tracing::{debug, error, info, warn};

use capsule_common::{Capability, HostFunctionError};
use capsule_core::{HostFn, LogLevel};

/// Import name of the logging host function.
pub const LOG_MSG: &str = "log_msg";

/// The `log_msg(level, ptr, len)` host function, owned by the Logger capability.
///
/// Levels are 1 = error, 2 = warn, 3 = info, 4 = debug; anything else logs
/// at info.
pub fn log_msg() -> HostFn {
    HostFn::new(LOG_MSG, 3, Capability::Logger, |call, args| {
        let max = call.ctx.capabilities.logger.max_logs_per_call;
        if call.ctx.logs.len() >= usize::try_from(max).unwrap_or(usize::MAX) {
            return Err(HostFunctionError::RateLimitExceeded {
                operation: "log".into(),
            });
        }

        let level = LogLevel::from_i32(args[0]);
        let message = call.read_str(args[1], args[2])?.to_string();

        emit(level, &message);
        call.ctx.log(level, message);
        Ok(0)
    })
}

fn emit(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!(guest_log = true, "{}", message),
        LogLevel::Info => info!(guest_log = true, "{}", message),
        LogLevel::Warn => warn!(guest_log = true, "{}", message),
        LogLevel::Error => error!(guest_log = true, "{}", message),
    }
}
