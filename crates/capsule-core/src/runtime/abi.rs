//! Calling-convention host functions linked into every instance.
//!
//! - `return_result(ptr, len)`: set the call's output
//! - `return_error(code, ptr, len)`: set the call's error
//! - `get_ffi_result(ptr)`: copy the pending FFI result into guest memory
//!
//! `get_ffi_result` returns the number of bytes copied, `0` when nothing is
//! pending, and `-n` when the pending `n` bytes do not fit at `ptr`. In the
//! last case the result stays pending so the guest can retry with a larger
//! buffer.

use tracing::debug;

use capsule_common::{HostFunctionError, RunErr};

use super::host_fn::{HostCall, HostFn};

/// Import module every host function is linked under.
pub const IMPORT_MODULE: &str = "env";

/// Export the host calls to run a job.
pub const RUN_EXPORT: &str = "run_e";

/// Export the host calls to reserve guest memory for the input.
pub const ALLOCATE_EXPORT: &str = "allocate";

/// Exported memory host functions read from and write to.
pub const MEMORY_EXPORT: &str = "memory";

pub(crate) fn functions() -> Vec<HostFn> {
    vec![
        HostFn::ungated("return_result", 2, return_result),
        HostFn::ungated("return_error", 3, return_error),
        HostFn::ungated("get_ffi_result", 1, get_ffi_result),
    ]
}

fn return_result(call: &mut HostCall<'_>, args: &[i32]) -> Result<i32, HostFunctionError> {
    let output = call.read(args[0], args[1])?.to_vec();
    call.ctx.outcome = Some(Ok(output));
    Ok(0)
}

fn return_error(call: &mut HostCall<'_>, args: &[i32]) -> Result<i32, HostFunctionError> {
    let message = String::from_utf8_lossy(call.read(args[1], args[2])?).into_owned();
    call.ctx.outcome = Some(Err(RunErr::new(args[0], message)));
    Ok(0)
}

// Errors are handled here rather than through the gate, which would replace
// the pending bytes with an error payload.
fn get_ffi_result(call: &mut HostCall<'_>, args: &[i32]) -> Result<i32, HostFunctionError> {
    let Some(result) = call.ctx.ffi_result.take() else {
        return Ok(0);
    };

    let len = i32::try_from(result.len()).unwrap_or(i32::MAX);
    match call.write(args[0], &result) {
        Ok(()) => Ok(len),
        Err(err) => {
            debug!(error = %err, len, "FFI result kept pending");
            call.ctx.ffi_result = Some(result);
            Ok(-len)
        }
    }
}
