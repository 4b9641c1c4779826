//! Host functions and the capability gate.
//!
//! Every host function shares the WebAssembly signature `(i32 × n) -> i32` and
//! is invoked through [`HostFn::invoke`], which checks the function's
//! capability against the instance's [`CapabilityConfig`] before running any
//! of its logic. Backends only ever see [`HostApi`]; they never know which
//! capabilities exist.
//!
//! # Return convention
//!
//! - `n >= 0`: success, `n` bytes of FFI result are pending
//! - `-n`: failure, an `n`-byte `{"code":..,"message":..}` payload is pending
//!
//! The guest fetches the pending bytes with `get_ffi_result(ptr)`.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use capsule_common::{Capability, CapabilityConfig, HostFunctionError};

use crate::store::InstanceContext;

/// Implementation of a host function body.
pub type HostFnImpl =
    dyn Fn(&mut HostCall<'_>, &[i32]) -> Result<i32, HostFunctionError> + Send + Sync;

/// A host function exposed to guests under the `env` import module.
#[derive(Clone)]
pub struct HostFn {
    name: String,
    arg_count: usize,
    capability: Option<Capability>,
    func: Arc<HostFnImpl>,
}

impl HostFn {
    /// Create a host function owned by a capability.
    pub fn new<F>(
        name: impl Into<String>,
        arg_count: usize,
        capability: Capability,
        func: F,
    ) -> Self
    where
        F: Fn(&mut HostCall<'_>, &[i32]) -> Result<i32, HostFunctionError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arg_count,
            capability: Some(capability),
            func: Arc::new(func),
        }
    }

    /// Create a host function that is always available.
    pub fn ungated<F>(name: impl Into<String>, arg_count: usize, func: F) -> Self
    where
        F: Fn(&mut HostCall<'_>, &[i32]) -> Result<i32, HostFunctionError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arg_count,
            capability: None,
            func: Arc::new(func),
        }
    }

    /// Import name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of `i32` parameters.
    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    /// Owning capability, if any.
    pub fn capability(&self) -> Option<Capability> {
        self.capability
    }

    /// Run the function behind the capability gate.
    ///
    /// A disabled capability short-circuits with the canonical payload and the
    /// body never runs. Body failures are reported to the guest the same way;
    /// nothing here returns an error to the backend.
    pub fn invoke(&self, call: &mut HostCall<'_>, args: &[i32]) -> i32 {
        if let Some(capability) = self.capability {
            if !call.ctx.capabilities.is_enabled(capability) {
                debug!(
                    function = %self.name,
                    capability = %capability,
                    "Host call rejected: capability disabled"
                );
                return call
                    .ctx
                    .set_ffi_error(&HostFunctionError::CapabilityDisabled.to_run_err());
            }
        }

        if args.len() != self.arg_count {
            return call.ctx.set_ffi_error(
                &HostFunctionError::invalid_argument(format!(
                    "{} expects {} arguments, got {}",
                    self.name,
                    self.arg_count,
                    args.len()
                ))
                .to_run_err(),
            );
        }

        match (self.func)(call, args) {
            Ok(ret) => ret,
            Err(err) => {
                debug!(function = %self.name, error = %err, "Host call failed");
                call.ctx.set_ffi_error(&err.to_run_err())
            }
        }
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFn")
            .field("name", &self.name)
            .field("arg_count", &self.arg_count)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

/// View handed to a host function body: guest memory plus the instance context.
pub struct HostCall<'a> {
    memory: &'a mut [u8],
    /// Instance state.
    pub ctx: &'a mut InstanceContext,
}

impl<'a> HostCall<'a> {
    /// Bind a memory view and context for one host call.
    ///
    /// Modules without an exported memory get an empty view; every pointer
    /// access then fails with `InvalidArgument`.
    pub fn new(memory: &'a mut [u8], ctx: &'a mut InstanceContext) -> Self {
        Self { memory, ctx }
    }

    /// Borrow `len` bytes of guest memory at `ptr`.
    pub fn read(&self, ptr: i32, len: i32) -> Result<&[u8], HostFunctionError> {
        let range = self.range(ptr, len)?;
        Ok(&self.memory[range])
    }

    /// Read a UTF-8 string from guest memory.
    pub fn read_str(&self, ptr: i32, len: i32) -> Result<&str, HostFunctionError> {
        std::str::from_utf8(self.read(ptr, len)?)
            .map_err(|_| HostFunctionError::invalid_argument("string is not valid UTF-8"))
    }

    /// Copy `data` into guest memory at `ptr`.
    pub fn write(&mut self, ptr: i32, data: &[u8]) -> Result<(), HostFunctionError> {
        let len = i32::try_from(data.len())
            .map_err(|_| HostFunctionError::invalid_argument("write too large"))?;
        let range = self.range(ptr, len)?;
        self.memory[range].copy_from_slice(data);
        Ok(())
    }

    /// Size of guest memory in bytes.
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    #[allow(clippy::cast_sign_loss)]
    fn range(&self, ptr: i32, len: i32) -> Result<std::ops::Range<usize>, HostFunctionError> {
        if ptr < 0 || len < 0 {
            return Err(HostFunctionError::invalid_argument(format!(
                "negative pointer or length (ptr={ptr}, len={len})"
            )));
        }

        let start = ptr as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or_else(|| HostFunctionError::invalid_argument("pointer + length overflow"))?;

        if end > self.memory.len() {
            return Err(HostFunctionError::invalid_argument(format!(
                "memory access out of bounds ({start}..{end} of {})",
                self.memory.len()
            )));
        }

        Ok(start..end)
    }
}

/// The set of host functions linked into every instance, and the capability
/// snapshot they are gated by.
#[derive(Clone, Debug)]
pub struct HostApi {
    capabilities: Arc<CapabilityConfig>,
    functions: Vec<HostFn>,
}

impl HostApi {
    /// Create an API containing only the calling-convention functions.
    pub fn new(capabilities: CapabilityConfig) -> Self {
        Self {
            capabilities: Arc::new(capabilities),
            functions: super::abi::functions(),
        }
    }

    /// Add a host function, replacing any existing function with the same name.
    #[must_use]
    pub fn with_function(mut self, function: HostFn) -> Self {
        self.functions.retain(|f| f.name != function.name);
        self.functions.push(function);
        self
    }

    /// Add several host functions.
    #[must_use]
    pub fn with_functions(self, functions: impl IntoIterator<Item = HostFn>) -> Self {
        functions.into_iter().fold(self, Self::with_function)
    }

    /// Shared capability snapshot.
    pub fn capabilities(&self) -> &Arc<CapabilityConfig> {
        &self.capabilities
    }

    /// All host functions.
    pub fn functions(&self) -> &[HostFn] {
        &self.functions
    }

    /// Look up a function by import name.
    pub fn get(&self, name: &str) -> Option<&HostFn> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Fresh per-instance context bound to this API's capabilities.
    pub fn new_context(&self) -> InstanceContext {
        InstanceContext::new(Arc::clone(&self.capabilities))
    }
}

impl Default for HostApi {
    fn default() -> Self {
        Self::new(CapabilityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use capsule_common::RunErr;

    use super::*;

    fn counting_fn(counter: Arc<AtomicUsize>) -> HostFn {
        HostFn::new("fetch_url", 2, Capability::Http, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        })
    }

    #[test]
    fn test_disabled_capability_never_runs_body() {
        let counter = Arc::new(AtomicUsize::new(0));
        let host_fn = counting_fn(Arc::clone(&counter));

        let mut ctx = InstanceContext::new(Arc::new(
            CapabilityConfig::default().with(Capability::Http, false),
        ));
        let mut memory = vec![0u8; 64];
        let mut call = HostCall::new(&mut memory, &mut ctx);

        let ret = host_fn.invoke(&mut call, &[0, 0]);

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let expected = br#"{"code":1,"message":"capability is not enabled"}"#;
        assert_eq!(ret, -i32::try_from(expected.len()).unwrap());
        assert_eq!(ctx.ffi_result.as_deref(), Some(&expected[..]));
    }

    #[test]
    fn test_enabled_capability_runs_body() {
        let counter = Arc::new(AtomicUsize::new(0));
        let host_fn = counting_fn(Arc::clone(&counter));

        let mut ctx = InstanceContext::new(Arc::new(CapabilityConfig::default()));
        let mut memory = vec![0u8; 64];
        let mut call = HostCall::new(&mut memory, &mut ctx);

        assert_eq!(host_fn.invoke(&mut call, &[0, 0]), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_body_error_becomes_payload() {
        let host_fn = HostFn::ungated("boom", 0, |_, _| {
            Err(HostFunctionError::permission_denied("example.com"))
        });

        let mut ctx = InstanceContext::new(Arc::new(CapabilityConfig::none()));
        let mut memory = Vec::new();
        let mut call = HostCall::new(&mut memory, &mut ctx);

        let ret = host_fn.invoke(&mut call, &[]);
        assert!(ret < 0);

        let payload: RunErr =
            serde_json::from_slice(ctx.ffi_result.as_deref().unwrap()).unwrap();
        assert_eq!(payload.code, 403);
    }

    #[test]
    fn test_wrong_arg_count_is_rejected() {
        let host_fn = HostFn::ungated("one", 1, |_, _| Ok(7));

        let mut ctx = InstanceContext::new(Arc::new(CapabilityConfig::default()));
        let mut memory = Vec::new();
        let mut call = HostCall::new(&mut memory, &mut ctx);

        assert!(host_fn.invoke(&mut call, &[]) < 0);
        assert_eq!(host_fn.invoke(&mut call, &[1]), 7);
    }

    #[test]
    fn test_memory_bounds() {
        let mut ctx = InstanceContext::new(Arc::new(CapabilityConfig::default()));
        let mut memory = b"hello world".to_vec();
        let mut call = HostCall::new(&mut memory, &mut ctx);

        assert_eq!(call.read_str(6, 5).unwrap(), "world");
        assert!(call.read(8, 10).is_err());
        assert!(call.read(-1, 2).is_err());
        assert!(call.read(0, -2).is_err());
        assert!(call.read(i32::MAX, i32::MAX).is_err());

        call.write(0, b"HELLO").unwrap();
        assert_eq!(call.read(0, 5).unwrap(), b"HELLO");
        assert!(call.write(10, b"xx").is_err());
    }

    #[test]
    fn test_with_function_replaces_by_name() {
        let api = HostApi::default()
            .with_function(HostFn::ungated("extra", 0, |_, _| Ok(1)))
            .with_function(HostFn::ungated("extra", 0, |_, _| Ok(2)));

        assert_eq!(
            api.functions().iter().filter(|f| f.name() == "extra").count(),
            1
        );
        assert!(api.get("return_result").is_some());
        assert!(api.get("get_ffi_result").is_some());
    }
}
