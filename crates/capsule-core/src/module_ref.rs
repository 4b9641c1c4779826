//! Module identity and bytes.
//!
//! A [`ModuleRef`] is what a caller hands to [`Engine::register`](crate::Engine::register):
//! a name, a version and the raw WebAssembly bytes. It is immutable; the bytes
//! are reference counted so cloning a ref never copies the module.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument};

use capsule_common::RuntimeError;

/// Version used when none is supplied.
pub const DEFAULT_VERSION: &str = "0.0.0";

/// An immutable reference to a WebAssembly module.
#[derive(Clone, PartialEq, Eq)]
pub struct ModuleRef {
    name: String,
    version: String,
    bytes: Arc<[u8]>,
}

impl ModuleRef {
    /// Create a module reference from raw bytes.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            bytes: bytes.into(),
        }
    }

    /// Read a module from disk.
    ///
    /// The name is the file stem and the version is [`DEFAULT_VERSION`].
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Io`] if the file cannot be read.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module")
            .to_string();

        debug!(name = %name, bytes_len = bytes.len(), "Module read from file");

        Ok(Self::new(name, DEFAULT_VERSION, bytes))
    }

    /// Replace the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Raw module bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size of the module in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the module has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hash of the module bytes, as 16 hex digits.
    pub fn content_hash(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.bytes.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Check the WebAssembly magic number before handing bytes to a backend.
    pub(crate) fn validate_header(&self) -> Result<(), RuntimeError> {
        if self.bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &self.bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for ModuleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRef")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("bytes_len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    #[test]
    fn test_validate_header_valid() {
        let module = ModuleRef::new("empty", "1.0.0", MINIMAL_WASM);
        assert!(module.validate_header().is_ok());
    }

    #[test]
    fn test_validate_header_too_small() {
        let module = ModuleRef::new("tiny", "1.0.0", &[0x00_u8, 0x61][..]);
        assert!(module.validate_header().is_err());
    }

    #[test]
    fn test_validate_header_bad_magic() {
        let module = ModuleRef::new("bad", "1.0.0", &[0_u8, 0, 0, 0, 1, 0, 0, 0][..]);
        let err = module.validate_header().unwrap_err();
        assert!(err.to_string().contains("bad magic number"));
    }

    #[test]
    fn test_content_hash() {
        let a = ModuleRef::new("a", "1", &b"hello"[..]);
        let b = ModuleRef::new("b", "2", &b"hello"[..]);
        let c = ModuleRef::new("c", "1", &b"world"[..]);

        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(a.content_hash().len(), 16);
    }

    #[test]
    fn test_clone_shares_bytes() {
        let module = ModuleRef::new("shared", "1.0.0", MINIMAL_WASM);
        let clone = module.clone();

        assert!(std::ptr::eq(module.bytes(), clone.bytes()));
        assert_eq!(clone, module);
    }

    #[test]
    fn test_from_file() {
        let dir =
            std::env::temp_dir().join(format!("capsule-module-ref-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hello.wasm");
        std::fs::write(&path, MINIMAL_WASM).unwrap();

        let module = ModuleRef::from_file(&path).unwrap();
        assert_eq!(module.name(), "hello");
        assert_eq!(module.version(), DEFAULT_VERSION);
        assert_eq!(module.bytes(), MINIMAL_WASM);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_from_missing_file() {
        let err = ModuleRef::from_file("/definitely/not/here.wasm").unwrap_err();
        assert!(matches!(err, RuntimeError::Io(_)));
    }

    #[test]
    fn test_with_version() {
        let module = ModuleRef::new("m", DEFAULT_VERSION, MINIMAL_WASM).with_version("2.0.0");
        assert_eq!(module.version(), "2.0.0");
    }
}
