//! Configuration file structures for capsule.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP server settings
//! - [`AdminConfig`]: Admin API settings
//! - [`BusConfig`]: Message bus peers
//! - [`ModuleEntry`]: Pre-registered module definition

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [engine]
/// backend = "wasmtime"
///
/// [execution]
/// max_fuel = 10_000_000
/// pool_size = 4
/// timeout_ms = 100
///
/// [capabilities.http]
/// allowed_domains = ["api.example.com"]
///
/// [server]
/// bind_addr = "0.0.0.0:8080"
///
/// [admin]
/// enabled = true
/// token = "your-secret-token"
///
/// [bus]
/// static_peers = "tcp://10.0.0.2:4000,tcp://10.0.0.3:4000"
///
/// [[modules]]
/// id = "hello"
/// path = "./modules/hello.wasm"
/// version = "1.0.0"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Engine, execution and capability settings.
    #[serde(flatten)]
    pub runtime: RuntimeConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Admin API configuration.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Message bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Modules to register at startup.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// HTTP server configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Enable Admin API.
    #[serde(default)]
    pub enabled: bool,

    /// Authentication token (required when enabled).
    ///
    /// Clients must include this token in the `X-Admin-Token` header.
    pub token: Option<String>,

    /// URL prefix for Admin API endpoints.
    #[serde(default = "defaults::admin_prefix")]
    pub prefix: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: None,
            prefix: defaults::admin_prefix(),
        }
    }
}

impl AdminConfig {
    /// Returns `true` if enabled and a token is set.
    pub fn is_configured(&self) -> bool {
        self.enabled && self.token.is_some()
    }
}

/// Message bus configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BusConfig {
    /// Comma-separated peer endpoints dialed once at startup.
    #[serde(default)]
    pub static_peers: String,
}

impl BusConfig {
    /// Individual peer endpoints, with blanks removed.
    pub fn peers(&self) -> Vec<String> {
        self.static_peers
            .split(',')
            .map(str::trim)
            .filter(|peer| !peer.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

/// A module entry to register at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Job type the module is registered under.
    ///
    /// This ID is used in the `/functions/:id` endpoint.
    pub id: String,

    /// Path to the WebAssembly module file.
    pub path: String,

    /// Module version, informational only.
    #[serde(default)]
    pub version: Option<String>,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }

    pub fn admin_prefix() -> String {
        "/admin".to_string()
    }
}
