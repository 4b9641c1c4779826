//! Capability configuration for host functions.
//!
//! A [`CapabilityConfig`] decides which host capabilities a guest may use. It
//! is built once at process start and shared read-only for the lifetime of the
//! engine; every host function consults it before doing any work.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A named, independently toggleable host feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Guest logging through the host's tracing pipeline.
    Logger,
    /// Outbound HTTP requests.
    Http,
    /// GraphQL queries.
    GraphQL,
    /// Authorization header injection on outbound requests.
    Auth,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Logger => write!(f, "logger"),
            Capability::Http => write!(f, "http"),
            Capability::GraphQL => write!(f, "graphql"),
            Capability::Auth => write!(f, "auth"),
        }
    }
}

/// Capability configuration snapshot.
///
/// # Example
///
/// ```toml
/// [capabilities.http]
/// enabled = true
/// allowed_domains = ["api.example.com", "*.github.com"]
///
/// [capabilities.graphql]
/// enabled = false
///
/// [capabilities.auth.headers."api.github.com"]
/// header_type = "bearer"
/// value = "env(GITHUB_TOKEN)"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CapabilityConfig {
    /// Guest logging.
    #[serde(default)]
    pub logger: LoggerConfig,

    /// Outbound HTTP.
    #[serde(default)]
    pub http: HttpConfig,

    /// GraphQL client.
    #[serde(default)]
    pub graphql: GraphQLConfig,

    /// Authorization header injection.
    #[serde(default)]
    pub auth: AuthConfig,
}

impl CapabilityConfig {
    /// Check whether a capability is enabled.
    pub fn is_enabled(&self, capability: Capability) -> bool {
        match capability {
            Capability::Logger => self.logger.enabled,
            Capability::Http => self.http.enabled,
            Capability::GraphQL => self.graphql.enabled,
            Capability::Auth => self.auth.enabled,
        }
    }

    /// A configuration with every capability disabled.
    pub fn none() -> Self {
        Self {
            logger: LoggerConfig {
                enabled: false,
                ..LoggerConfig::default()
            },
            http: HttpConfig {
                enabled: false,
                ..HttpConfig::default()
            },
            graphql: GraphQLConfig { enabled: false },
            auth: AuthConfig {
                enabled: false,
                headers: HashMap::new(),
            },
        }
    }

    /// Copy of this configuration with one capability toggled.
    #[must_use]
    pub fn with(mut self, capability: Capability, enabled: bool) -> Self {
        match capability {
            Capability::Logger => self.logger.enabled = enabled,
            Capability::Http => self.http.enabled = enabled,
            Capability::GraphQL => self.graphql.enabled = enabled,
            Capability::Auth => self.auth.enabled = enabled,
        }
        self
    }
}

/// Logger capability.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggerConfig {
    /// Allow guests to emit logs.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Maximum log entries a single call may record.
    #[serde(default = "defaults::max_logs_per_call")]
    pub max_logs_per_call: u32,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            max_logs_per_call: defaults::max_logs_per_call(),
        }
    }
}

/// HTTP capability.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Allow outbound HTTP.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Allowed destination hosts.
    ///
    /// Patterns can be:
    /// - Exact match: `api.example.com`
    /// - Wildcard subdomain: `*.example.com` (also matches `example.com`)
    /// - All hosts: `*`
    #[serde(default = "defaults::allowed_domains")]
    pub allowed_domains: Vec<String>,

    /// Reject loopback, private, link-local and metadata addresses.
    #[serde(default = "defaults::block_private_addresses")]
    pub block_private_addresses: bool,

    /// Maximum outbound requests a single call may make.
    #[serde(default = "defaults::max_requests_per_call")]
    pub max_requests_per_call: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            allowed_domains: defaults::allowed_domains(),
            block_private_addresses: defaults::block_private_addresses(),
            max_requests_per_call: defaults::max_requests_per_call(),
        }
    }
}

impl HttpConfig {
    /// Check if a (lowercase) host is covered by `allowed_domains`.
    pub fn is_domain_allowed(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.allowed_domains
            .iter()
            .any(|pattern| matches_pattern(pattern, &host))
    }
}

fn matches_pattern(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_lowercase();

    if pattern == "*" {
        true
    } else if let Some(suffix) = pattern.strip_prefix("*.") {
        host == suffix || host.ends_with(&format!(".{suffix}"))
    } else {
        pattern == host
    }
}

/// GraphQL capability.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphQLConfig {
    /// Allow GraphQL queries.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
}

impl Default for GraphQLConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
        }
    }
}

/// Auth capability: header injection rules keyed by destination host.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Inject headers on outbound requests.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Rules keyed by destination host.
    #[serde(default)]
    pub headers: HashMap<String, AuthHeader>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            headers: HashMap::new(),
        }
    }
}

impl AuthConfig {
    /// Resolve the `Authorization` value for a destination host.
    ///
    /// Returns `None` when auth is disabled, no rule matches, or the rule
    /// points at an unset environment variable.
    pub fn header_for(&self, host: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }

        self.headers.get(&host.to_lowercase())?.resolve()
    }
}

/// A header injection rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuthHeader {
    /// Scheme, e.g. `bearer` or `basic`.
    pub header_type: String,

    /// Credential, or `env(NAME)` to read it from the environment at use time.
    pub value: String,
}

impl AuthHeader {
    /// Build the header value, dereferencing `env(NAME)` placeholders.
    pub fn resolve(&self) -> Option<String> {
        let credential = match self
            .value
            .strip_prefix("env(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            Some(var) => match std::env::var(var) {
                Ok(value) => value,
                Err(_) => {
                    warn!(var = var, "Auth header references unset environment variable");
                    return None;
                }
            },
            None => self.value.clone(),
        };

        let scheme = match self.header_type.to_lowercase().as_str() {
            "bearer" => "Bearer".to_string(),
            "basic" => "Basic".to_string(),
            _ => self.header_type.clone(),
        };

        Some(format!("{scheme} {credential}"))
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn enabled() -> bool {
        true
    }

    pub fn allowed_domains() -> Vec<String> {
        vec!["*".to_string()]
    }

    pub const fn block_private_addresses() -> bool {
        true
    }

    pub const fn max_requests_per_call() -> u32 {
        100
    }

    pub const fn max_logs_per_call() -> u32 {
        1000
    }
}
