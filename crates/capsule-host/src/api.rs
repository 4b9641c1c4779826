//! The default host API: calling-convention functions plus every capability.

use capsule_common::{CapabilityConfig, RuntimeError};
use capsule_core::HostApi;

use crate::graphql::graphql_query;
use crate::http_outbound::{fetch_url, OutboundClient};
use crate::logging::log_msg;

/// Build the host API with every capability host function registered.
///
/// Which of them a guest may actually use is decided per call by
/// `capabilities`.
pub fn default_api(capabilities: CapabilityConfig) -> Result<HostApi, RuntimeError> {
    Ok(default_api_with_client(capabilities, OutboundClient::new()?))
}

/// Like [`default_api`], with a caller-provided HTTP client.
pub fn default_api_with_client(capabilities: CapabilityConfig, client: OutboundClient) -> HostApi {
    HostApi::new(capabilities).with_functions([
        log_msg(),
        fetch_url(client.clone()),
        graphql_query(client),
    ])
}
