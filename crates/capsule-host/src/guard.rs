//! Destination checks shared by every outbound host function.
//!
//! A guest-supplied URL is only dialed after it passes, in order:
//! 1. The per-call request budget
//! 2. URL parsing (`http` and `https` only)
//! 3. The `allowed_domains` patterns of the HTTP capability
//! 4. SSRF protection against private and metadata addresses

use std::sync::Arc;

use tracing::warn;
use url::{Host, Url};

use capsule_common::{HttpConfig, HostFunctionError};
use capsule_core::InstanceContext;

/// Validate `raw` as a destination for an outbound request from this call.
///
/// Counts against the call's request budget even when the destination is
/// rejected.
pub fn check_destination(ctx: &mut InstanceContext, raw: &str) -> Result<Url, HostFunctionError> {
    let capabilities = Arc::clone(&ctx.capabilities);
    let http = &capabilities.http;

    if ctx.http_requests >= http.max_requests_per_call {
        warn!(
            url = raw,
            max = http.max_requests_per_call,
            "Outbound request budget exhausted"
        );
        return Err(HostFunctionError::RateLimitExceeded {
            operation: "outbound request".into(),
        });
    }
    ctx.http_requests += 1;

    let url = parse_url(raw)?;
    check_url(http, &url)?;
    Ok(url)
}

fn parse_url(raw: &str) -> Result<Url, HostFunctionError> {
    let url = Url::parse(raw)
        .map_err(|e| HostFunctionError::invalid_argument(format!("invalid URL '{raw}': {e}")))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(HostFunctionError::invalid_argument(format!(
            "unsupported URL scheme '{other}'"
        ))),
    }
}

/// Apply the HTTP capability's destination rules to a parsed URL.
pub fn check_url(http: &HttpConfig, url: &Url) -> Result<(), HostFunctionError> {
    let Some(host) = url.host_str() else {
        return Err(HostFunctionError::invalid_argument("URL has no host"));
    };

    if !http.is_domain_allowed(host) {
        warn!(url = %url, "Outbound request blocked: host not allowed");
        return Err(HostFunctionError::permission_denied(format!("host {host}")));
    }

    if http.block_private_addresses && is_private_address(url) {
        warn!(url = %url, "Outbound request blocked: private address");
        return Err(HostFunctionError::permission_denied(format!("private address {host}")));
    }

    Ok(())
}

/// Check if the URL points at a private or internal address.
///
/// This blocks:
/// - localhost and loopback ranges
/// - Private IP ranges (10.x.x.x, 172.16-31.x.x, 192.168.x.x)
/// - Link-local addresses, including the cloud metadata endpoint
pub fn is_private_address(url: &Url) -> bool {
    let Some(host) = url.host() else {
        return false;
    };

    match host {
        Host::Domain(domain) => {
            let domain = domain.to_lowercase();
            domain == "localhost"
                || domain.ends_with(".localhost")
                || domain == "metadata.google.internal"
        }
        Host::Ipv4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
        }
        Host::Ipv6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.to_ipv4_mapped().is_some_and(|v4| {
                    v4.is_private() || v4.is_loopback() || v4.is_link_local()
                })
        }
    }
}
