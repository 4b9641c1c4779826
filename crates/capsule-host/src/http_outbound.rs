//! Outbound HTTP for guests: the `fetch_url` host function.
//!
//! `fetch_url(method, url_ptr, url_len, body_ptr, body_len)` performs a
//! request and leaves the response body as the FFI result. Every request goes
//! through [`check_destination`](crate::guard::check_destination) first, every
//! redirect hop through [`check_url`](crate::guard::check_url), and each hop
//! gets an `Authorization` header when the Auth capability has a rule for its
//! host.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::{redirect, Client, Method, Response, StatusCode};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};
use url::Url;

use capsule_common::{Capability, CapabilityConfig, HostFunctionError, RuntimeError};
use capsule_core::{HostFn, InstanceContext};

use crate::guard::{check_destination, check_url};

/// Import name of the HTTP host function.
pub const FETCH_URL: &str = "fetch_url";

/// Default limit on the response body handed back to a guest.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Redirects followed before a request is given up.
pub const MAX_REDIRECTS: usize = 10;

/// HTTP method, numbered as guests pass it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Decode the guest's method number.
    pub fn from_i32(method: i32) -> Option<Self> {
        match method {
            0 => Some(HttpMethod::Get),
            1 => Some(HttpMethod::Head),
            2 => Some(HttpMethod::Options),
            3 => Some(HttpMethod::Post),
            4 => Some(HttpMethod::Put),
            5 => Some(HttpMethod::Patch),
            6 => Some(HttpMethod::Delete),
            _ => None,
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// An outbound request that passed the destination checks.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Target URL.
    pub url: Url,
    /// Request body.
    pub body: Option<Vec<u8>>,
    /// Content type of the body.
    pub content_type: Option<&'static str>,
}

/// HTTP client shared by the outbound host functions (connection pooled).
///
/// Redirects are followed here rather than by reqwest so that every hop is
/// checked against the HTTP capability like the original destination.
#[derive(Debug, Clone)]
pub struct OutboundClient {
    client: Client,
    max_response_bytes: usize,
}

impl OutboundClient {
    /// Create a client with default timeouts.
    pub fn new() -> Result<Self, RuntimeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .redirect(redirect::Policy::none())
            .user_agent(concat!("capsule/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                RuntimeError::invalid_config(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self::with_client(client))
    }

    /// Wrap an existing client.
    ///
    /// The client should be built with `redirect::Policy::none()`; redirects
    /// it follows on its own bypass the destination checks.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            max_response_bytes: MAX_RESPONSE_BYTES,
        }
    }

    /// Set the largest response body handed back to a guest.
    #[must_use]
    pub fn with_max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }

    /// Perform `request` on behalf of the call owning `ctx`.
    ///
    /// Blocks the calling thread until the response body is read.
    pub fn send(
        &self,
        ctx: &InstanceContext,
        request: OutboundRequest,
    ) -> Result<Vec<u8>, HostFunctionError> {
        let exchange = Exchange {
            client: self.client.clone(),
            capabilities: Arc::clone(&ctx.capabilities),
            max_response_bytes: self.max_response_bytes,
        };
        block_on(exchange.run(request))?
    }
}

/// One guest request, including the redirects it leads to.
struct Exchange {
    client: Client,
    capabilities: Arc<CapabilityConfig>,
    max_response_bytes: usize,
}

impl Exchange {
    async fn run(self, request: OutboundRequest) -> Result<Vec<u8>, HostFunctionError> {
        let mut method = request.method.to_reqwest();
        let mut url = request.url;
        let mut body = request.body;

        for _ in 0..=MAX_REDIRECTS {
            let mut builder = self.client.request(method.clone(), url.clone());
            if let Some(value) = self.authorization(&url) {
                debug!(url = %url, "Injecting authorization header");
                builder = builder.header(AUTHORIZATION, value);
            }
            if let Some(content_type) = request.content_type {
                builder = builder.header(CONTENT_TYPE, content_type);
            }
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }

            debug!(method = %method, url = %url, "Executing outbound request");
            let response = builder.send().await.map_err(|e| {
                debug!(error = %e, "Outbound request failed");
                failed(&url, 0)
            })?;
            let status = response.status();

            if status.is_redirection() {
                if let Some(next) = redirect_target(&url, &response)? {
                    check_url(&self.capabilities.http, &next)?;
                    debug!(from = %url, to = %next, status = status.as_u16(), "Following redirect");

                    if status == StatusCode::SEE_OTHER
                        || (method == Method::POST
                            && matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND))
                    {
                        method = Method::GET;
                        body = None;
                    }
                    url = next;
                    continue;
                }
            }

            if status.as_u16() >= 400 {
                info!(url = %url, status = status.as_u16(), "Outbound request rejected upstream");
                return Err(failed(&url, status.as_u16()));
            }

            let body = self.read_body(&url, response).await?;
            info!(
                url = %url,
                status = status.as_u16(),
                body_size = body.len(),
                "Outbound request completed"
            );
            return Ok(body);
        }

        warn!(url = %url, max = MAX_REDIRECTS, "Too many redirects");
        Err(failed(&url, StatusCode::LOOP_DETECTED.as_u16()))
    }

    fn authorization(&self, url: &Url) -> Option<String> {
        if !self.capabilities.is_enabled(Capability::Auth) {
            return None;
        }
        url.host_str()
            .and_then(|host| self.capabilities.auth.header_for(host))
    }

    /// Read the body, giving up as soon as it is known to exceed the limit.
    async fn read_body(
        &self,
        url: &Url,
        mut response: Response,
    ) -> Result<Vec<u8>, HostFunctionError> {
        let max = self.max_response_bytes;
        let too_large = |size: String| {
            warn!(url = %url, max, "Outbound response too large");
            HostFunctionError::invalid_argument(format!(
                "response body of {size} bytes exceeds the {max} byte limit"
            ))
        };

        if let Some(length) = response.content_length() {
            if usize::try_from(length).map_or(true, |length| length > max) {
                return Err(too_large(length.to_string()));
            }
        }

        let status = response.status().as_u16();
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|_| failed(url, status))? {
            if body.len() + chunk.len() > max {
                return Err(too_large(format!("more than {max}")));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn failed(url: &Url, status: u16) -> HostFunctionError {
    HostFunctionError::HttpRequestFailed {
        url: url.to_string(),
        status,
    }
}

/// Where a 3xx response points, if it carries a usable `Location`.
fn redirect_target(url: &Url, response: &Response) -> Result<Option<Url>, HostFunctionError> {
    let Some(location) = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Ok(None);
    };

    let next = url.join(location).map_err(|e| {
        HostFunctionError::invalid_argument(format!("invalid redirect location '{location}': {e}"))
    })?;
    match next.scheme() {
        "http" | "https" => Ok(Some(next)),
        other => Err(HostFunctionError::permission_denied(format!(
            "redirect to {other} URL"
        ))),
    }
}

/// Drive `future` to completion from synchronous host code.
///
/// Host functions usually run on the blocking pool, but pre-warming runs
/// guest initializers on whatever thread registers the module, which may be
/// an async worker. On a multi-threaded runtime the ambient runtime is used
/// through `block_in_place`; anywhere else a dedicated current-thread runtime
/// runs the future on its own thread.
pub(crate) fn block_on<F>(future: F) -> Result<F::Output, HostFunctionError>
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(|| handle.block_on(future)))
        }
        Ok(_) => std::thread::scope(|scope| {
            scope
                .spawn(|| block_on_dedicated(future))
                .join()
                .unwrap_or_else(|_| Err(runtime_unavailable("request thread panicked")))
        }),
        Err(_) => block_on_dedicated(future),
    }
}

fn block_on_dedicated<F: Future>(future: F) -> Result<F::Output, HostFunctionError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| runtime_unavailable(&e.to_string()))?;
    Ok(runtime.block_on(future))
}

fn runtime_unavailable(reason: &str) -> HostFunctionError {
    HostFunctionError::HttpRequestFailed {
        url: format!("<runtime unavailable: {reason}>"),
        status: 0,
    }
}

/// The `fetch_url` host function, owned by the HTTP capability.
pub fn fetch_url(client: OutboundClient) -> HostFn {
    HostFn::new(FETCH_URL, 5, Capability::Http, move |call, args| {
        let method = HttpMethod::from_i32(args[0]).ok_or_else(|| {
            HostFunctionError::invalid_argument(format!("unknown HTTP method {}", args[0]))
        })?;
        let raw_url = call.read_str(args[1], args[2])?.to_string();
        let body = call.read(args[3], args[4])?.to_vec();

        let url = check_destination(call.ctx, &raw_url)?;
        let response = client.send(
            call.ctx,
            OutboundRequest {
                method,
                url,
                body: (!body.is_empty()).then_some(body),
                content_type: None,
            },
        )?;

        Ok(call.ctx.set_ffi_result(response))
    })
}
