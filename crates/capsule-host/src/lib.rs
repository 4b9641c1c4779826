//! Capability host functions for capsule.
//!
//! This crate provides the host functions guests reach through the `env`
//! import module, on top of the calling-convention functions in
//! `capsule-core`.
//!
//! # Functions
//!
//! - [`logging`]: `log_msg`, owned by the Logger capability
//! - [`http_outbound`]: `fetch_url`, owned by the HTTP capability
//! - [`graphql`]: `graphql_query`, owned by the GraphQL capability
//!
//! # Security Model
//!
//! 1. **Capabilities**: A disabled capability answers with
//!    `{"code":1,"message":"capability is not enabled"}` before any of its
//!    code runs.
//! 2. **Destinations**: Outbound requests are checked against the allowed
//!    domains and blocked from private addresses ([`guard`]).
//! 3. **Budget**: Outbound requests are limited per call.
//! 4. **Auth**: Authorization headers are injected by the host; guests never
//!    see the credentials.

pub mod api;
pub mod graphql;
pub mod guard;
pub mod http_outbound;
pub mod logging;

pub use api::{default_api, default_api_with_client};
pub use http_outbound::{HttpMethod, OutboundClient};
