//! HTTP front door for capsule.
//!
//! This crate exposes an [`Executor`](capsule_core::Executor) over HTTP:
//!
//! - `POST|GET /functions/:job_type` runs a job and answers with its raw
//!   output, or with `{"status":..,"message":..}` when it fails
//! - Health, readiness, module listing and engine metrics
//! - An optional token-guarded Admin API for module management
//!
//! # Quick Start
//!
//! ```ignore
//! use capsule_common::RuntimeConfig;
//! use capsule_server::{AppState, CapsuleServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = AppState::from_config(&RuntimeConfig::default())?;
//!     CapsuleServer::new(state, ServerConfig::default()).run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod handler;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use response::ErrorBody;
pub use router::{AdminRouterConfig, build_router, build_router_with_admin};
pub use server::{CapsuleServer, ServerConfig, TestHandle};
pub use state::AppState;
