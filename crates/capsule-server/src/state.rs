//! Shared application state.
//!
//! This module provides [`AppState`], which holds the [`Executor`] every
//! HTTP request handler runs jobs through.

use std::sync::Arc;

use capsule_common::{RuntimeConfig, RuntimeError};
use capsule_core::{Engine, Executor};
use capsule_host::default_api;

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    executor: Arc<Executor>,
}

impl AppState {
    /// Wrap an already configured executor.
    pub fn new(executor: Executor) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    /// Build an engine with the default host API from `config` and wrap it
    /// in an executor with no bus attached.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend or the HTTP client cannot be created.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let api = default_api(config.capabilities.clone())?;
        let engine = Engine::from_config(config, api)?;
        Ok(Self::new(Executor::new(engine)))
    }

    /// The executor jobs are run through.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// The executor's engine, if it has one.
    pub fn engine(&self) -> Option<&Engine> {
        self.executor.engine()
    }

    /// Registered job types, sorted.
    pub fn list_modules(&self) -> Vec<String> {
        self.engine().map(Engine::registered).unwrap_or_default()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("modules_count", &self.list_modules().len())
            .finish_non_exhaustive()
    }
}
