//! Host configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use wasmhost_types::RetryConfig;

/// Knobs for running guest code.
///
/// Loaded from JSON; every field is optional and falls back to
/// [`HostConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Fuel budget per call; `None` runs guests unmetered.
    pub fuel_limit: Option<u64>,
    /// Log each dispatch function invocation.
    pub host_tracing: bool,
    /// Log every guest import call (object, key, type, sizes).
    pub host_tracing_all: bool,
    /// Backoff for re-running view calls whose reads were invalidated.
    pub retry: RetryConfig,
    /// Overall budget for one view call including retries, in milliseconds.
    pub view_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            fuel_limit: Some(1_000_000_000),
            host_tracing: false,
            host_tracing_all: false,
            retry: RetryConfig::default(),
            view_timeout_ms: 5_000,
        }
    }
}

impl HostConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse host config")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read host config {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn view_timeout(&self) -> Duration {
        Duration::from_millis(self.view_timeout_ms)
    }

    pub fn traces_dispatch(&self) -> bool {
        self.host_tracing || self.traces_all()
    }

    pub fn traces_all(&self) -> bool {
        self.host_tracing_all || cfg!(feature = "trace-all")
    }
}
