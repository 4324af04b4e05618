//! Configuration module for the events tracker
//!
//! Handles configuration loading from TOML files and environment variables,
//! and provides structured configuration types for each pipeline component.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::batch::ENVELOPE_OVERHEAD;

/// Main tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Collector endpoint configuration
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Flush scheduling and batching
    #[serde(default)]
    pub flush: FlushConfig,

    /// Trace identity
    #[serde(default)]
    pub trace: TraceConfig,

    /// Library metadata reported in the event context
    #[serde(default)]
    pub library: LibraryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Base URL; events are posted to `{endpoint_base}/v1/events`
    #[serde(default = "default_endpoint_base")]
    pub endpoint_base: String,

    /// API key sent as a bearer token
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout applied only to teardown drains
    #[serde(default = "default_teardown_timeout")]
    pub teardown_timeout_ms: u64,

    /// Additional headers added to every collector request
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    /// Delay used while healthy, and the first retry delay after a failure
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Jitter fraction (0.0 to 1.0) applied to scheduled delays
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Largest serialized request body the tracker will send
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Workflow key; enables trace id persistence with a sliding TTL
    #[serde(default)]
    pub workflow_identifier: Option<String>,

    /// Directory of the sled database holding persisted trace ids
    #[serde(default)]
    pub store_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    #[serde(default = "default_library_name")]
    pub name: String,

    #[serde(default = "default_library_version")]
    pub version: String,
}

// Default value functions
fn default_endpoint_base() -> String { "https://api.revenuecat.com".to_string() }
fn default_teardown_timeout() -> u64 { 2_000 }
fn default_initial_delay() -> u64 { 1_000 }
fn default_max_delay() -> u64 { 60_000 }
fn default_jitter() -> f64 { 0.1 }
fn default_max_batch_bytes() -> usize { 50_000 }
fn default_library_name() -> String { "purchases-js".to_string() }
fn default_library_version() -> String { env!("CARGO_PKG_VERSION").to_string() }

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            endpoint_base: default_endpoint_base(),
            api_key: None,
            teardown_timeout_ms: default_teardown_timeout(),
            extra_headers: BTreeMap::new(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
            max_batch_bytes: default_max_batch_bytes(),
        }
    }
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            name: default_library_name(),
            version: default_library_version(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            collector: CollectorConfig::default(),
            flush: FlushConfig::default(),
            trace: TraceConfig::default(),
            library: LibraryConfig::default(),
        }
    }
}

impl CollectorConfig {
    /// Full URL of the events endpoint
    pub fn events_url(&self) -> String {
        format!("{}/v1/events", self.endpoint_base.trim_end_matches('/'))
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

impl FlushConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl TrackerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: TrackerConfig =
            toml::from_str(&content).map_err(|e| anyhow!("Failed to parse TOML config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Create configuration from defaults with environment overrides
    pub fn with_env_overrides() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply environment variables on top of the current values
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("EVENTS_ENDPOINT_BASE") {
            self.collector.endpoint_base = endpoint;
        }

        if let Ok(api_key) = std::env::var("EVENTS_API_KEY") {
            self.collector.api_key = Some(api_key);
        }

        if let Ok(workflow) = std::env::var("EVENTS_WORKFLOW_IDENTIFIER") {
            self.trace.workflow_identifier = Some(workflow);
        }

        if let Ok(path) = std::env::var("EVENTS_STORE_PATH") {
            self.trace.store_path = Some(path);
        }

        if let Ok(bytes) = std::env::var("EVENTS_MAX_BATCH_BYTES") {
            self.flush.max_batch_bytes = bytes
                .parse()
                .map_err(|e| anyhow!("Invalid EVENTS_MAX_BATCH_BYTES: {}", e))?;
        }

        self.validate()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        let endpoint = &self.collector.endpoint_base;
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(anyhow!("endpoint_base must be an http(s) URL, got {}", endpoint));
        }
        if self.flush.initial_delay_ms == 0 {
            return Err(anyhow!("initial_delay_ms must be > 0"));
        }
        if self.flush.max_delay_ms < self.flush.initial_delay_ms {
            return Err(anyhow!("max_delay_ms must be >= initial_delay_ms"));
        }
        if !(0.0..=1.0).contains(&self.flush.jitter) {
            return Err(anyhow!("jitter must be in range [0.0, 1.0]"));
        }
        if self.flush.max_batch_bytes <= ENVELOPE_OVERHEAD {
            return Err(anyhow!(
                "max_batch_bytes must be > {} (request envelope size)",
                ENVELOPE_OVERHEAD
            ));
        }
        if let Some(workflow) = &self.trace.workflow_identifier {
            if workflow.trim().is_empty() {
                return Err(anyhow!("workflow_identifier must not be blank"));
            }
        }
        Ok(())
    }
}
