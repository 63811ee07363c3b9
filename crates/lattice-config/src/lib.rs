//! # Lattice Config
//!
//! Handles configuration loading from files and environment variables.

pub mod validation;

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use validation::validate;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub datastore: DatastoreConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            worker_threads: default_worker_threads(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    50051
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Quantization window for the optimized revision, in milliseconds.
    #[serde(default = "default_revision_quantization_ms")]
    pub revision_quantization_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u8,

    #[serde(default = "default_watch_buffer_length")]
    pub watch_buffer_length: usize,

    #[serde(default = "default_gc_enabled")]
    pub gc_enabled: bool,

    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,

    #[serde(default = "default_gc_window_secs")]
    pub gc_window_secs: u64,

    #[serde(default = "default_gc_timeout_secs")]
    pub gc_timeout_secs: u64,

    #[serde(default = "default_gc_batch_delete_size")]
    pub gc_batch_delete_size: usize,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            revision_quantization_ms: default_revision_quantization_ms(),
            max_retries: default_max_retries(),
            watch_buffer_length: default_watch_buffer_length(),
            gc_enabled: default_gc_enabled(),
            gc_interval_secs: default_gc_interval_secs(),
            gc_window_secs: default_gc_window_secs(),
            gc_timeout_secs: default_gc_timeout_secs(),
            gc_batch_delete_size: default_gc_batch_delete_size(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_revision_quantization_ms() -> u64 {
    5
}

fn default_max_retries() -> u8 {
    10
}

fn default_watch_buffer_length() -> usize {
    128
}

fn default_gc_enabled() -> bool {
    true
}

fn default_gc_interval_secs() -> u64 {
    180
}

fn default_gc_window_secs() -> u64 {
    24 * 60 * 60
}

fn default_gc_timeout_secs() -> u64 {
    60
}

fn default_gc_batch_delete_size() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// This node's member id on the hashring.
    #[serde(default = "default_member_id")]
    pub member_id: String,

    /// Peer addresses, `id=host:port`.
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_replication_factor")]
    pub replication_factor: u16,

    #[serde(default = "default_dispatch_timeout_secs")]
    pub overall_timeout_secs: u64,

    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            member_id: default_member_id(),
            peers: Vec::new(),
            replication_factor: default_replication_factor(),
            overall_timeout_secs: default_dispatch_timeout_secs(),
            concurrency_limit: default_concurrency_limit(),
            max_depth: default_max_depth(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_member_id() -> String {
    "node-0".to_string()
}

fn default_replication_factor() -> u16 {
    100
}

fn default_dispatch_timeout_secs() -> u64 {
    60
}

fn default_concurrency_limit() -> usize {
    10
}

fn default_max_depth() -> u32 {
    50
}

fn default_cache_capacity() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// "pretty", "compact", or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default)]
    pub log_filter: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_format: default_log_format(), log_filter: None }
    }
}

fn default_log_format() -> String {
    "compact".to_string()
}

/// Load configuration from a file (if present) layered under
/// `LATTICE_`-prefixed environment variables.
pub fn load(path: &str) -> Result<Config, ConfigError> {
    let mut builder = ConfigBuilder::builder();
    if Path::new(path).exists() {
        builder = builder.add_source(File::with_name(path));
    }
    let raw = builder
        .add_source(Environment::with_prefix("LATTICE").separator("__"))
        .build()?;

    let config: Config = raw.try_deserialize()?;
    validate(&config)?;
    Ok(config)
}

/// Load configuration, falling back to defaults when the file is missing
/// or malformed.
pub fn load_or_default(path: &str) -> Config {
    match load(path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, path, "using default configuration");
            Config::default()
        }
    }
}
