//! Configuration module for the video ingest server.
//!
//! This module handles loading and validating configuration from TOML files.
//! Configuration can be loaded from a file path or from default locations.
//!
//! # Configuration Sources (in order of priority)
//! 1. `config.local.toml` - Local overrides (gitignored)
//! 2. `config.toml` - Main configuration file
//! 3. Default values
//!
//! # Example
//! ```rust,ignore
//! let config = Config::load("config.toml")?;
//! println!("Server will listen on {}:{}", config.server.host, config.server.port);
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub chunk_index: ChunkIndexConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind the public API to
    pub host: String,
    /// Port for the public API
    pub port: u16,
    /// Host to bind the admin API to (should be localhost)
    pub admin_host: String,
    /// Port for the admin API
    pub admin_port: u16,
    /// Base URL for generating stream URLs
    pub base_url: String,
    /// Request timeout in seconds
    pub request_timeout: u64,
    /// Cache-Control max-age for streamed assets in seconds
    pub cache_max_age: u64,
    /// Cleanup interval for expired sessions in seconds
    pub cleanup_interval_seconds: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all data
    pub data_dir: PathBuf,
    /// Directory for assembled originals (relative to data_dir)
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,
    /// Directory for in-flight chunks (relative to data_dir)
    #[serde(default = "default_chunks_dir")]
    pub chunks_dir: String,
    /// Directory for generated thumbnails (relative to data_dir)
    #[serde(default = "default_thumbnails_dir")]
    pub thumbnails_dir: String,
}

fn default_uploads_dir() -> String {
    "uploads".to_string()
}

fn default_chunks_dir() -> String {
    "chunks".to_string()
}

fn default_thumbnails_dir() -> String {
    "thumbnails".to_string()
}

impl StorageConfig {
    /// Get the full path to the uploads directory
    pub fn uploads_path(&self) -> PathBuf {
        self.data_dir.join(&self.uploads_dir)
    }

    /// Get the full path to the chunks directory
    pub fn chunks_path(&self) -> PathBuf {
        self.data_dir.join(&self.chunks_dir)
    }

    /// Get the full path to the thumbnails directory
    pub fn thumbnails_path(&self) -> PathBuf {
        self.data_dir.join(&self.thumbnails_dir)
    }
}

/// Upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Maximum declared file size for a chunked upload (bytes)
    pub max_file_size: u64,
    /// Maximum size of a single chunk part (bytes)
    pub max_chunk_size: u64,
    /// Upload session lifetime in seconds
    pub session_ttl_seconds: u64,
}

/// Work bus configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent chunk commit workers (the chunk pipeline prefetch)
    #[serde(default = "default_chunk_workers")]
    pub chunk_workers: usize,
    /// Number of concurrent assembly workers
    #[serde(default = "default_assembly_workers")]
    pub assembly_workers: usize,
    /// Number of concurrent post-processing workers
    #[serde(default = "default_process_workers")]
    pub process_workers: usize,
    /// Maximum retry count before a message is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_chunk_workers() -> usize {
    5
}

fn default_assembly_workers() -> usize {
    1
}

fn default_process_workers() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            chunk_workers: default_chunk_workers(),
            assembly_workers: default_assembly_workers(),
            process_workers: default_process_workers(),
            max_retries: default_max_retries(),
        }
    }
}

/// Post-processing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Seconds before the optimised thumbnail path gives up and the
    /// midpoint strategy takes over
    #[serde(default = "default_thumbnail_timeout")]
    pub thumbnail_timeout_seconds: u64,
    /// Blobs larger than this take the fixed-seek thumbnail path (bytes)
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,
}

fn default_thumbnail_timeout() -> u64 {
    60
}

fn default_large_file_threshold() -> u64 {
    1024 * 1024 * 1024
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            thumbnail_timeout_seconds: default_thumbnail_timeout(),
            large_file_threshold: default_large_file_threshold(),
        }
    }
}

/// Chunk index configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkIndexConfig {
    /// Whether the fast chunk index is used; when disabled the session
    /// manager always takes the serialised database path
    #[serde(default = "default_index_enabled")]
    pub enabled: bool,
    /// Key TTL in seconds, refreshed on every write
    #[serde(default = "default_index_ttl")]
    pub ttl_seconds: u64,
}

fn default_index_enabled() -> bool {
    true
}

fn default_index_ttl() -> u64 {
    24 * 60 * 60
}

impl Default for ChunkIndexConfig {
    fn default() -> Self {
        Self {
            enabled: default_index_enabled(),
            ttl_seconds: default_index_ttl(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Maximum chunk uploads per IP per window
    pub chunk_uploads_per_window: u32,
    /// Window duration in seconds
    pub window_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Config {
    /// Load configuration from a file path
    ///
    /// # Arguments
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Tries to load from:
    /// 1. `config.local.toml` (if exists)
    /// 2. `config.toml`
    ///
    /// # Errors
    /// Returns `ConfigError` if no configuration file is found
    pub fn load_default() -> Result<Self, ConfigError> {
        // Try local config first
        if Path::new("config.local.toml").exists() {
            return Self::load("config.local.toml");
        }

        // Fall back to main config
        if Path::new("config.toml").exists() {
            return Self::load("config.toml");
        }

        Err(ConfigError::ValidationError(
            "No configuration file found. Expected config.toml or config.local.toml".to_string(),
        ))
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        // Declared file size is capped at 5 GiB
        const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;
        if self.upload.max_file_size == 0 || self.upload.max_file_size > MAX_FILE_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "max_file_size must be between 1 and {} bytes",
                MAX_FILE_SIZE
            )));
        }

        // Chunk parts are bounded per request
        if self.upload.max_chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.upload.session_ttl_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "session_ttl_seconds must be greater than 0".to_string(),
            ));
        }

        if self.queue.chunk_workers == 0
            || self.queue.assembly_workers == 0
            || self.queue.process_workers == 0
        {
            return Err(ConfigError::ValidationError(
                "worker counts must be greater than 0".to_string(),
            ));
        }

        // Validate base_url doesn't have trailing slash
        if self.server.base_url.ends_with('/') {
            return Err(ConfigError::ValidationError(
                "base_url should not have a trailing slash".to_string(),
            ));
        }

        Ok(())
    }
}
