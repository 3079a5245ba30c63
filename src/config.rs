//! Engine configuration module
//!
//! Parses the per-connection engine settings from YAML (or TOML) files.
//! Every field has a default, so an empty document is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Smallest output buffer we accept. Anything below this makes the
/// batcher degrade into one queue allocation per packet.
pub const MIN_OUTPUT_BUFFER: usize = 1024;

/// Keep-alive flood policy
///
/// A ping that arrives sooner than `min_interval_ms` after the previous one
/// counts as over-speed. More than `max_overspeed` over-speed pings in a row
/// closes the connection. `max_overspeed == 0` disables the cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPolicy {
    #[serde(default = "default_min_ping_interval")]
    pub min_interval_ms: u64,

    #[serde(default = "default_max_overspeed")]
    pub max_overspeed: u32,
}

impl PingPolicy {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl Default for PingPolicy {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_ping_interval(),
            max_overspeed: default_max_overspeed(),
        }
    }
}

/// Connection engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    // ============================================
    // Output batching
    // ============================================
    /// Capacity of the shared output buffer. Packets that do not fit go to
    /// the overflow queue.
    #[serde(default = "default_output_buffer_size")]
    pub output_buffer_size: usize,

    /// Interval between flush ticks driven by the reactor (ms)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    // ============================================
    // Input
    // ============================================
    /// Size of the scratch buffer used for each speculative read
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    /// Reject opcodes outside the known opcode range
    #[serde(default)]
    pub strict_opcodes: bool,

    // ============================================
    // Authentication & keep-alive
    // ============================================
    /// Keep the connection open after a failed auth attempt
    #[serde(default)]
    pub allow_auth_retry: bool,

    #[serde(default)]
    pub ping: PingPolicy,
}

// ============================================
// Default value functions
// These are called by serde when a field is missing
// ============================================

fn default_output_buffer_size() -> usize {
    64 * 1024
}

fn default_tick_interval_ms() -> u64 {
    10
}

fn default_read_chunk_size() -> usize {
    4096
}

fn default_min_ping_interval() -> u64 {
    27 * 1000
}

fn default_max_overspeed() -> u32 {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_buffer_size: default_output_buffer_size(),
            tick_interval_ms: default_tick_interval_ms(),
            read_chunk_size: default_read_chunk_size(),
            strict_opcodes: false,
            allow_auth_retry: false,
            ping: PingPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file. `.toml` files are parsed as TOML,
    /// everything else as YAML.
    ///
    /// # Example
    /// ```no_run
    /// use worldsocket::config::EngineConfig;
    ///
    /// let config = EngineConfig::from_file("conf/world.yaml")
    ///     .expect("Failed to load config");
    /// println!("output buffer: {}", config.output_buffer_size);
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let config: EngineConfig = if is_toml {
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML in {}", path.display()))?
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML in {}", path.display()))?
        };

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(contents)
            .context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)
            .context("Failed to parse TOML")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.output_buffer_size >= MIN_OUTPUT_BUFFER,
            "output_buffer_size too small: {} (min {})",
            self.output_buffer_size,
            MIN_OUTPUT_BUFFER
        );
        anyhow::ensure!(self.read_chunk_size > 0, "read_chunk_size cannot be zero");
        anyhow::ensure!(self.tick_interval_ms > 0, "tick_interval_ms cannot be zero");

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }
}
