//! Receiver configuration
//!
//! Settings are read from an optional JSON file, then overridden by
//! `GVSP_*` environment variables. Every field has a default, so an empty
//! object (or no file at all) yields a usable configuration.
//!
//! # Example
//!
//! ```json
//! {
//!   "listen_ip": "192.168.10.10",
//!   "listen_port": 49152,
//!   "width": 1920,
//!   "height": 1200,
//!   "output_dir": "/var/lib/gvsp/segments",
//!   "duplicate_policy": "keep-first"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame_assembler::DuplicatePolicy;
use crate::frame_validation::FrameGeometry;
use crate::gvsp_header::LEADER_MIN_LEN;

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid JSON for this schema.
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// An environment override could not be parsed.
    #[error("invalid value '{value}' for {var}")]
    InvalidEnv {
        /// Environment variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },

    /// A setting is out of range.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Read-only settings supplied to the receiver at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Local address to bind the UDP socket to
    pub listen_ip: String,
    /// Local UDP port
    pub listen_port: u16,
    /// Receive buffer size, the largest datagram accepted
    pub buffer_size: usize,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Length of one recorded segment in seconds
    pub segment_duration_secs: f64,
    /// Directory for recorded segments (`None` disables recording)
    pub output_dir: Option<PathBuf>,
    /// Capacity of the queue between receive and assembly
    pub datagram_queue_capacity: usize,
    /// Capacity of the queue between assembly and the sink
    pub frame_queue_capacity: usize,
    /// Socket read timeout; bounds how long a stop request can go unnoticed
    pub read_timeout_ms: u64,
    /// Handling of repeated packet ids within one frame
    pub duplicate_policy: DuplicatePolicy,
    /// Directory for raw datagram captures (`None` disables capture)
    pub capture_dir: Option<PathBuf>,
    /// Stop capturing once the datagram file reaches this size (0 = unbounded)
    pub capture_max_bytes: u64,
    /// Replay this capture file instead of listening on the network
    pub replay_path: Option<PathBuf>,
    /// Replay speed multiplier (1.0 = realtime, 0.0 = as fast as possible)
    pub replay_speed: f64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 49152,
            buffer_size: 9014,
            width: 1920,
            height: 1200,
            segment_duration_secs: 300.0,
            output_dir: None,
            datagram_queue_capacity: 4096,
            frame_queue_capacity: 4,
            read_timeout_ms: 100,
            duplicate_policy: DuplicatePolicy::KeepFirst,
            capture_dir: None,
            capture_max_bytes: 1 << 30,
            replay_path: None,
            replay_speed: 1.0,
        }
    }
}

impl ReceiverConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read and
    /// `ConfigError::Json` if it does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path` when given, apply environment overrides and validate
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded, an override does not
    /// parse, or the resulting configuration is invalid.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GVSP_*` environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnv` if a numeric variable does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(ip) = lookup("GVSP_LISTEN_IP") {
            self.listen_ip = ip;
        }
        if let Some(port) = lookup("GVSP_LISTEN_PORT") {
            self.listen_port = parse_env("GVSP_LISTEN_PORT", port)?;
        }
        if let Some(width) = lookup("GVSP_WIDTH") {
            self.width = parse_env("GVSP_WIDTH", width)?;
        }
        if let Some(height) = lookup("GVSP_HEIGHT") {
            self.height = parse_env("GVSP_HEIGHT", height)?;
        }
        if let Some(dir) = lookup("GVSP_OUTPUT_DIR") {
            self.output_dir = Some(PathBuf::from(dir));
        }
        if let Some(policy) = lookup("GVSP_DUPLICATE_POLICY") {
            self.duplicate_policy = DuplicatePolicy::from_env_str(&policy);
        }
        Ok(())
    }

    /// Check that all settings are usable
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first bad setting.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.buffer_size < LEADER_MIN_LEN {
            return Err(ConfigError::Invalid(format!(
                "buffer_size {} is smaller than a {}-byte leader",
                self.buffer_size, LEADER_MIN_LEN
            )));
        }
        if self.datagram_queue_capacity == 0 || self.frame_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue capacities must be non-zero".to_string(),
            ));
        }
        if !self.segment_duration_secs.is_finite() || self.segment_duration_secs <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "segment_duration_secs {} must be positive",
                self.segment_duration_secs
            )));
        }
        if self.replay_speed.is_nan() || self.replay_speed < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "replay_speed {} must not be negative",
                self.replay_speed
            )));
        }
        Ok(())
    }

    /// Sensor geometry
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.width, self.height)
    }

    /// `ip:port` string to bind
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_ip, self.listen_port)
    }

    /// Segment duration as a `Duration`
    pub fn segment_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.segment_duration_secs).unwrap_or(Duration::MAX)
    }

    /// Socket read timeout as a `Duration` (never zero)
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}
