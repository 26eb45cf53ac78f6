// Engine configuration.
// Logging defaults to on in debug builds and off in release builds.

use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// HTTP API port of an SRS server.
pub const DEFAULT_API_PORT: u16 = 1985;

/// Everything the engine reads at construction time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub api_port: u16,
    pub api_prefix: String,
    pub signaling: SignalingConfig,
    pub retry: RetryPolicy,
    pub ice: IceConfig,
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
    /// How long a disconnected connection may take to recover
    pub disconnect_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_port: DEFAULT_API_PORT,
            api_prefix: "/rtc/v1".into(),
            signaling: SignalingConfig::default(),
            retry: RetryPolicy::default(),
            ice: IceConfig::default(),
            capture: CaptureConfig::default(),
            logging: LoggingConfig::default(),
            disconnect_grace_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_port == 0 {
            return Err(ConfigError::Invalid("api_port must be non-zero".into()));
        }
        if !self.api_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "api_prefix must start with '/': {}",
                self.api_prefix
            )));
        }
        self.capture.validate()?;
        self.retry.validate()?;
        crate::peer::ice::validate_ice_servers(&self.ice.servers)?;
        Ok(())
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

/// Timeouts of the signaling HTTP client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
        }
    }
}

impl SignalingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// reqwest has no separate write timeout, so the whole request
    /// (upload plus response) is bounded by write + read.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.saturating_add(self.read_timeout_ms))
    }
}

/// Bounded exponential backoff for signaling transport failures.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 4_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts the
    /// attempts already made (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0) as u64;
        if self.jitter && capped > 0 {
            // up to 20% either way
            let spread = capped / 5;
            let offset = rand::random_range(0..=spread * 2);
            Duration::from_millis(capped - spread + offset)
        } else {
            Duration::from_millis(capped)
        }
    }
}

/// ICE gathering and server list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct IceConfig {
    pub gathering_timeout_ms: u64,
    pub servers: Vec<ServerConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            gathering_timeout_ms: 5_000,
            servers: crate::peer::ice::default_ice_servers(),
        }
    }
}

impl IceConfig {
    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }
}

/// Capture format used when the local media source is started.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

impl CaptureConfig {
    pub fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            frame_rate,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "capture size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.frame_rate == 0 {
            return Err(ConfigError::Invalid("capture frame_rate must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(debug_assertions),
            level: "info".into(),
        }
    }
}
