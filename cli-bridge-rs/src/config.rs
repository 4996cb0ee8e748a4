//! Bridge configuration
//!
//! Values come from built-in defaults, an optional config file and
//! `CLI_BRIDGE__`-prefixed environment variables, in increasing priority.
//! Nested keys use `__`, e.g. `CLI_BRIDGE__PIPELINE__CHANNEL_CAPACITY=32`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use resilience::{CircuitBreakerConfig, LoggingConfig};

use crate::error::{BridgeError, Result};
use crate::framer::DEFAULT_MAX_MESSAGE_SIZE;
use crate::normalizer::{NormalizerConfig, OrphanPolicy};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "CLI_BRIDGE";

/// Where and how to launch the assistant CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Executable name or path
    pub executable: PathBuf,
    /// Project directory used when a session does not name one
    pub project_path: Option<PathBuf>,
    /// Extra environment for the child process
    pub env: HashMap<String, String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("claude"),
            project_path: None,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Upper bound on a chunk's content, in characters
    pub max_message_size: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Envelopes buffered between the pipeline and a slow consumer
    pub channel_capacity: usize,
    /// Bytes read from stdout per call
    pub read_buffer_size: usize,
    /// How long to wait for the process to exit once stdout closes
    pub exit_grace_ms: u64,
    /// Relaunch attempts per session after process failures
    pub max_restarts: u32,
    pub stdin_write_timeout_ms: u64,
    /// Normalization slower than this is logged
    pub slow_normalize_ms: u64,
    pub orphan_policy: OrphanPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 16,
            read_buffer_size: 8192,
            exit_grace_ms: 2000,
            max_restarts: 3,
            stdin_write_timeout_ms: 5000,
            slow_normalize_ms: 5,
            orphan_policy: OrphanPolicy::Assistant,
        }
    }
}

impl PipelineConfig {
    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn stdin_write_timeout(&self) -> Duration {
        Duration::from_millis(self.stdin_write_timeout_ms)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub cli: CliConfig,
    /// Used for the global breaker and every per-session breaker
    pub breaker: CircuitBreakerConfig,
    pub framing: FramingConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
    /// Reported in envelope metadata
    pub version: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cli: CliConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            framing: FramingConfig::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl BridgeConfig {
    /// Loads defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: BridgeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        self.breaker.validate()?;

        if self.cli.executable.as_os_str().is_empty() {
            return Err(BridgeError::configuration("cli.executable must not be empty"));
        }
        if self.framing.max_message_size == 0 {
            return Err(BridgeError::configuration("framing.max_message_size must be positive"));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(BridgeError::configuration("pipeline.channel_capacity must be positive"));
        }
        if self.pipeline.read_buffer_size == 0 {
            return Err(BridgeError::configuration("pipeline.read_buffer_size must be positive"));
        }
        Ok(())
    }

    /// Normalizer settings derived from this configuration
    pub fn normalizer_config(&self) -> NormalizerConfig {
        NormalizerConfig {
            max_message_size: self.framing.max_message_size,
            orphan_policy: self.pipeline.orphan_policy,
            slow_threshold: Duration::from_millis(self.pipeline.slow_normalize_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.timeout_ms, 30_000);
        assert_eq!(config.breaker.monitoring_window_ms, 60_000);
        assert_eq!(config.breaker.half_open_max_calls, 3);
        assert_eq!(config.framing.max_message_size, 50_000);
        assert_eq!(config.pipeline.channel_capacity, 16);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
version = "9.9.9"

[cli]
executable = "/usr/local/bin/assistant"

[breaker]
failure_threshold = 2

[pipeline]
channel_capacity = 4
orphan_policy = "system"
"#
        )
        .unwrap();

        let config = BridgeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.version, "9.9.9");
        assert_eq!(config.cli.executable, PathBuf::from("/usr/local/bin/assistant"));
        assert_eq!(config.breaker.failure_threshold, 2);
        // Unset fields keep their defaults
        assert_eq!(config.breaker.half_open_max_calls, 3);
        assert_eq!(config.pipeline.channel_capacity, 4);
        assert_eq!(config.pipeline.orphan_policy, OrphanPolicy::System);
        assert_eq!(config.pipeline.read_buffer_size, 8192);
    }

    #[test]
    fn test_environment_overrides_defaults() {
        std::env::set_var("CLI_BRIDGE__PIPELINE__MAX_RESTARTS", "7");
        let loaded = BridgeConfig::load(None);
        std::env::remove_var("CLI_BRIDGE__PIPELINE__MAX_RESTARTS");

        let config = loaded.unwrap();
        assert_eq!(config.pipeline.max_restarts, 7);
        assert_eq!(config.pipeline.channel_capacity, 16);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pipeline]\nchannel_capacity = 0").unwrap();

        let err = BridgeConfig::load(Some(file.path())).unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = BridgeConfig::load(Some(Path::new("/nonexistent/cli-bridge.toml"))).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
    }

    #[test]
    fn test_zero_breaker_threshold_is_rejected() {
        let mut config = BridgeConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
