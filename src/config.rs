//! Host configuration.
//!
//! Loaded once at startup from a TOML file. This covers the host side only
//! (which port to open, where the support files live); the stage's own
//! settings come from the GRBL startup file and live in
//! [`crate::stage::params::ParameterStore`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub stage: StageConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Connection and support-file settings for the stage.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageConfig {
    /// Serial port the GRBL controller is attached to.
    pub port: String,

    #[serde(default = "default_baud")]
    pub baud: u32,

    /// GRBL startup file: streamed line by line at connect, then parsed
    /// for `$` settings.
    pub startup_file: String,

    /// Where the last known position is saved at disconnect.
    #[serde(default = "default_position_file")]
    pub position_file: String,
}

/// Run-loop tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Where the run checkpoint record lives.
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: String,

    /// Minimum spacing between periodic checkpoint saves.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,

    /// How long to wait for the controller to acknowledge a command.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            checkpoint_file: default_checkpoint_file(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

fn default_baud() -> u32 {
    115200
}

fn default_position_file() -> String {
    "last_position.json".to_string()
}

fn default_checkpoint_file() -> String {
    "checkpoint.json".to_string()
}

fn default_checkpoint_interval_ms() -> u64 {
    1000
}

fn default_response_timeout_ms() -> u64 {
    5000
}

/// Load and parse the host configuration.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [stage]
            port = "/dev/ttyUSB0"
            startup_file = "startup.grbl"
            "#,
        )
        .unwrap();
        assert_eq!(config.stage.baud, 115200);
        assert_eq!(config.dispatch.checkpoint_interval_ms, 1000);
        assert_eq!(config.dispatch.checkpoint_file, "checkpoint.json");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config: Config = toml::from_str(
            r#"
            [stage]
            port = "COM3"
            baud = 9600
            startup_file = "grbl.cfg"

            [dispatch]
            checkpoint_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.stage.baud, 9600);
        assert_eq!(config.dispatch.checkpoint_interval_ms, 250);
    }
}
