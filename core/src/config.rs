//! Layered configuration
//!
//! Built-in defaults, then an optional TOML file, then `CADENCE__*`
//! environment variables (`CADENCE__ENGINE__LANGUAGE=es`). A `.env` file is
//! loaded into the environment first.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "cadence.toml";
const ENV_PREFIX: &str = "CADENCE";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub language: String,
    /// Frames allowed on one call stack before FLOW calls are refused
    pub max_stack_depth: usize,
    pub max_template_depth: usize,
    pub ai_timeout_ms: u64,
    pub default_max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Guard against flows that loop without ever blocking
    pub max_steps_per_turn: usize,
    pub guidance: GuidanceSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            max_stack_depth: 20,
            max_template_depth: 10,
            ai_timeout_ms: 1000,
            default_max_retries: 2,
            retry_base_delay_ms: 500,
            max_steps_per_turn: 1000,
            guidance: GuidanceSettings::default(),
        }
    }
}

/// Help/cancel hints attached to SAY-GET prompts
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuidanceSettings {
    pub enabled: bool,
    pub position: GuidancePosition,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GuidancePosition {
    Prepend,
    #[default]
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub with_target: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    language: Option<String>,
    skip_env: bool,
}

impl ConfigBuilder {
    /// Explicit config file; it must exist. Without one, `cadence.toml` is
    /// read if present.
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Language override applied after every other source
    pub fn language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    /// Ignore `.env` and process environment variables
    pub fn without_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn build(self) -> Result<Config> {
        let defaults = config::Config::try_from(&Config::default())
            .context("Failed to serialize default configuration")?;
        let mut builder = config::Config::builder().add_source(defaults);

        builder = match &self.config_path {
            Some(path) => builder.add_source(config::File::from(path.clone()).required(true)),
            None => builder.add_source(
                config::File::with_name(DEFAULT_CONFIG_FILE)
                    .format(config::FileFormat::Toml)
                    .required(false),
            ),
        };

        if !self.skip_env {
            dotenvy::dotenv().ok();
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let mut config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if let Some(language) = self.language {
            config.engine.language = language;
        }
        Ok(config)
    }
}
