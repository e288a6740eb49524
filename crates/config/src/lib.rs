//! Configuration management for the voice agent
//!
//! Supports loading configuration from:
//! - TOML files (`config/default.toml`, `config/{env}.toml`)
//! - Environment variables (`VOICEBOT__SECTION__KEY`)
//! - Well-known credential variables (`SARVAM_API_KEY`, `GOOGLE_API_KEY`)

pub mod constants;
pub mod pipeline;
pub mod services;
pub mod settings;

pub use pipeline::PipelineConfig;
pub use services::{LlmProvider, LlmSettings, SttSettings, TtsSettings};
pub use settings::{
    load_settings, AgentConfig, ObservabilityConfig, RuntimeEnvironment, ServerConfig, Settings,
    TurnServerConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
