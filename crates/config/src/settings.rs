//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::constants::{agent, env, server};
use crate::{ConfigError, LlmProvider, LlmSettings, PipelineConfig, SttSettings, TtsSettings};

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    /// Relaxed validation, warnings only
    #[default]
    Development,
    Staging,
    /// All validations enforced
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if strict validation should be applied
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub stt: SttSettings,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub tts: TtsSettings,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP and signaling server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Empty allows any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// STUN servers for WebRTC NAT traversal
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    /// TURN servers for WebRTC relay
    #[serde(default)]
    pub turn_servers: Vec<TurnServerConfig>,

    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Sessions open longer than this are closed
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Page served on `GET /`
    #[serde(default = "default_index_path")]
    pub index_path: String,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (e.g., "turn:turn.example.com:3478")
    pub url: String,
    pub username: String,
    pub credential: String,
}

fn default_host() -> String {
    server::HOST.to_string()
}

fn default_port() -> u16 {
    server::PORT
}

fn default_true() -> bool {
    true
}

fn default_stun_servers() -> Vec<String> {
    vec![server::STUN_SERVER.to_string()]
}

fn default_max_sessions() -> usize {
    100
}

fn default_session_timeout() -> u64 {
    3600
}

fn default_index_path() -> String {
    "index.html".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            stun_servers: default_stun_servers(),
            turn_servers: Vec::new(),
            max_sessions: default_max_sessions(),
            session_timeout_secs: default_session_timeout(),
            index_path: default_index_path(),
        }
    }
}

/// Conversation seeding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Persona instruction, first turn of every session
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Appended on connect so the assistant speaks first; empty disables
    #[serde(default = "default_greeting_prompt")]
    pub greeting_prompt: String,
}

fn default_system_prompt() -> String {
    agent::SYSTEM_PROMPT.to_string()
}

fn default_greeting_prompt() -> String {
    agent::GREETING_PROMPT.to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            greeting_prompt: default_greeting_prompt(),
        }
    }
}

/// Logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,

    /// Install the Prometheus recorder and serve `/metrics`
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

const SUPPORTED_SAMPLE_RATES: [u32; 6] = [8000, 16000, 22050, 24000, 44100, 48000];

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Fill unset API keys from the well-known environment variables
    pub fn apply_credential_fallbacks(&mut self) {
        self.apply_credential_fallbacks_with(|name| std::env::var(name).ok());
    }

    /// Same as [`apply_credential_fallbacks`](Self::apply_credential_fallbacks) with an injectable lookup
    pub fn apply_credential_fallbacks_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let sarvam = lookup(env::SARVAM_API_KEY).filter(|k| !k.is_empty());
        if self.stt.api_key.is_none() {
            self.stt.api_key = sarvam.clone();
        }
        if self.tts.api_key.is_none() {
            self.tts.api_key = sarvam;
        }
        if self.llm.api_key.is_none() && self.llm.provider == LlmProvider::Gemini {
            self.llm.api_key = lookup(env::GOOGLE_API_KEY).filter(|k| !k.is_empty());
        }
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_server()?;
        self.validate_pipeline()?;
        self.validate_services()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        let server = &self.server;

        if server.port == 0 {
            return Err(invalid("server.port", "Port cannot be 0"));
        }

        if server.max_sessions == 0 {
            return Err(invalid("server.max_sessions", "Must be at least 1"));
        }

        if self.environment.is_production() && server.cors_enabled && server.cors_origins.is_empty() {
            tracing::warn!("CORS is enabled in production with no origins configured, any origin is allowed");
        }

        Ok(())
    }

    fn validate_pipeline(&self) -> Result<(), ConfigError> {
        let pipeline = &self.pipeline;

        if pipeline.vad_threshold_db > 0.0 {
            return Err(invalid(
                "pipeline.vad_threshold_db",
                format!("Must be at most 0 dBFS, got {}", pipeline.vad_threshold_db),
            ));
        }

        if pipeline.turn_timeout_ms == 0 {
            return Err(invalid("pipeline.turn_timeout_ms", "Must be at least 1ms"));
        }

        if pipeline.max_utterance_ms < pipeline.min_speech_ms.max(1) {
            return Err(invalid(
                "pipeline.max_utterance_ms",
                format!("Must be at least min_speech_ms ({}ms)", pipeline.min_speech_ms),
            ));
        }

        if pipeline.cancel_grace_ms == 0 {
            return Err(invalid("pipeline.cancel_grace_ms", "Must be at least 1ms"));
        }

        if pipeline.channel_capacity == 0 {
            return Err(invalid("pipeline.channel_capacity", "Must be at least 1"));
        }

        Ok(())
    }

    fn validate_services(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.tts.sample_rate) {
            return Err(invalid(
                "tts.sample_rate",
                format!("Unsupported rate {}, expected one of {:?}", self.tts.sample_rate, SUPPORTED_SAMPLE_RATES),
            ));
        }

        if !(0.3..=3.0).contains(&self.tts.pace) {
            return Err(invalid("tts.pace", format!("Must be between 0.3 and 3.0, got {}", self.tts.pace)));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(invalid(
                "llm.temperature",
                format!("Must be between 0.0 and 2.0, got {}", self.llm.temperature),
            ));
        }

        let mut missing = Vec::new();
        if self.stt.api_key.is_none() {
            missing.push("stt.api_key");
        }
        if self.tts.api_key.is_none() {
            missing.push("tts.api_key");
        }
        if self.llm.provider == LlmProvider::Gemini && self.llm.api_key.is_none() {
            missing.push("llm.api_key");
        }

        // Sessions fail individually without credentials, so only strict
        // environments refuse to start.
        for field in &missing {
            if self.environment.is_strict() {
                return Err(ConfigError::MissingField(field.to_string()));
            }
            tracing::warn!(field, "Credential not configured, sessions will fail to start");
        }

        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (`VOICEBOT__` prefix, `__` between sections)
/// 2. config/{env}.toml (if env specified)
/// 3. config/default.toml
///
/// Unset API keys then fall back to `SARVAM_API_KEY` / `GOOGLE_API_KEY`.
pub fn load_settings(env_name: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env_name {
        builder = builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("VOICEBOT")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let mut settings: Settings = config.try_deserialize()?;
    settings.apply_credential_fallbacks();

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 7860);
        assert_eq!(settings.agent.system_prompt, "You are a helpful assistant. Keep answers short.");
        assert_eq!(settings.agent.greeting_prompt, "Say hello.");
        assert_eq!(settings.llm.resolved_model(), "gemini-2.5-flash");
        assert_eq!(settings.tts.voice, "shubh");
        assert!(settings.pipeline.allow_interruptions);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.pipeline.vad_threshold_db = 3.0;
        assert!(settings.validate().is_err());

        settings.pipeline.vad_threshold_db = -40.0;
        settings.pipeline.max_utterance_ms = 50;
        assert!(settings.validate().is_err());

        settings.pipeline.max_utterance_ms = 30_000;
        settings.tts.sample_rate = 12_345;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_strict_environment_requires_credentials() {
        let mut settings = Settings {
            environment: RuntimeEnvironment::Production,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(ConfigError::MissingField(_))));

        settings.apply_credential_fallbacks_with(|name| match name {
            "SARVAM_API_KEY" => Some("sarvam-key".to_string()),
            "GOOGLE_API_KEY" => Some("google-key".to_string()),
            _ => None,
        });
        assert_eq!(settings.stt.api_key.as_deref(), Some("sarvam-key"));
        assert_eq!(settings.tts.api_key.as_deref(), Some("sarvam-key"));
        assert_eq!(settings.llm.api_key.as_deref(), Some("google-key"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_explicit_key_wins_over_fallback() {
        let mut settings = Settings::default();
        settings.stt.api_key = Some("explicit".to_string());
        settings.apply_credential_fallbacks_with(|_| Some("from-env".to_string()));

        assert_eq!(settings.stt.api_key.as_deref(), Some("explicit"));
        assert_eq!(settings.tts.api_key.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_ollama_resolves_its_own_defaults() {
        let source = r#"
            [llm]
            provider = "ollama"
        "#;
        let settings = Settings::from_toml_str(source).unwrap();
        assert_eq!(settings.llm.provider, LlmProvider::Ollama);
        assert_eq!(settings.llm.resolved_endpoint(), "http://localhost:11434");
    }

    #[test]
    fn test_shipped_default_config_parses() {
        let source = include_str!("../../../config/default.toml");
        let settings = Settings::from_toml_str(source).unwrap();
        assert_eq!(settings.server.port, 7860);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[server]\nport = 9000\nmax_sessions = 2\n").unwrap();

        let config = Config::builder()
            .add_source(File::from(path))
            .build()
            .unwrap();
        let settings: Settings = config.try_deserialize().unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.max_sessions, 2);
        assert_eq!(settings.server.host, "0.0.0.0");
    }
}
