//! Default values shared across crates
//!
//! Service endpoints and model identifiers live here so the config defaults
//! and the service clients cannot drift apart.

/// External service endpoints
pub mod endpoints {
    /// Sarvam speech-to-text REST endpoint
    pub const SARVAM_STT: &str = "https://api.sarvam.ai/speech-to-text";

    /// Sarvam text-to-speech REST endpoint
    pub const SARVAM_TTS: &str = "https://api.sarvam.ai/text-to-speech";

    /// Google Generative Language API base URL
    pub const GEMINI: &str = "https://generativelanguage.googleapis.com";

    /// Local Ollama server
    pub const OLLAMA: &str = "http://localhost:11434";
}

/// Model identifiers
pub mod models {
    pub const SARVAM_STT: &str = "saarika:v2.5";
    pub const SARVAM_TTS: &str = "bulbul:v3";
    pub const SARVAM_TTS_VOICE: &str = "shubh";
    pub const GEMINI: &str = "gemini-2.5-flash";
    pub const OLLAMA: &str = "qwen2.5:1.5b";
}

/// Agent defaults
pub mod agent {
    /// Persona instruction seeded as the first turn of every session
    pub const SYSTEM_PROMPT: &str = "You are a helpful assistant. Keep answers short.";

    /// Instruction appended on connect so the assistant speaks first
    pub const GREETING_PROMPT: &str = "Say hello.";

    /// Language code for speech services
    pub const LANGUAGE: &str = "en-IN";
}

/// Credential fallbacks read when the settings leave a key unset
pub mod env {
    pub const SARVAM_API_KEY: &str = "SARVAM_API_KEY";
    pub const GOOGLE_API_KEY: &str = "GOOGLE_API_KEY";
}

/// Server defaults
pub mod server {
    pub const PORT: u16 = 7860;
    pub const HOST: &str = "0.0.0.0";
    pub const STUN_SERVER: &str = "stun:stun.l.google.com:19302";
}
