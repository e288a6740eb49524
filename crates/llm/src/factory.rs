//! Backend selection from settings

use std::sync::Arc;
use voicebot_config::{LlmProvider, LlmSettings};
use voicebot_core::LanguageModel;

use crate::gemini::{GeminiBackend, GeminiConfig};
use crate::ollama::{OllamaBackend, OllamaConfig};
use crate::LlmError;

/// Create the configured language model
pub fn create_language_model(settings: &LlmSettings) -> Result<Arc<dyn LanguageModel>, LlmError> {
    let model: Arc<dyn LanguageModel> = match settings.provider {
        LlmProvider::Gemini => Arc::new(GeminiBackend::new(GeminiConfig::from_settings(settings)?)?),
        LlmProvider::Ollama => Arc::new(OllamaBackend::new(OllamaConfig::from(settings))?),
    };

    tracing::info!(provider = ?settings.provider, model = model.model_name(), "Language model ready");
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_needs_key() {
        let err = create_language_model(&LlmSettings::default()).err().unwrap();
        assert!(matches!(err, LlmError::Configuration(_)));
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let settings = LlmSettings {
            provider: LlmProvider::Ollama,
            ..Default::default()
        };
        let model = create_language_model(&settings).unwrap();
        assert_eq!(model.model_name(), "qwen2.5:1.5b");
    }
}
