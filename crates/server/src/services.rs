//! Per-session speech and language services

use async_trait::async_trait;
use std::sync::Arc;
use voicebot_config::Settings;
use voicebot_core::Result;
use voicebot_pipeline::{
    EnergyVad, EnergyVadConfig, SarvamStt, SarvamSttConfig, SarvamTts, SarvamTtsConfig, VoiceServices,
};

/// Builds the services a session pipeline runs on
///
/// Called once per connected peer. An error is fatal to that session only.
#[async_trait]
pub trait ServiceFactory: Send + Sync + 'static {
    async fn create(&self, settings: &Settings) -> Result<VoiceServices>;
}

/// Sarvam speech services, the configured language model and the energy VAD
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpServiceFactory;

#[async_trait]
impl ServiceFactory for HttpServiceFactory {
    async fn create(&self, settings: &Settings) -> Result<VoiceServices> {
        let stt = SarvamStt::new(SarvamSttConfig::from_settings(&settings.stt)?)?;
        let tts = SarvamTts::new(SarvamTtsConfig::from_settings(&settings.tts)?)?;
        let llm = voicebot_llm::create_language_model(&settings.llm)?;
        let vad = EnergyVad::new(EnergyVadConfig::from(&settings.pipeline));

        tracing::debug!(
            stt = settings.stt.model.as_str(),
            llm = llm.model_name(),
            tts = settings.tts.model.as_str(),
            "Created session services"
        );

        Ok(VoiceServices {
            stt: Arc::new(stt),
            llm,
            tts: Arc::new(tts),
            vad: Arc::new(vad),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_credentials_fail() {
        let settings = Settings::default();
        assert!(HttpServiceFactory.create(&settings).await.is_err());
    }

    #[tokio::test]
    async fn test_builds_with_credentials() {
        let mut settings = Settings::default();
        settings.stt.api_key = Some("stt-key".into());
        settings.tts.api_key = Some("tts-key".into());
        settings.llm.api_key = Some("llm-key".into());

        let services = HttpServiceFactory.create(&settings).await.unwrap();
        assert_eq!(services.llm.model_name(), "gemini-2.5-flash");
        assert_eq!(services.stt.model_name(), "saarika:v2.5");
        assert_eq!(services.tts.model_name(), "bulbul:v3");
    }
}
