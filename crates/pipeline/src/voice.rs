//! The conversational voice pipeline
//!
//! ```text
//! transport in → STT → user turns → LLM → TTS → transport out → assistant turns
//! ```

use std::sync::Arc;
use voicebot_config::PipelineConfig;
use voicebot_core::{ConversationContext, LanguageModel, SpeechToText, TextToSpeech, VoiceActivityDetector};
use voicebot_transport::AudioSink;

use crate::processors::{
    LlmProcessor, SttProcessor, TransportInputProcessor, TransportOutputProcessor, TtsProcessor, TurnAggregator,
};
use crate::Pipeline;

/// Speech and language services for one session
#[derive(Clone)]
pub struct VoiceServices {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
    pub vad: Arc<dyn VoiceActivityDetector>,
}

/// Assemble the session pipeline around a shared conversation context
pub fn build_voice_pipeline(
    services: VoiceServices,
    sink: Arc<dyn AudioSink>,
    context: ConversationContext,
    config: &PipelineConfig,
) -> Pipeline {
    let turn_timeout = config.turn_timeout();

    Pipeline::builder("voice")
        .channel_capacity(config.channel_capacity)
        .processor(TransportInputProcessor::new(services.vad))
        .processor(SttProcessor::new(services.stt).with_limits(config.max_utterance(), turn_timeout))
        .processor(TurnAggregator::user(context.clone(), turn_timeout))
        .processor(LlmProcessor::new(services.llm, context.clone()).with_interruptions(config.allow_interruptions))
        .processor(TtsProcessor::new(services.tts))
        .processor(TransportOutputProcessor::new(sink))
        .processor(TurnAggregator::assistant(context, turn_timeout))
        .build()
}
