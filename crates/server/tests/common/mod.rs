//! Mock services and helpers shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use voicebot_config::Settings;
use voicebot_core::{
    AudioFrame, Channels, Error, GenerationResult, LanguageModel, Result, SampleRate, SpeechToText, TextToSpeech,
    Transcription, Turn, VadEvent, VoiceActivityDetector,
};
use voicebot_pipeline::VoiceServices;
use voicebot_server::{ServiceFactory, SessionManager, SignalingEndpoint};
use voicebot_transport::{LoopbackNegotiator, Negotiator};

/// Transcribes every utterance as the same text
pub struct MockStt {
    text: String,
}

#[async_trait]
impl SpeechToText for MockStt {
    async fn transcribe(&self, _audio: &AudioFrame) -> Result<Vec<Transcription>> {
        Ok(vec![Transcription::final_text(self.text.clone())])
    }

    fn model_name(&self) -> &str {
        "mock-stt"
    }
}

/// One chunk of 24kHz audio per sentence
pub struct MockTts;

#[async_trait]
impl TextToSpeech for MockTts {
    async fn synthesize(&self, _text: &str) -> Result<Vec<AudioFrame>> {
        Ok(vec![AudioFrame::new(vec![0.1; 480], SampleRate::Hz24000, Channels::Mono, 0)])
    }

    fn model_name(&self) -> &str {
        "mock-tts"
    }
}

/// Loud chunks are speech, quiet chunks end it
#[derive(Default)]
pub struct ThresholdVad {
    speaking: Mutex<bool>,
}

impl VoiceActivityDetector for ThresholdVad {
    fn process(&self, frame: &AudioFrame) -> Result<VadEvent> {
        let loud = frame.energy_db > -30.0;
        let mut speaking = self.speaking.lock();
        let event = match (*speaking, loud) {
            (false, true) => VadEvent::SpeechStarted,
            (true, false) => VadEvent::SpeechStopped,
            _ => VadEvent::None,
        };
        *speaking = loud;
        Ok(event)
    }

    fn is_speaking(&self) -> bool {
        *self.speaking.lock()
    }

    fn reset(&self) {
        *self.speaking.lock() = false;
    }
}

/// How the scripted model answers one request
#[derive(Debug, Clone)]
pub enum Reply {
    /// Stream the tokens and complete
    Text(Vec<String>),
    /// Stream the tokens, then never complete
    Hang(Vec<String>),
    /// Fail the request
    Fail(String),
}

impl Reply {
    pub fn text(tokens: &[&str]) -> Self {
        Reply::Text(tokens.iter().map(|t| t.to_string()).collect())
    }

    pub fn hang(tokens: &[&str]) -> Self {
        Reply::Hang(tokens.iter().map(|t| t.to_string()).collect())
    }
}

/// Language model that plays back scripted replies and records its inputs
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedLlm {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Turns passed to each request so far
    pub fn calls(&self) -> Vec<Vec<Turn>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn generate_stream(&self, turns: &[Turn], tx: mpsc::Sender<String>) -> Result<GenerationResult> {
        self.calls.lock().push(turns.to_vec());
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Reply::text(&["Okay."]));

        let (tokens, hang) = match reply {
            Reply::Text(tokens) => (tokens, false),
            Reply::Hang(tokens) => (tokens, true),
            Reply::Fail(message) => return Err(Error::Llm(message)),
        };

        for token in &tokens {
            if tx.send(token.clone()).await.is_err() {
                break;
            }
        }
        if hang {
            std::future::pending::<()>().await;
        }

        Ok(GenerationResult {
            text: tokens.concat(),
            tokens: tokens.len(),
            ..Default::default()
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Builds mock services around a shared scripted model
pub struct MockFactory {
    pub llm: Arc<ScriptedLlm>,
    pub transcript: String,
}

impl MockFactory {
    pub fn new(llm: Arc<ScriptedLlm>) -> Arc<Self> {
        Arc::new(Self {
            llm,
            transcript: "hello".to_string(),
        })
    }
}

#[async_trait]
impl ServiceFactory for MockFactory {
    async fn create(&self, _settings: &Settings) -> Result<VoiceServices> {
        Ok(VoiceServices {
            stt: Arc::new(MockStt {
                text: self.transcript.clone(),
            }),
            llm: self.llm.clone(),
            tts: Arc::new(MockTts),
            vad: Arc::new(ThresholdVad::default()),
        })
    }
}

/// Fails like a deployment without credentials
pub struct FailingFactory;

#[async_trait]
impl ServiceFactory for FailingFactory {
    async fn create(&self, _settings: &Settings) -> Result<VoiceServices> {
        Err(Error::Config("STT API key is not set".to_string()))
    }
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.pipeline.cancel_grace_ms = 500;
    settings
}

pub fn endpoint(
    negotiator: &Arc<LoopbackNegotiator>,
    services: Arc<dyn ServiceFactory>,
    settings: Settings,
) -> SignalingEndpoint {
    let sessions = Arc::new(SessionManager::new(settings.server.max_sessions));
    SignalingEndpoint::new(
        negotiator.clone() as Arc<dyn Negotiator>,
        sessions,
        services,
        Arc::new(settings),
    )
}

/// 20ms of 16kHz audio
pub fn speech(seq: u64) -> AudioFrame {
    AudioFrame::new(vec![0.5; 320], SampleRate::Hz16000, Channels::Mono, seq)
}

pub fn silence(seq: u64) -> AudioFrame {
    AudioFrame::new(vec![0.0; 320], SampleRate::Hz16000, Channels::Mono, seq)
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
