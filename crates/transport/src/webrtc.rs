//! WebRTC transport
//!
//! Server-side answerer: every offer gets its own peer connection with one
//! bidirectional Opus audio track. Local ICE candidates are gathered before
//! the answer is returned; remote candidates may trickle in afterwards.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use voicebot_config::ServerConfig;
use voicebot_core::{AudioFrame, Channels, SampleRate};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::codec::{OpusDecoder, OpusEncoder, OPUS_FRAME_SAMPLES, OPUS_SAMPLE_RATE};
use crate::playout::Playout;
use crate::traits::{
    AudioSink, AudioSource, IceCandidate, NegotiatedTransport, Negotiator, SessionDescription, Transport,
    TransportEvent,
};
use crate::TransportError;

const EVENT_CAPACITY: usize = 16;
const AUDIO_CAPACITY: usize = 100;
const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);

/// ICE server configuration
#[derive(Debug, Clone)]
pub struct IceServer {
    /// Server URLs (stun: or turn:)
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// WebRTC configuration
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<IceServer>,
    /// How long to wait for local candidates before answering anyway
    pub ice_gathering_timeout: Duration,
    pub ice_disconnected_timeout: Duration,
    pub ice_failed_timeout: Duration,
    pub ice_keepalive_interval: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![voicebot_config::constants::server::STUN_SERVER.to_string()],
                username: None,
                credential: None,
            }],
            ice_gathering_timeout: Duration::from_secs(10),
            ice_disconnected_timeout: Duration::from_secs(5),
            ice_failed_timeout: Duration::from_secs(25),
            ice_keepalive_interval: Duration::from_secs(2),
        }
    }
}

impl From<&ServerConfig> for WebRtcConfig {
    fn from(server: &ServerConfig) -> Self {
        let mut ice_servers = Vec::new();
        if !server.stun_servers.is_empty() {
            ice_servers.push(IceServer {
                urls: server.stun_servers.clone(),
                username: None,
                credential: None,
            });
        }
        ice_servers.extend(server.turn_servers.iter().map(|turn| IceServer {
            urls: vec![turn.url.clone()],
            username: Some(turn.username.clone()),
            credential: Some(turn.credential.clone()),
        }));

        Self {
            ice_servers,
            ..Self::default()
        }
    }
}

/// WebRTC connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebRtcState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: OPUS_SAMPLE_RATE,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Sends agent audio on the local track
///
/// Incoming frames are resampled to 48kHz and cut into 20ms Opus frames.
/// The remainder of a frame waits for the next call. Encoded packets are
/// written to the track at real-time pace, so a flush drops whatever the peer
/// has not heard yet.
struct WebRtcAudioSink {
    encoder: OpusEncoder,
    pending: Mutex<Vec<f32>>,
    playout: Playout<Vec<u8>>,
    closed: watch::Receiver<bool>,
}

impl WebRtcAudioSink {
    fn new(track: Arc<TrackLocalStaticSample>, closed: watch::Receiver<bool>) -> Result<Self, TransportError> {
        let playout = Playout::spawn(OPUS_FRAME_DURATION, move |packet: Vec<u8>| {
            let track = Arc::clone(&track);
            async move {
                let sample = Sample {
                    data: bytes::Bytes::from(packet),
                    duration: OPUS_FRAME_DURATION,
                    ..Default::default()
                };
                track
                    .write_sample(&sample)
                    .await
                    .map_err(|e| TransportError::Media(format!("Failed to write sample: {}", e)))
            }
        });

        Ok(Self {
            encoder: OpusEncoder::new()?,
            pending: Mutex::new(Vec::with_capacity(OPUS_FRAME_SAMPLES * 2)),
            playout,
            closed,
        })
    }

    fn take_ready_frames(&self, frame: &AudioFrame) -> Vec<Vec<f32>> {
        let resampled = frame.resample(SampleRate::Hz48000);
        let mut pending = self.pending.lock();
        pending.extend_from_slice(&resampled.samples);

        let ready = pending.len() / OPUS_FRAME_SAMPLES;
        pending
            .drain(..ready * OPUS_FRAME_SAMPLES)
            .collect::<Vec<f32>>()
            .chunks(OPUS_FRAME_SAMPLES)
            .map(|c| c.to_vec())
            .collect()
    }
}

#[async_trait]
impl AudioSink for WebRtcAudioSink {
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }

        let packets = self
            .take_ready_frames(frame)
            .iter()
            .map(|pcm| self.encoder.encode(pcm))
            .collect::<Result<Vec<_>, _>>()?;
        self.playout.push(packets);
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.pending.lock().clear();
        let dropped = self.playout.clear();
        tracing::debug!(dropped_ms = dropped as u64 * OPUS_FRAME_DURATION.as_millis() as u64, "Flushed outgoing audio");
        Ok(())
    }
}

/// Receives decoded peer audio
struct WebRtcAudioSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<AudioFrame>>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl AudioSource for WebRtcAudioSource {
    async fn recv_audio(&self) -> Result<Option<AudioFrame>, TransportError> {
        let mut closed = self.closed.clone();
        if *closed.borrow() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => Ok(frame),
            _ = closed.wait_for(|c| *c) => Ok(None),
        }
    }
}

/// One WebRTC peer connection
pub struct WebRtcTransport {
    id: String,
    peer_connection: Arc<RTCPeerConnection>,
    state: Arc<RwLock<WebRtcState>>,
    closed: watch::Sender<bool>,
    source: Arc<WebRtcAudioSource>,
    sink: Arc<WebRtcAudioSink>,
}

impl WebRtcTransport {
    pub fn state(&self) -> WebRtcState {
        *self.state.read()
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn connection_id(&self) -> &str {
        &self.id
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        if candidate.is_end_of_candidates() {
            return Ok(());
        }

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))?;

        tracing::debug!(connection_id = %self.id, candidate = %candidate.candidate, "Added remote ICE candidate");
        Ok(())
    }

    fn audio_source(&self) -> Arc<dyn AudioSource> {
        self.source.clone()
    }

    fn audio_sink(&self) -> Arc<dyn AudioSink> {
        self.sink.clone()
    }

    fn is_connected(&self) -> bool {
        self.state() == WebRtcState::Connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let first = self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
        if !first {
            return Ok(());
        }

        *self.state.write() = WebRtcState::Closed;
        self.sink.playout.clear();
        self.peer_connection
            .close()
            .await
            .map_err(|e| TransportError::Internal(e.to_string()))?;

        tracing::info!(connection_id = %self.id, "WebRTC connection closed");
        Ok(())
    }
}

/// Answers browser offers with WebRTC peer connections
pub struct WebRtcNegotiator {
    config: WebRtcConfig,
    api: API,
}

impl WebRtcNegotiator {
    pub fn new(config: WebRtcConfig) -> Result<Self, TransportError> {
        let api = Self::create_api(&config)?;
        Ok(Self { config, api })
    }

    fn create_api(config: &WebRtcConfig) -> Result<API, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: 111,
                    stats_id: String::new(),
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| TransportError::Internal(e.to_string()))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Internal(e.to_string()))?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_timeouts(
            Some(config.ice_disconnected_timeout),
            Some(config.ice_failed_timeout),
            Some(config.ice_keepalive_interval),
        );

        Ok(webrtc::api::APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

fn watch_connection_state(
    pc: &RTCPeerConnection,
    id: String,
    state: Arc<RwLock<WebRtcState>>,
    events: mpsc::Sender<TransportEvent>,
) {
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let next = match s {
            RTCPeerConnectionState::Connecting => WebRtcState::Connecting,
            RTCPeerConnectionState::Connected => WebRtcState::Connected,
            RTCPeerConnectionState::Disconnected => WebRtcState::Disconnected,
            RTCPeerConnectionState::Failed => WebRtcState::Failed,
            RTCPeerConnectionState::Closed => WebRtcState::Closed,
            _ => return Box::pin(async {}),
        };
        *state.write() = next;
        tracing::info!(connection_id = %id, state = ?next, "Peer connection state changed");

        let events = events.clone();
        Box::pin(async move {
            let event = match next {
                WebRtcState::Connecting => return,
                WebRtcState::Connected => TransportEvent::Connected,
                other => TransportEvent::Disconnected {
                    reason: format!("{:?}", other).to_lowercase(),
                },
            };
            let _ = events.send(event).await;
        })
    }));
}

fn receive_audio(pc: &RTCPeerConnection, id: String, decoder: Arc<OpusDecoder>, audio_tx: mpsc::Sender<AudioFrame>) {
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        tracing::info!(connection_id = %id, kind = ?track.kind(), "Remote track received");

        let decoder = decoder.clone();
        let audio_tx = audio_tx.clone();
        let id = id.clone();

        Box::pin(async move {
            let mut sequence = 0u64;
            loop {
                let packet = match track.read_rtp().await {
                    Ok((packet, _)) => packet,
                    Err(e) => {
                        tracing::debug!(connection_id = %id, error = %e, "Remote track ended");
                        break;
                    }
                };
                if packet.payload.is_empty() {
                    continue;
                }

                let samples = match decoder.decode(&packet.payload) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(connection_id = %id, error = %e, "Opus decode error");
                        match decoder.conceal() {
                            Ok(s) => s,
                            Err(_) => continue,
                        }
                    }
                };

                let frame = AudioFrame::new(samples, SampleRate::Hz48000, Channels::Mono, sequence);
                sequence += 1;
                if audio_tx.send(frame).await.is_err() {
                    break;
                }
            }
        })
    }));
}

#[async_trait]
impl Negotiator for WebRtcNegotiator {
    async fn accept(&self, offer: SessionDescription) -> Result<NegotiatedTransport, TransportError> {
        offer.validate_offer()?;

        let id = uuid::Uuid::new_v4().to_string();
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config())
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?,
        );

        let state = Arc::new(RwLock::new(WebRtcState::New));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        watch_connection_state(&pc, id.clone(), state.clone(), event_tx);

        let track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_string(),
            "voicebot".to_string(),
        ));
        pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Media(format!("Failed to add audio track: {}", e)))?;

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CAPACITY);
        receive_audio(&pc, id.clone(), Arc::new(OpusDecoder::new()?), audio_tx);

        let (gathered_tx, gathered_rx) = oneshot::channel::<()>();
        let gathered_tx = Arc::new(Mutex::new(Some(gathered_tx)));
        pc.on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
            if s == RTCIceGathererState::Complete {
                if let Some(tx) = gathered_tx.lock().take() {
                    let _ = tx.send(());
                }
            }
            Box::pin(async {})
        }));

        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| TransportError::InvalidOffer(e.to_string()))?;
        pc.set_remote_description(remote)
            .await
            .map_err(|e| TransportError::InvalidOffer(e.to_string()))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if tokio::time::timeout(self.config.ice_gathering_timeout, gathered_rx)
            .await
            .is_err()
        {
            tracing::warn!(
                connection_id = %id,
                timeout = ?self.config.ice_gathering_timeout,
                "ICE gathering timed out, answering with partial candidates"
            );
        }

        let sdp = pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .unwrap_or(answer.sdp);

        let (closed_tx, closed_rx) = watch::channel(false);
        let transport = WebRtcTransport {
            id: id.clone(),
            peer_connection: pc,
            state,
            closed: closed_tx,
            source: Arc::new(WebRtcAudioSource {
                rx: tokio::sync::Mutex::new(audio_rx),
                closed: closed_rx.clone(),
            }),
            sink: Arc::new(WebRtcAudioSink::new(track, closed_rx)?),
        };

        tracing::info!(connection_id = %id, "WebRTC offer answered");

        Ok(NegotiatedTransport {
            transport: Arc::new(transport),
            answer: SessionDescription::answer(sdp),
            events: event_rx,
        })
    }
}
