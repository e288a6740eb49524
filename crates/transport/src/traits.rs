//! Transport contracts

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use voicebot_core::AudioFrame;

use crate::TransportError;

/// Receives audio from the remote peer
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Next chunk of peer audio; `None` once the stream has ended
    async fn recv_audio(&self) -> Result<Option<AudioFrame>, TransportError>;
}

/// Sends audio to the remote peer
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Queue one chunk for playback
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), TransportError>;

    /// Drop audio queued but not yet played
    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Connection events reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
}

/// A negotiated peer connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier handed to the peer as `pc_id`
    fn connection_id(&self) -> &str;

    /// Apply a trickled remote ICE candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    fn audio_source(&self) -> Arc<dyn AudioSource>;

    fn audio_sink(&self) -> Arc<dyn AudioSink>;

    fn is_connected(&self) -> bool;

    /// Close the connection; closing twice is a no-op
    async fn close(&self) -> Result<(), TransportError>;
}

/// Result of accepting an offer
pub struct NegotiatedTransport {
    pub transport: Arc<dyn Transport>,
    pub answer: SessionDescription,
    /// Connection events, in the order the transport observed them
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for NegotiatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedTransport")
            .field("connection_id", &self.transport.connection_id())
            .field("answer", &self.answer)
            .finish()
    }
}

/// Creates transports from remote offers
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn accept(&self, offer: SessionDescription) -> Result<NegotiatedTransport, TransportError>;
}

/// SDP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description exchanged during signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpType::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpType::Answer,
        }
    }

    /// Reject anything that is not a non-empty offer
    pub fn validate_offer(&self) -> Result<(), TransportError> {
        if self.kind != SdpType::Offer {
            return Err(TransportError::InvalidOffer(format!("expected offer, got {:?}", self.kind)));
        }
        if self.sdp.trim().is_empty() {
            return Err(TransportError::InvalidOffer("empty SDP".to_string()));
        }
        Ok(())
    }
}

/// ICE candidate for trickle ICE signaling
///
/// Accepts both browser (`sdpMid`, `sdpMLineIndex`) and snake_case field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, alias = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(default, alias = "sdpMLineIndex", alias = "sdp_m_line_index")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, alias = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// End-of-candidates marker (empty candidate line)
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}
