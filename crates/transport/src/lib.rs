//! Peer transports for the voice agent
//!
//! A [`Negotiator`] turns a remote session description into a live
//! [`Transport`] plus an answer and a stream of connection events.
//!
//! Implementations:
//! - `LoopbackNegotiator`: in-memory peer for tests and local development
//! - `WebRtcNegotiator` (feature `webrtc`): WebRTC with Opus audio

pub mod loopback;
pub mod playout;
pub mod traits;

#[cfg(feature = "webrtc")]
pub mod codec;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use loopback::{LoopbackNegotiator, LoopbackPeer, LoopbackTransport};
pub use playout::Playout;
pub use traits::{
    AudioSink, AudioSource, IceCandidate, NegotiatedTransport, Negotiator, SdpType, SessionDescription, Transport,
    TransportEvent,
};

#[cfg(feature = "webrtc")]
pub use webrtc::{IceServer, WebRtcConfig, WebRtcNegotiator, WebRtcTransport};

use thiserror::Error;

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Invalid session description: {0}")]
    InvalidOffer(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TransportError> for voicebot_core::Error {
    fn from(err: TransportError) -> Self {
        voicebot_core::Error::Transport(err.to_string())
    }
}
