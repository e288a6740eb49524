//! Opus codec wrappers
//!
//! WebRTC audio is Opus at 48kHz. The agent speaks and listens in mono, so
//! both directions are encoded and decoded as a single channel.

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};
use parking_lot::Mutex;

use crate::TransportError;

/// Opus clock rate
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Samples in one 20ms Opus frame at 48kHz mono
pub const OPUS_FRAME_SAMPLES: usize = 960;

/// Largest packet the encoder may produce
const MAX_PACKET_BYTES: usize = 4000;

/// Longest frame a packet can decode to (120ms at 48kHz)
const MAX_DECODED_SAMPLES: usize = 5760;

/// Mono Opus encoder
pub struct OpusEncoder {
    inner: Mutex<Encoder>,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, TransportError> {
        let encoder = Encoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip)
            .map_err(|e| TransportError::Codec(format!("Failed to create Opus encoder: {}", e)))?;
        Ok(Self {
            inner: Mutex::new(encoder),
        })
    }

    /// Encode exactly one frame of PCM
    pub fn encode(&self, pcm: &[f32]) -> Result<Vec<u8>, TransportError> {
        let mut out = vec![0u8; MAX_PACKET_BYTES];
        let len = self
            .inner
            .lock()
            .encode_float(pcm, &mut out)
            .map_err(|e| TransportError::Codec(format!("Opus encode failed: {}", e)))?;
        out.truncate(len);
        Ok(out)
    }
}

/// Mono Opus decoder
pub struct OpusDecoder {
    inner: Mutex<Decoder>,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, TransportError> {
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Mono)
            .map_err(|e| TransportError::Codec(format!("Failed to create Opus decoder: {}", e)))?;
        Ok(Self {
            inner: Mutex::new(decoder),
        })
    }

    /// Decode one packet to PCM
    pub fn decode(&self, packet: &[u8]) -> Result<Vec<f32>, TransportError> {
        let mut out = vec![0f32; MAX_DECODED_SAMPLES];
        let len = self
            .inner
            .lock()
            .decode_float(Some(packet), &mut out[..], false)
            .map_err(|e| TransportError::Codec(format!("Opus decode failed: {}", e)))?;
        out.truncate(len);
        Ok(out)
    }

    /// Packet loss concealment for one missing frame
    pub fn conceal(&self) -> Result<Vec<f32>, TransportError> {
        let mut out = vec![0f32; OPUS_FRAME_SAMPLES];
        let len = self
            .inner
            .lock()
            .decode_float(None::<&[u8]>, &mut out[..], false)
            .map_err(|e| TransportError::Codec(format!("Opus concealment failed: {}", e)))?;
        out.truncate(len);
        Ok(out)
    }
}
