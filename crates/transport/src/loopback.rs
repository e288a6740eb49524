//! In-memory loopback transport
//!
//! Every accepted offer yields a [`LoopbackTransport`] for the server side
//! and a [`LoopbackPeer`] that plays the remote browser: it raises connection
//! events, feeds microphone audio and collects the audio the agent speaks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use voicebot_core::AudioFrame;

use crate::traits::{
    AudioSink, AudioSource, IceCandidate, NegotiatedTransport, Negotiator, SessionDescription, Transport,
    TransportEvent,
};
use crate::TransportError;

const EVENT_CAPACITY: usize = 16;
const AUDIO_CAPACITY: usize = 256;

struct Link {
    connected: AtomicBool,
    closed: watch::Sender<bool>,
    candidates: Mutex<Vec<IceCandidate>>,
    flushes: AtomicUsize,
}

impl Link {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

struct LoopbackSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<AudioFrame>>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl AudioSource for LoopbackSource {
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

struct LoopbackSink {
    tx: mpsc::UnboundedSender<AudioFrame>,
    link: Arc<Link>,
}

#[async_trait]
impl AudioSink for LoopbackSink {
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        if self.link.is_closed() {
            return Err(TransportError::Closed);
        }
        // A peer that stopped listening just drops the audio
        let _ = self.tx.send(frame.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.link.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Server side of a loopback connection
pub struct LoopbackTransport {
    id: String,
    link: Arc<Link>,
    source: Arc<LoopbackSource>,
    sink: Arc<LoopbackSink>,
    events: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn connection_id(&self) -> &str {
        &self.id
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        if self.link.is_closed() {
            return Err(TransportError::Closed);
        }
        self.link.candidates.lock().push(candidate.clone());
        Ok(())
    }

    fn audio_source(&self) -> Arc<dyn AudioSource> {
        self.source.clone()
    }

    fn audio_sink(&self) -> Arc<dyn AudioSink> {
        self.sink.clone()
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst) && !self.link.is_closed()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let first = self.link.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
        if first {
            self.link.connected.store(false, Ordering::SeqCst);
            let _ = self.events.try_send(TransportEvent::Disconnected {
                reason: "closed".to_string(),
            });
            tracing::debug!(connection_id = %self.id, "Loopback transport closed");
        }
        Ok(())
    }
}

/// Remote side of a loopback connection
pub struct LoopbackPeer {
    id: String,
    link: Arc<Link>,
    events: mpsc::Sender<TransportEvent>,
    audio_tx: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    audio_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AudioFrame>>,
}

impl LoopbackPeer {
    pub fn connection_id(&self) -> &str {
        &self.id
    }

    /// Report the connection as established
    pub async fn connect(&self) {
        self.link.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Connected).await;
    }

    /// Report the connection as lost
    pub async fn disconnect(&self, reason: &str) {
        self.link.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Disconnected {
            reason: reason.to_string(),
        })
        .await;
    }

    /// Send microphone audio to the server
    pub async fn send_audio(&self, frame: AudioFrame) -> Result<(), TransportError> {
        let tx = self.audio_tx.lock().clone().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// End the microphone stream
    pub fn end_audio(&self) {
        self.audio_tx.lock().take();
    }

    /// Next chunk of agent audio; `None` once the server side is gone
    pub async fn recv_audio(&self) -> Option<AudioFrame> {
        self.audio_rx.lock().await.recv().await
    }

    /// Agent audio received so far without waiting
    pub async fn drain_audio(&self) -> Vec<AudioFrame> {
        let mut rx = self.audio_rx.lock().await;
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Remote candidates the server applied
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.link.candidates.lock().clone()
    }

    /// How many times the agent flushed queued audio
    pub fn flushes(&self) -> usize {
        self.link.flushes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}

/// Negotiator producing loopback connections
pub struct LoopbackNegotiator {
    auto_connect: bool,
    peers: Mutex<HashMap<String, LoopbackPeer>>,
}

impl LoopbackNegotiator {
    /// Peers stay unconnected until [`LoopbackPeer::connect`]
    pub fn new() -> Self {
        Self {
            auto_connect: false,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Every accepted connection reports `Connected` straight away
    pub fn auto_connect() -> Self {
        Self {
            auto_connect: true,
            ..Self::new()
        }
    }

    /// Take the remote handle for an accepted connection
    pub fn take_peer(&self, connection_id: &str) -> Option<LoopbackPeer> {
        self.peers.lock().remove(connection_id)
    }

    fn answer_for(id: &str) -> SessionDescription {
        SessionDescription::answer(format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=loopback\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            id
        ))
    }
}

impl Default for LoopbackNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Negotiator for LoopbackNegotiator {
    async fn accept(&self, offer: SessionDescription) -> Result<NegotiatedTransport, TransportError> {
        offer.validate_offer()?;

        let id = uuid::Uuid::new_v4().to_string();
        let (closed_tx, closed_rx) = watch::channel(false);
        let link = Arc::new(Link {
            connected: AtomicBool::new(false),
            closed: closed_tx,
            candidates: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
        });

        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (mic_tx, mic_rx) = mpsc::channel(AUDIO_CAPACITY);
        let (speaker_tx, speaker_rx) = mpsc::unbounded_channel();

        let transport = LoopbackTransport {
            id: id.clone(),
            link: link.clone(),
            source: Arc::new(LoopbackSource {
                rx: tokio::sync::Mutex::new(mic_rx),
                closed: closed_rx,
            }),
            sink: Arc::new(LoopbackSink {
                tx: speaker_tx,
                link: link.clone(),
            }),
            events: event_tx.clone(),
        };

        let peer = LoopbackPeer {
            id: id.clone(),
            link,
            events: event_tx,
            audio_tx: Mutex::new(Some(mic_tx)),
            audio_rx: tokio::sync::Mutex::new(speaker_rx),
        };

        if self.auto_connect {
            peer.connect().await;
        }
        self.peers.lock().insert(id.clone(), peer);

        tracing::debug!(connection_id = %id, "Loopback connection accepted");

        Ok(NegotiatedTransport {
            transport: Arc::new(transport),
            answer: Self::answer_for(&id),
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voicebot_core::{Channels, SampleRate};

    fn chunk(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0.1; 320], SampleRate::Hz16000, Channels::Mono, seq)
    }

    #[tokio::test]
    async fn test_accept_rejects_bad_offer() {
        let negotiator = LoopbackNegotiator::new();
        let err = negotiator.accept(SessionDescription::offer("")).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidOffer(_)));
    }

    #[tokio::test]
    async fn test_audio_both_ways() {
        let negotiator = LoopbackNegotiator::new();
        let negotiated = negotiator.accept(SessionDescription::offer("v=0")).await.unwrap();
        let transport = negotiated.transport;
        let peer = negotiator.take_peer(transport.connection_id()).unwrap();

        peer.send_audio(chunk(1)).await.unwrap();
        let received = transport.audio_source().recv_audio().await.unwrap().unwrap();
        assert_eq!(received.sequence, 1);

        transport.audio_sink().send_audio(&chunk(2)).await.unwrap();
        assert_eq!(peer.recv_audio().await.unwrap().sequence, 2);

        peer.end_audio();
        assert!(transport.audio_source().recv_audio().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_and_close() {
        let negotiator = LoopbackNegotiator::new();
        let mut negotiated = negotiator.accept(SessionDescription::offer("v=0")).await.unwrap();
        let transport = negotiated.transport.clone();
        let peer = negotiator.take_peer(transport.connection_id()).unwrap();

        peer.connect().await;
        assert_eq!(negotiated.events.recv().await, Some(TransportEvent::Connected));
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(peer.is_closed());
        assert!(!transport.is_connected());
        assert!(matches!(negotiated.events.recv().await, Some(TransportEvent::Disconnected { .. })));
        assert!(negotiated.events.try_recv().is_err());

        assert!(transport.audio_source().recv_audio().await.unwrap().is_none());
        assert!(matches!(
            transport.audio_sink().send_audio(&chunk(3)).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_auto_connect_and_candidates() {
        let negotiator = LoopbackNegotiator::auto_connect();
        let mut negotiated = negotiator.accept(SessionDescription::offer("v=0")).await.unwrap();
        assert_eq!(negotiated.events.recv().await, Some(TransportEvent::Connected));
        assert!(negotiated.answer.sdp.starts_with("v=0"));

        let transport = negotiated.transport;
        transport.add_ice_candidate(&IceCandidate::new("candidate:1")).await.unwrap();
        let peer = negotiator.take_peer(transport.connection_id()).unwrap();
        assert_eq!(peer.candidates().len(), 1);
        assert!(negotiator.take_peer(transport.connection_id()).is_none());
    }
}
