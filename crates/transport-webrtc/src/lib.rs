//! Peer-to-peer transport primitives for the guardian signer link.
//!
//! A transport session is one peer connection plus one ordered, reliable data
//! channel. The traits here are the only surface the signaling layer touches;
//! [`RtcConnector`] backs them with webrtc-rs and [`mock::MockConnector`]
//! scripts them for tests.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mock;
mod rtc;

pub use rtc::RtcConnector;

pub const DEFAULT_CHANNEL_LABEL: &str = "lan";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

/// Everything a transport session reports back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    State(PeerState),
    ChannelOpen,
    ChannelClosed,
    Message(String),
    ChannelError(String),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Resolves once candidate gathering reports completion. Arm it before the
/// local description is applied so the completion cannot be missed.
#[derive(Debug)]
pub struct GatherSignal {
    rx: mpsc::Receiver<()>,
}

impl GatherSignal {
    pub fn new(rx: mpsc::Receiver<()>) -> Self {
        Self { rx }
    }

    pub fn completed() -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(());
        Self { rx }
    }

    pub async fn wait(mut self) {
        // A dropped sender also means gathering is over.
        let _ = self.rx.recv().await;
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    async fn send_text(&self, text: String) -> TransportResult<()>;
    async fn close(&self) -> TransportResult<()>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates the session's channel; its open/close/message/error events are
    /// delivered on `events`.
    async fn create_data_channel(
        &self,
        label: &str,
        events: PeerEventSender,
    ) -> TransportResult<Arc<dyn DataChannel>>;
    async fn create_offer(&self) -> TransportResult<SessionDescription>;
    async fn gathering_complete(&self) -> GatherSignal;
    async fn set_local_description(&self, desc: SessionDescription) -> TransportResult<()>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> TransportResult<()>;
    async fn close(&self) -> TransportResult<()>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Opens a fresh peer connection whose state changes are delivered on
    /// `events`.
    async fn connect(&self, events: PeerEventSender) -> TransportResult<Arc<dyn PeerConnection>>;
}
