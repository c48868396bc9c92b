//! Scriptable in-memory transport for exercising signaling and RPC code
//! without a network.
//!
//! A [`MockConnector`] hands out [`MockPeer`]s and keeps them around so a test
//! can play the remote side of each session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::{
    DataChannel, GatherSignal, PeerConnection, PeerConnector, PeerEvent, PeerEventSender,
    PeerState, SdpKind, SessionDescription, TransportError, TransportResult,
};

/// How a mock peer judges remote answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnswerPolicy {
    /// Anything that looks like SDP (`v=0` prefix).
    #[default]
    Lenient,
    /// Like `Lenient`, but the blob must also end with a line terminator.
    Strict,
    RejectAll,
}

/// Lifecycle step recorded by a [`MockConnector`], tagged with the peer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    Connect(usize),
    ChannelClosed(usize),
    PeerClosed(usize),
}

type Journal = Arc<Mutex<Vec<MockEvent>>>;

#[derive(Debug, Clone, Default)]
struct MockOptions {
    answers: AnswerPolicy,
    manual_gathering: bool,
    failing_close: bool,
    failing_connect: bool,
    failing_offer: bool,
}

#[derive(Default)]
pub struct MockConnector {
    options: MockOptions,
    peers: Mutex<Vec<Arc<MockPeer>>>,
    connects: AtomicUsize,
    journal: Journal,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answer_policy(mut self, policy: AnswerPolicy) -> Self {
        self.options.answers = policy;
        self
    }

    /// Gathering only completes when the test calls
    /// [`MockPeer::complete_gathering`].
    pub fn with_manual_gathering(mut self) -> Self {
        self.options.manual_gathering = true;
        self
    }

    pub fn with_failing_close(mut self) -> Self {
        self.options.failing_close = true;
        self
    }

    pub fn with_failing_connect(mut self) -> Self {
        self.options.failing_connect = true;
        self
    }

    pub fn with_failing_offer(mut self) -> Self {
        self.options.failing_offer = true;
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<MockPeer>> {
        self.peers.lock().last().cloned()
    }

    /// Connects and closes across every peer, in the order they happened.
    pub fn journal(&self) -> Vec<MockEvent> {
        self.journal.lock().clone()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(&self, events: PeerEventSender) -> TransportResult<Arc<dyn PeerConnection>> {
        let index = self.connects.fetch_add(1, Ordering::SeqCst);
        if self.options.failing_connect {
            return Err(TransportError::Setup("scripted connect failure".into()));
        }
        self.journal.lock().push(MockEvent::Connect(index));
        let peer = Arc::new(MockPeer::new(
            index,
            events,
            self.options.clone(),
            self.journal.clone(),
        ));
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

pub struct MockPeer {
    index: usize,
    options: MockOptions,
    journal: Journal,
    events: PeerEventSender,
    channel_events: Mutex<Option<PeerEventSender>>,
    channel: Mutex<Option<Arc<MockChannel>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    remote_attempts: Mutex<Vec<String>>,
    gather_tx: Mutex<Option<mpsc::Sender<()>>>,
    gathered: AtomicBool,
    closed: AtomicBool,
}

impl MockPeer {
    fn new(index: usize, events: PeerEventSender, options: MockOptions, journal: Journal) -> Self {
        Self {
            index,
            options,
            journal,
            events,
            channel_events: Mutex::new(None),
            channel: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            remote_attempts: Mutex::new(Vec::new()),
            gather_tx: Mutex::new(None),
            gathered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn emit_state(&self, state: PeerState) {
        let _ = self.events.send(PeerEvent::State(state));
    }

    /// Opens the channel and reports the connection as established, the way a
    /// real peer does once the remote answer has been applied.
    pub fn establish(&self) {
        self.emit_channel(PeerEvent::ChannelOpen);
        self.emit_state(PeerState::Connected);
    }

    /// Delivers an inbound frame as if the remote signer sent it.
    pub fn deliver(&self, text: impl Into<String>) {
        self.emit_channel(PeerEvent::Message(text.into()));
    }

    pub fn channel_error(&self, reason: impl Into<String>) {
        self.emit_channel(PeerEvent::ChannelError(reason.into()));
    }

    pub fn close_channel_remotely(&self) {
        self.emit_channel(PeerEvent::ChannelClosed);
    }

    fn emit_channel(&self, event: PeerEvent) {
        if let Some(events) = self.channel_events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn channel(&self) -> Option<Arc<MockChannel>> {
        self.channel.lock().clone()
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.channel().map(|ch| ch.sent()).unwrap_or_default()
    }

    /// Waits until at least `count` frames have been sent on this peer's
    /// channel.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
        match self.channel() {
            Some(channel) => channel.wait_for_sent(count).await,
            None => Vec::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn channel_closed(&self) -> bool {
        self.channel().is_some_and(|ch| ch.is_closed())
    }

    /// Every answer blob offered to `set_remote_description`, accepted or not.
    pub fn remote_attempts(&self) -> Vec<String> {
        self.remote_attempts.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn complete_gathering(&self) {
        self.gathered.store(true, Ordering::SeqCst);
        if let Some(tx) = self.gather_tx.lock().take() {
            let _ = tx.try_send(());
        }
    }

    fn offer_sdp(&self) -> String {
        format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\nc=IN IP4 0.0.0.0\r\n\
             a=mid:0\r\na=sctp-port:5000\r\n",
            1000 + self.index
        )
    }

    fn accepts(&self, sdp: &str) -> bool {
        match self.options.answers {
            AnswerPolicy::Lenient => sdp.starts_with("v=0"),
            AnswerPolicy::Strict => sdp.starts_with("v=0") && sdp.ends_with('\n'),
            AnswerPolicy::RejectAll => false,
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_data_channel(
        &self,
        label: &str,
        events: PeerEventSender,
    ) -> TransportResult<Arc<dyn DataChannel>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let channel = Arc::new(MockChannel::new(label, self.index, self.journal.clone()));
        *self.channel_events.lock() = Some(events);
        *self.channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        if self.options.failing_offer {
            return Err(TransportError::Setup("scripted offer failure".into()));
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(SessionDescription::offer(self.offer_sdp()))
    }

    async fn gathering_complete(&self) -> GatherSignal {
        let (tx, rx) = mpsc::channel(1);
        if self.gathered.load(Ordering::SeqCst) {
            let _ = tx.try_send(());
        } else {
            *self.gather_tx.lock() = Some(tx);
        }
        GatherSignal::new(rx)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        *self.local.lock() = Some(desc);
        if !self.options.manual_gathering {
            self.complete_gathering();
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let local = self.local.lock().clone()?;
        if !self.gathered.load(Ordering::SeqCst) {
            return Some(local);
        }
        let sdp = format!(
            "{}a=candidate:1 1 UDP 2130706431 192.168.1.20 50000 typ host\r\na=end-of-candidates\r\n",
            local.sdp
        );
        Some(SessionDescription {
            kind: local.kind,
            sdp,
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> TransportResult<()> {
        self.remote_attempts.lock().push(desc.sdp.clone());
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.local.lock().is_none() {
            return Err(TransportError::InvalidDescription(
                "no local offer to answer".into(),
            ));
        }
        if desc.kind != SdpKind::Answer || !self.accepts(&desc.sdp) {
            return Err(TransportError::InvalidDescription(
                "scripted answer rejection".into(),
            ));
        }
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.journal.lock().push(MockEvent::PeerClosed(self.index));
        if self.options.failing_close {
            return Err(TransportError::Setup("scripted close failure".into()));
        }
        Ok(())
    }
}

pub struct MockChannel {
    label: String,
    index: usize,
    journal: Journal,
    sent: Mutex<Vec<String>>,
    sent_notify: Notify,
    closed: AtomicBool,
}

impl MockChannel {
    fn new(label: &str, index: usize, journal: Journal) -> Self {
        Self {
            label: label.to_string(),
            index,
            journal,
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
        loop {
            // Registered on creation, so a send between the check and the
            // await still wakes us.
            let notified = self.sent_notify.notified();
            {
                let sent = self.sent.lock();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(text);
        self.sent_notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.journal.lock().push(MockEvent::ChannelClosed(self.index));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    async fn offered_peer(connector: &MockConnector) -> Arc<dyn PeerConnection> {
        let (tx, _rx) = unbounded_channel();
        let pc = connector.connect(tx.clone()).await.unwrap();
        pc.create_data_channel("lan", tx).await.unwrap();
        let gather = pc.gathering_complete().await;
        let offer = pc.create_offer().await.unwrap();
        pc.set_local_description(offer).await.unwrap();
        gather.wait().await;
        pc
    }

    #[tokio::test]
    async fn gathered_offer_carries_candidates() {
        let connector = MockConnector::new();
        let pc = offered_peer(&connector).await;
        let local = pc.local_description().await.unwrap();
        assert_eq!(local.kind, SdpKind::Offer);
        assert!(local.sdp.starts_with("v=0"));
        assert!(local.sdp.contains("a=end-of-candidates"));
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn strict_policy_wants_trailing_newline() {
        let connector = MockConnector::new().with_answer_policy(AnswerPolicy::Strict);
        let pc = offered_peer(&connector).await;
        assert!(
            pc.set_remote_description(SessionDescription::answer("v=0\r\na=x"))
                .await
                .is_err()
        );
        pc.set_remote_description(SessionDescription::answer("v=0\r\na=x\n"))
            .await
            .unwrap();
        let peer = connector.latest().unwrap();
        assert_eq!(peer.remote_attempts().len(), 2);
        assert!(peer.remote_description().is_some());
    }

    #[tokio::test]
    async fn delivered_frames_reach_channel_listener() {
        let connector = MockConnector::new();
        let (tx, _state_rx) = unbounded_channel();
        let pc = connector.connect(tx).await.unwrap();
        let (ch_tx, mut ch_rx) = unbounded_channel();
        let channel = pc.create_data_channel("lan", ch_tx).await.unwrap();
        let peer = connector.latest().unwrap();

        peer.deliver("hello");
        assert_eq!(ch_rx.recv().await, Some(PeerEvent::Message("hello".into())));

        channel.send_text("out".into()).await.unwrap();
        assert_eq!(peer.wait_for_sent(1).await, vec!["out".to_string()]);

        channel.close().await.unwrap();
        assert!(peer.channel_closed());
        assert!(channel.send_text("late".into()).await.is_err());
    }

    #[tokio::test]
    async fn manual_gathering_holds_until_released() {
        let connector = MockConnector::new().with_manual_gathering();
        let (tx, _rx) = unbounded_channel();
        let pc = connector.connect(tx).await.unwrap();
        let mut gather = pc.gathering_complete().await;
        let offer = pc.create_offer().await.unwrap();
        pc.set_local_description(offer).await.unwrap();
        assert!(gather.rx.try_recv().is_err());
        connector.latest().unwrap().complete_gathering();
        gather.wait().await;
    }
}
