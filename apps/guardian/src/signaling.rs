//! Offer/answer negotiation and ownership of the single peer session.
//!
//! The controller is the only holder of the live connection and channel.
//! Every session gets a fresh generation number; event pumps and pending
//! requests remember the generation they were created under and go quiet once
//! it is superseded.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use extension_bus::{Bus, BusError, Origin, TOPIC_RUNTIME};
use guardian_proto::ControlMessage;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use transport_webrtc::{
    DataChannel, PeerConnection, PeerConnector, PeerEvent, PeerEventReceiver, PeerState,
    SessionDescription, TransportError,
};

use crate::error::{GuardianError, GuardianResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Offering,
    Offered,
    Connecting,
    Connected,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Offering => "offering",
            SessionState::Offered => "offered",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives what the live session's channel delivers. Implemented by the
/// RPC pending table.
pub trait ChannelSink: Send + Sync {
    fn on_message(&self, generation: u64, text: &str);
    fn on_error(&self, generation: u64, reason: &str);
    /// The session of `generation` is gone; nothing it owned may settle later.
    fn on_closed(&self, generation: u64);
}

struct PeerSession {
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    channel: Option<Arc<dyn DataChannel>>,
    channel_open: bool,
    local: Option<SessionDescription>,
}

struct Slot {
    session: Option<PeerSession>,
    state: SessionState,
}

struct Inner {
    connector: Arc<dyn PeerConnector>,
    bus: Arc<dyn Bus>,
    sink: Arc<dyn ChannelSink>,
    channel_label: String,
    identity: Origin,
    slot: Mutex<Slot>,
    offer_in_flight: AtomicBool,
    generations: AtomicU64,
}

#[derive(Clone)]
pub struct SignalingController {
    inner: Arc<Inner>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SignalingController {
    /// `identity` is the sender stamped on broadcasts this controller emits.
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        bus: Arc<dyn Bus>,
        sink: Arc<dyn ChannelSink>,
        channel_label: impl Into<String>,
        identity: Origin,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                bus,
                sink,
                channel_label: channel_label.into(),
                identity,
                slot: Mutex::new(Slot {
                    session: None,
                    state: SessionState::Idle,
                }),
                offer_in_flight: AtomicBool::new(false),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.slot.lock().state
    }

    pub fn has_session(&self) -> bool {
        self.inner.slot.lock().session.is_some()
    }

    /// Generation of the live session, if any.
    pub fn generation(&self) -> Option<u64> {
        self.inner
            .slot
            .lock()
            .session
            .as_ref()
            .map(|session| session.generation)
    }

    /// The live session's channel once it has opened.
    pub fn active_channel(&self) -> Option<(u64, Arc<dyn DataChannel>)> {
        let slot = self.inner.slot.lock();
        let session = slot.session.as_ref()?;
        if !session.channel_open {
            return None;
        }
        session
            .channel
            .clone()
            .map(|channel| (session.generation, channel))
    }

    /// Produces a complete local offer. Returns `Ok(None)` when another
    /// negotiation is already running.
    pub async fn request_offer(&self, refresh: bool) -> GuardianResult<Option<SessionDescription>> {
        if self.inner.offer_in_flight.swap(true, Ordering::SeqCst) {
            debug!(target = "guardian::signaling", refresh, "offer already in flight");
            return Ok(None);
        }
        let _in_flight = InFlight(&self.inner.offer_in_flight);

        if !refresh {
            let slot = self.inner.slot.lock();
            if let Some(local) = slot.session.as_ref().and_then(|s| s.local.clone()) {
                debug!(target = "guardian::signaling", "reusing existing offer");
                return Ok(Some(local));
            }
        }

        self.reset().await;
        match self.negotiate().await {
            Ok(local) => Ok(Some(local)),
            Err(err) => {
                error!(target = "guardian::signaling", error = %err, "offer negotiation failed");
                self.reset().await;
                Err(GuardianError::signaling(err))
            }
        }
    }

    async fn negotiate(&self) -> Result<SessionDescription, TransportError> {
        let inner = &self.inner;
        let generation = inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let connection = inner.connector.connect(events_tx.clone()).await?;
        {
            let mut slot = inner.slot.lock();
            slot.session = Some(PeerSession {
                generation,
                connection: connection.clone(),
                channel: None,
                channel_open: false,
                local: None,
            });
            slot.state = SessionState::Offering;
        }
        info!(target = "guardian::signaling", generation, "peer session created");
        tokio::spawn(pump_events(Arc::downgrade(inner), generation, events_rx));

        let channel = connection
            .create_data_channel(&inner.channel_label, events_tx)
            .await?;
        debug!(target = "guardian::signaling", generation, channel = channel.label(), "data channel created");
        self.update_session(generation, |session| session.channel = Some(channel))?;

        let gathered = connection.gathering_complete().await;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer).await?;
        gathered.wait().await;
        debug!(target = "guardian::signaling", generation, "candidate gathering complete");

        let local = connection
            .local_description()
            .await
            .ok_or_else(|| TransportError::Setup("no local description after gathering".into()))?;
        self.update_session(generation, |session| session.local = Some(local.clone()))?;
        {
            let mut slot = inner.slot.lock();
            if slot.state == SessionState::Offering {
                slot.state = SessionState::Offered;
            }
        }
        info!(target = "guardian::signaling", generation, "offer ready");
        Ok(local)
    }

    fn update_session(
        &self,
        generation: u64,
        update: impl FnOnce(&mut PeerSession),
    ) -> Result<(), TransportError> {
        let mut slot = self.inner.slot.lock();
        match slot.session.as_mut() {
            Some(session) if session.generation == generation => {
                update(session);
                Ok(())
            }
            _ => Err(TransportError::Closed),
        }
    }

    /// Applies the remote answer, retrying once with a trailing line
    /// terminator when the first attempt does not parse.
    pub async fn apply_answer(&self, answer_sdp: &str) -> bool {
        let (generation, connection) = {
            let slot = self.inner.slot.lock();
            match slot.session.as_ref() {
                Some(session) => (session.generation, session.connection.clone()),
                None => {
                    warn!(target = "guardian::signaling", "answer received without a peer session");
                    return false;
                }
            }
        };

        let first = connection
            .set_remote_description(SessionDescription::answer(answer_sdp))
            .await;
        let applied = match first {
            Ok(()) => Ok(()),
            Err(TransportError::InvalidDescription(reason)) => {
                debug!(
                    target = "guardian::signaling",
                    generation,
                    error = %reason,
                    "answer rejected, retrying with line terminator"
                );
                connection
                    .set_remote_description(SessionDescription::answer(format!("{answer_sdp}\n")))
                    .await
            }
            Err(err) => Err(err),
        };

        if let Err(err) = applied {
            warn!(target = "guardian::signaling", generation, error = %err, "failed to apply answer");
            return false;
        }

        let mut slot = self.inner.slot.lock();
        let current = slot
            .session
            .as_ref()
            .is_some_and(|session| session.generation == generation);
        if current && slot.state == SessionState::Offered {
            slot.state = SessionState::Connecting;
        }
        info!(target = "guardian::signaling", generation, "remote answer applied");
        true
    }

    /// Releases the live session, if any. Safe to call repeatedly.
    pub async fn reset(&self) {
        let session = {
            let mut slot = self.inner.slot.lock();
            let session = slot.session.take();
            if session.is_some() {
                slot.state = SessionState::Closed;
            }
            session
        };
        if let Some(session) = session {
            self.inner.release(session).await;
        }
    }
}

impl Inner {
    /// Tears down the session only if `generation` is still the live one.
    async fn reset_generation(&self, generation: u64) {
        let session = {
            let mut slot = self.slot.lock();
            let current = slot
                .session
                .as_ref()
                .is_some_and(|session| session.generation == generation);
            if !current {
                return;
            }
            slot.state = SessionState::Closed;
            slot.session.take()
        };
        if let Some(session) = session {
            self.release(session).await;
        }
    }

    async fn release(&self, session: PeerSession) {
        let generation = session.generation;
        if let Some(channel) = session.channel {
            if let Err(err) = channel.close().await {
                warn!(target = "guardian::signaling", generation, error = %err, "failed to close data channel");
            }
        }
        if let Err(err) = session.connection.close().await {
            warn!(target = "guardian::signaling", generation, error = %err, "failed to close peer connection");
        }
        self.sink.on_closed(generation);
        info!(target = "guardian::signaling", generation, "peer session released");
    }

    fn is_current(&self, generation: u64) -> bool {
        self.slot
            .lock()
            .session
            .as_ref()
            .is_some_and(|session| session.generation == generation)
    }

    fn set_channel_open(&self, generation: u64, open: bool) {
        let mut slot = self.slot.lock();
        if let Some(session) = slot.session.as_mut() {
            if session.generation == generation {
                session.channel_open = open;
            }
        }
    }

    fn mark_connected(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock();
        let current = slot
            .session
            .as_ref()
            .is_some_and(|session| session.generation == generation);
        if current {
            slot.state = SessionState::Connected;
        }
        current
    }

    fn announce_connected(&self, generation: u64) {
        let payload = ControlMessage::ConnectionEstablished.to_value();
        match self.bus.publish(TOPIC_RUNTIME, self.identity.clone(), payload) {
            Ok(()) => info!(target = "guardian::signaling", generation, "transport established"),
            Err(BusError::NoListeners(_)) => {
                debug!(target = "guardian::signaling", generation, "transport established, nobody listening")
            }
            Err(err) => {
                warn!(target = "guardian::signaling", generation, error = %err, "failed to announce connection")
            }
        }
    }
}

async fn pump_events(inner: Weak<Inner>, generation: u64, mut events: PeerEventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.is_current(generation) {
            trace!(target = "guardian::signaling", generation, ?event, "dropping stale session event");
            break;
        }
        match event {
            PeerEvent::State(state) => {
                debug!(target = "guardian::signaling", generation, state = ?state, "peer state changed");
                if state == PeerState::Connected {
                    if inner.mark_connected(generation) {
                        inner.announce_connected(generation);
                    }
                } else if state.is_terminal() {
                    info!(target = "guardian::signaling", generation, state = ?state, "peer session ended");
                    inner.reset_generation(generation).await;
                    break;
                }
            }
            PeerEvent::ChannelOpen => {
                info!(target = "guardian::signaling", generation, "data channel open");
                inner.set_channel_open(generation, true);
            }
            PeerEvent::ChannelClosed => {
                info!(target = "guardian::signaling", generation, "data channel closed");
                inner.set_channel_open(generation, false);
            }
            PeerEvent::Message(text) => inner.sink.on_message(generation, &text),
            PeerEvent::ChannelError(reason) => {
                warn!(target = "guardian::signaling", generation, error = %reason, "data channel error");
                inner.sink.on_error(generation, &reason);
            }
        }
    }
}
