//! Popup-side pairing flow: fetch an offer, hand it to the signer, apply the
//! signer's answer and wait for the link to come up.

use std::sync::Arc;
use std::time::Duration;

use extension_bus::{Bus, BusMessage, ContextKind, Origin, TOPIC_RUNTIME};
use guardian_proto::ControlMessage;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::config::GuardianConfig;
use crate::error::{GuardianError, GuardianResult};
use crate::router::{MessageRouter, RouterReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Init,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferLink {
    pub sdp: String,
    pub link: String,
}

pub struct PairingFlow {
    router: Arc<MessageRouter>,
    bus: Arc<dyn Bus>,
    origin: Origin,
    config: GuardianConfig,
    state: Mutex<PairingState>,
}

impl PairingFlow {
    pub fn new(router: Arc<MessageRouter>, bus: Arc<dyn Bus>, config: GuardianConfig) -> Self {
        Self {
            router,
            bus,
            origin: Origin::new(ContextKind::Popup, config.trusted_ui_url()),
            config,
            state: Mutex::new(PairingState::Init),
        }
    }

    pub fn state(&self) -> PairingState {
        *self.state.lock()
    }

    fn set_state(&self, state: PairingState) {
        *self.state.lock() = state;
    }

    async fn send(&self, message: ControlMessage) -> Option<RouterReply> {
        self.router.dispatch_value(&message.to_value(), &self.origin).await
    }

    /// `refresh` discards the current session and negotiates a new one.
    pub async fn fetch_offer(&self, refresh: bool) -> GuardianResult<OfferLink> {
        self.set_state(PairingState::Init);
        if let Some(RouterReply::Ensured(created)) = self.send(ControlMessage::EnsureOffscreen).await {
            debug!(target = "guardian::pairing", created, "offscreen context ready");
        }
        match self.send(ControlMessage::MakeOffer { refresh }).await {
            Some(RouterReply::Offer(offer)) if offer.is_offer() => {
                let link = self.config.offer_link(&offer.sdp);
                info!(target = "guardian::pairing", refresh, "offer ready");
                Ok(OfferLink {
                    sdp: offer.sdp,
                    link,
                })
            }
            Some(RouterReply::Failure(failure)) => {
                Err(GuardianError::SignalingFailure(failure.message))
            }
            Some(other) => Err(GuardianError::SignalingFailure(format!(
                "unexpected reply to offer request: {other:?}"
            ))),
            None => Err(GuardianError::SignalingFailure(
                "an offer is already being negotiated".into(),
            )),
        }
    }

    /// Applies the signer's answer and waits for the connection broadcast.
    pub async fn submit_answer(&self, answer_sdp: &str) -> GuardianResult<()> {
        // Subscribe first so the broadcast cannot slip past.
        let runtime = self.bus.subscribe(TOPIC_RUNTIME);
        let reply = self
            .send(ControlMessage::SetAnswer {
                answer_sdp: answer_sdp.to_string(),
            })
            .await;
        if reply != Some(RouterReply::Answer(true)) {
            warn!(target = "guardian::pairing", "answer was not accepted");
            return Err(GuardianError::AnswerRejected);
        }

        self.set_state(PairingState::Connecting);
        info!(target = "guardian::pairing", "answer applied, waiting for connection");
        match tokio::time::timeout(self.config.connect_timeout, wait_for_connection(runtime)).await {
            Ok(true) => {
                self.set_state(PairingState::Connected);
                info!(target = "guardian::pairing", "paired");
                Ok(())
            }
            Ok(false) => {
                self.set_state(PairingState::Init);
                Err(GuardianError::Transport("runtime bus closed".into()))
            }
            Err(_) => {
                self.set_state(PairingState::Init);
                warn!(
                    target = "guardian::pairing",
                    timeout_ms = duration_ms(self.config.connect_timeout),
                    "connection not established in time"
                );
                Err(GuardianError::Timeout)
            }
        }
    }
}

async fn wait_for_connection(mut runtime: broadcast::Receiver<BusMessage>) -> bool {
    let established = ControlMessage::ConnectionEstablished.kind();
    loop {
        match runtime.recv().await {
            Ok(message) => {
                if message.payload.get("type").and_then(|t| t.as_str()) == Some(established) {
                    return true;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return false,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
