//! The trust boundary between extension contexts.
//!
//! Control messages drive negotiation and are only honoured when the platform
//! reports the trusted popup as their sender. Operation calls are forwarded to
//! the multiplexer as-is; they reach the router only through the page bridge
//! relay.

use std::sync::Arc;

use extension_bus::Origin;
use guardian_proto::{
    ControlMessage, OfferReply, Operation, PageOutcome, ProtoError, RemoteFailure, RuntimeMessage,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{GuardianError, GuardianResult};
use crate::host::ExtensionHost;
use crate::rpc::RpcMultiplexer;
use crate::signaling::SignalingController;

/// Reply handed back to the sender of a runtime message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterReply {
    Offer(OfferReply),
    Answer(bool),
    Ensured(bool),
    Outcome(PageOutcome),
    Failure(RemoteFailure),
}

impl RouterReply {
    pub fn to_value(&self) -> Value {
        match self {
            RouterReply::Offer(offer) => serde_json::json!({"type": offer.kind, "sdp": offer.sdp}),
            RouterReply::Answer(applied) => Value::Bool(*applied),
            RouterReply::Ensured(created) => Value::Bool(*created),
            RouterReply::Outcome(outcome) => {
                serde_json::to_value(outcome).unwrap_or(Value::Null)
            }
            RouterReply::Failure(failure) => serde_json::json!({
                "success": false,
                "error": failure,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallReason {
    Install,
    Update,
    BrowserUpdate,
}

pub struct MessageRouter {
    controller: SignalingController,
    rpc: RpcMultiplexer,
    host: Arc<dyn ExtensionHost>,
    trusted_ui: String,
}

impl MessageRouter {
    pub fn new(
        controller: SignalingController,
        rpc: RpcMultiplexer,
        host: Arc<dyn ExtensionHost>,
        trusted_ui: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            rpc,
            host,
            trusted_ui: trusted_ui.into(),
        }
    }

    /// Entry point for raw runtime messages. Unknown kinds are ignored.
    pub async fn dispatch_value(&self, payload: &Value, sender: &Origin) -> Option<RouterReply> {
        match RuntimeMessage::from_value(payload) {
            Ok(message) => self.dispatch(message, sender).await,
            Err(ProtoError::UnknownType(kind)) => {
                debug!(target = "guardian::router", kind = %kind, "ignoring unknown message type");
                None
            }
            Err(err) => {
                warn!(target = "guardian::router", error = %err, "ignoring malformed message");
                None
            }
        }
    }

    pub async fn dispatch(&self, message: RuntimeMessage, sender: &Origin) -> Option<RouterReply> {
        match message {
            RuntimeMessage::Control(ControlMessage::ConnectionEstablished) => {
                debug!(target = "guardian::router", "connection notification needs no handling");
                None
            }
            RuntimeMessage::Control(control) => {
                if let Err(err) = self.authorize(sender) {
                    warn!(
                        target = "guardian::router",
                        kind = control.kind(),
                        error = %err,
                        "ignoring control message"
                    );
                    return None;
                }
                self.handle_control(control).await
            }
            RuntimeMessage::Operation { op, params } => {
                Some(RouterReply::Outcome(self.forward(op, params).await))
            }
        }
    }

    fn authorize(&self, sender: &Origin) -> GuardianResult<()> {
        if sender.url_starts_with(&self.trusted_ui) {
            Ok(())
        } else {
            Err(GuardianError::UntrustedSender {
                url: sender.url.clone(),
            })
        }
    }

    async fn handle_control(&self, control: ControlMessage) -> Option<RouterReply> {
        match control {
            ControlMessage::EnsureOffscreen => match self.host.ensure_offscreen().await {
                Ok(created) => Some(RouterReply::Ensured(created)),
                Err(err) => {
                    error!(target = "guardian::router", error = %err, "failed to ensure offscreen context");
                    Some(RouterReply::Failure(err.to_failure()))
                }
            },
            ControlMessage::MakeOffer { refresh } => {
                match self.controller.request_offer(refresh).await {
                    Ok(Some(local)) => Some(RouterReply::Offer(OfferReply::new(local.sdp))),
                    Ok(None) => None,
                    Err(err) => Some(RouterReply::Failure(err.to_failure())),
                }
            }
            ControlMessage::SetAnswer { answer_sdp } => Some(RouterReply::Answer(
                self.controller.apply_answer(&answer_sdp).await,
            )),
            ControlMessage::ConnectionEstablished => None,
        }
    }

    async fn forward(&self, op: Operation, params: Value) -> PageOutcome {
        let result = self.rpc.call(op, params).await;
        if let Err(err) = &result {
            debug!(target = "guardian::router", op = %op, error = %err, "operation failed");
        }
        PageOutcome::from_result(result.map_err(|err| err.to_failure()))
    }

    /// Runs the one-time setup on a fresh install.
    pub async fn on_installed(&self, reason: InstallReason) {
        if reason != InstallReason::Install {
            return;
        }
        info!(target = "guardian::router", "first install, opening options page");
        if let Err(err) = self.host.open_options_page().await {
            warn!(target = "guardian::router", error = %err, "failed to open options page");
        }
    }
}
