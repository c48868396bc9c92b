pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod pairing;
pub mod router;
pub mod rpc;
pub mod signaling;
pub mod telemetry;

use std::sync::Arc;

use extension_bus::{Bus, ContextKind, Origin};
use transport_webrtc::PeerConnector;

use crate::bridge::{BridgeRelay, PageBridge};
use crate::config::GuardianConfig;
use crate::host::InProcessHost;
use crate::pairing::PairingFlow;
use crate::router::MessageRouter;
use crate::rpc::{PendingTable, RpcMultiplexer};
use crate::signaling::SignalingController;

pub use crate::error::{GuardianError, GuardianResult};

/// Every extension context wired together over one bus.
pub struct Guardian {
    config: GuardianConfig,
    bus: Arc<dyn Bus>,
    controller: SignalingController,
    rpc: RpcMultiplexer,
    router: Arc<MessageRouter>,
    host: Arc<InProcessHost>,
}

impl Guardian {
    pub fn new(config: GuardianConfig, connector: Arc<dyn PeerConnector>, bus: Arc<dyn Bus>) -> Self {
        let pending = Arc::new(PendingTable::new());
        let controller = SignalingController::new(
            connector,
            bus.clone(),
            pending.clone(),
            config.channel_label.clone(),
            Origin::new(ContextKind::Offscreen, config.offscreen_url()),
        );
        let rpc = RpcMultiplexer::new(controller.clone(), pending, config.rpc_timeout);
        let host = Arc::new(InProcessHost::new(config.offscreen_url(), config.options_url()));
        let router = Arc::new(MessageRouter::new(
            controller.clone(),
            rpc.clone(),
            host.clone(),
            config.trusted_ui_url(),
        ));
        Self {
            config,
            bus,
            controller,
            rpc,
            router,
            host,
        }
    }

    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }

    pub fn bus(&self) -> Arc<dyn Bus> {
        self.bus.clone()
    }

    pub fn controller(&self) -> &SignalingController {
        &self.controller
    }

    pub fn rpc(&self) -> &RpcMultiplexer {
        &self.rpc
    }

    pub fn router(&self) -> Arc<MessageRouter> {
        self.router.clone()
    }

    pub fn host(&self) -> &InProcessHost {
        &self.host
    }

    pub fn pairing(&self) -> PairingFlow {
        PairingFlow::new(self.router.clone(), self.bus.clone(), self.config.clone())
    }

    /// Starts the content-script relay for pages on this bus.
    pub fn spawn_relay(&self) -> BridgeRelay {
        BridgeRelay::spawn(
            self.bus.clone(),
            self.router.clone(),
            self.config.provider_marker.clone(),
        )
    }

    pub fn page_bridge(&self, page_url: impl Into<String>) -> PageBridge {
        PageBridge::new(self.bus.clone(), self.config.provider_marker.clone(), page_url)
            .with_timeout(self.config.rpc_timeout)
    }

    pub async fn shutdown(&self) {
        self.controller.reset().await;
    }
}
