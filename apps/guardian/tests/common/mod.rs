#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use extension_bus::LocalBus;
use guardian_core::Guardian;
use guardian_core::config::GuardianConfig;
use guardian_core::pairing::PairingFlow;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use transport_webrtc::mock::{MockConnector, MockPeer};

pub const PAGE_URL: &str = "https://app.example/";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn guardian(connector: Arc<MockConnector>) -> Guardian {
    init_tracing();
    let config = GuardianConfig {
        connect_timeout: Duration::from_secs(3),
        ..GuardianConfig::default()
    };
    Guardian::new(config, connector, Arc::new(LocalBus::new()))
}

/// Runs the popup flow to completion against the latest mock peer.
pub async fn pair(guardian: &Guardian, connector: &MockConnector) -> Arc<MockPeer> {
    let pairing = Arc::new(guardian.pairing());
    pairing.fetch_offer(false).await.expect("offer");
    let peer = connector.latest().expect("peer created");

    let submit = tokio::spawn({
        let pairing: Arc<PairingFlow> = pairing.clone();
        async move { pairing.submit_answer("v=0\r\na=signer\r\n").await }
    });
    while peer.remote_description().is_none() {
        tokio::task::yield_now().await;
    }
    peer.establish();
    submit.await.expect("join").expect("paired");
    peer
}

/// Plays the remote signer: answers every frame sent on the peer's channel.
pub fn serve_signer(
    peer: Arc<MockPeer>,
    respond: impl Fn(&str, &Value) -> Value + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut handled = 0;
        loop {
            let frames = peer.wait_for_sent(handled + 1).await;
            for frame in &frames[handled..] {
                let request: Value = serde_json::from_str(frame).expect("request is json");
                let id = request["id"].as_str().unwrap_or_default();
                let kind = request["type"].as_str().unwrap_or_default();
                let mut response = respond(kind, &request["params"]);
                response["id"] = json!(id);
                peer.deliver(response.to_string());
            }
            handled = frames.len();
        }
    })
}
