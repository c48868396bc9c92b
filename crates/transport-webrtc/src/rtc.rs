use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::{
    DataChannel, GatherSignal, PeerConnection, PeerConnector, PeerEvent, PeerEventSender,
    PeerState, SdpKind, SessionDescription, TransportError, TransportResult,
};

/// webrtc-rs backed connector. With no ICE servers only host candidates are
/// gathered, which is what a same-LAN signer pairing needs.
#[derive(Debug, Clone, Default)]
pub struct RtcConnector {
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self, events: PeerEventSender) -> TransportResult<Arc<dyn PeerConnection>> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(to_setup_error)?,
        );

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                debug!(target = "transport_webrtc", state = ?state, "peer connection state changed");
                if let Some(state) = map_state(state) {
                    let _ = events.send(PeerEvent::State(state));
                }
            })
        }));

        Ok(Arc::new(RtcPeerConnection { pc }))
    }
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_data_channel(
        &self,
        label: &str,
        events: PeerEventSender,
    ) -> TransportResult<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        wire_channel_events(&dc, events);
        Ok(Arc::new(RtcDataChannel {
            label: label.to_string(),
            dc,
        }))
    }

    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn gathering_complete(&self) -> GatherSignal {
        GatherSignal::new(self.pc.gathering_complete_promise().await)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> TransportResult<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(to_setup_error)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.map(|desc| {
            let kind = match desc.sdp_type {
                RTCSdpType::Answer => SdpKind::Answer,
                _ => SdpKind::Offer,
            };
            SessionDescription {
                kind,
                sdp: desc.sdp,
            }
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> TransportResult<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|err| TransportError::InvalidDescription(err.to_string()))
    }

    async fn close(&self) -> TransportResult<()> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

struct RtcDataChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> TransportResult<()> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Channel(err.to_string()))
    }

    async fn close(&self) -> TransportResult<()> {
        self.dc
            .close()
            .await
            .map_err(|err| TransportError::Channel(err.to_string()))
    }
}

fn wire_channel_events(dc: &Arc<RTCDataChannel>, events: PeerEventSender) {
    let label = Arc::new(dc.label().to_string());

    {
        let events = events.clone();
        let label = label.clone();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            let label = label.clone();
            Box::pin(async move {
                info!(target = "transport_webrtc", channel = %label, "data channel open");
                let _ = events.send(PeerEvent::ChannelOpen);
            })
        }));
    }

    {
        let events = events.clone();
        let label = label.clone();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            let label = label.clone();
            Box::pin(async move {
                info!(target = "transport_webrtc", channel = %label, "data channel closed");
                let _ = events.send(PeerEvent::ChannelClosed);
            })
        }));
    }

    {
        let events = events.clone();
        let label = label.clone();
        dc.on_error(Box::new(move |err| {
            let events = events.clone();
            let label = label.clone();
            Box::pin(async move {
                warn!(target = "transport_webrtc", channel = %label, error = %err, "data channel error");
                let _ = events.send(PeerEvent::ChannelError(err.to_string()));
            })
        }));
    }

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        let label = label.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = events.send(PeerEvent::Message(text));
                }
                Err(err) => {
                    warn!(
                        target = "transport_webrtc",
                        channel = %label,
                        error = %err,
                        "dropping non-utf8 data channel frame"
                    );
                }
            }
        })
    }));
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc_description(desc: SessionDescription) -> TransportResult<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|err| TransportError::InvalidDescription(err.to_string()))
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}
