use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use ::webrtc::api::{setting_engine::SettingEngine, APIBuilder, API};
use ::webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use ::webrtc::data_channel::data_channel_message::DataChannelMessage;
use ::webrtc::data_channel::data_channel_state::RTCDataChannelState;
use ::webrtc::data_channel::RTCDataChannel;
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::RTCPeerConnection;
use async_trait::async_trait;
use bonfire_proto::{IceCandidate, SdpKind, SessionDescription};
use tracing::{debug, trace, warn};

use super::{
    ConnectionState, DataChannel, LinkEvent, LinkEventSender, LinkId, LinkRole, PeerTransport,
    TransportAdapter, TransportError,
};

pub mod config;

pub use config::WebRtcConfig;

/// Builds webrtc-rs peer connections, one per link.
pub struct WebRtcAdapter {
    api: API,
    config: WebRtcConfig,
}

impl WebRtcAdapter {
    pub fn new(config: WebRtcConfig) -> Self {
        let mut settings = SettingEngine::default();
        if config.include_loopback {
            settings.set_include_loopback_candidate(true);
        }
        let api = APIBuilder::new().with_setting_engine(settings).build();
        Self { api, config }
    }
}

#[async_trait]
impl TransportAdapter for WebRtcAdapter {
    async fn create_link(
        &self,
        link: LinkId,
        role: LinkRole,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|err| TransportError::Setup(format!("peer connection: {err}")))?,
        );

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    debug!(target: "bonfire::transport", %link, ?state, "peer connection state changed");
                    let _ = events.send(LinkEvent::ConnectionState {
                        link,
                        state: map_state(state),
                    });
                })
            },
        ));

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(target: "bonfire::transport", %link, "candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(LinkEvent::LocalCandidate {
                            link,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            },
                        });
                    }
                    Err(err) => {
                        warn!(target: "bonfire::transport", %link, error = %err, "failed to serialise local candidate");
                    }
                }
            })
        }));

        match role {
            LinkRole::Offerer => {
                let init = RTCDataChannelInit {
                    ordered: Some(self.config.ordered),
                    ..Default::default()
                };
                let channel = peer_connection
                    .create_data_channel(&self.config.channel_label, Some(init))
                    .await
                    .map_err(|err| TransportError::Setup(format!("data channel: {err}")))?;
                wire_channel(link, channel, events);
            }
            LinkRole::Answerer => {
                let channel_events = events.clone();
                peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                    let events = channel_events.clone();
                    Box::pin(async move {
                        debug!(target: "bonfire::transport", %link, label = channel.label(), "data channel received");
                        wire_channel(link, channel, events);
                    })
                }));
            }
        }

        Ok(Arc::new(WebRtcLink {
            link,
            peer_connection,
            closed: AtomicBool::new(false),
        }))
    }
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

/// Forwards channel lifecycle and text frames as link events.
fn wire_channel(link: LinkId, channel: Arc<RTCDataChannel>, events: LinkEventSender) {
    let _ = events.send(LinkEvent::Channel {
        link,
        channel: Arc::new(WebRtcChannel {
            channel: Arc::clone(&channel),
        }),
    });

    let open_events = events.clone();
    channel.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            debug!(target: "bonfire::transport", %link, "data channel open");
            let _ = events.send(LinkEvent::ChannelOpen { link });
        })
    }));

    let close_events = events.clone();
    channel.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            debug!(target: "bonfire::transport", %link, "data channel closed");
            let _ = events.send(LinkEvent::ChannelClosed { link });
        })
    }));

    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            if !message.is_string {
                trace!(target: "bonfire::transport", %link, "ignoring binary frame");
                return;
            }
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    let _ = events.send(LinkEvent::ChannelMessage { link, text });
                }
                Err(_) => {
                    warn!(target: "bonfire::transport", %link, "dropping non utf-8 text frame");
                }
            }
        })
    }));
}

struct WebRtcLink {
    link: LinkId,
    peer_connection: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

fn negotiation(err: ::webrtc::Error) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

#[async_trait]
impl PeerTransport for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(negotiation)?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(negotiation)?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(negotiation)?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(negotiation)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(negotiation)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.peer_connection.close().await {
            debug!(target: "bonfire::transport", link = %self.link, error = %err, "peer connection close reported an error");
        }
    }
}

struct WebRtcChannel {
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        self.channel.label()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.channel.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }
        self.channel
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Connection(err.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel
            .close()
            .await
            .map_err(|err| TransportError::Connection(err.to_string()))
    }
}
