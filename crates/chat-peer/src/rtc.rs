//! Native negotiation primitive built on webrtc-rs.
//!
//! Each remote peer gets its own `RTCPeerConnection`. webrtc-rs reports
//! everything through callbacks; those only translate into [`PeerEvent`]s
//! and push them into the sequencer's channel.

use async_trait::async_trait;
use chat_core::transport::Result;
use chat_core::{
    ConnectionId, DataChannel, IceCandidate, Negotiator, PeerEvent, PeerId, RtcConnection,
    RtcError, SdpKind, SessionDescription,
};
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Public STUN server used when none is configured.
pub const DEFAULT_STUN_URL: &str = "stun:openrelay.metered.ca:80";

/// Creates one webrtc-rs peer connection per remote participant.
pub struct WebrtcNegotiator {
    api: API,
    ice_urls: Vec<String>,
}

impl WebrtcNegotiator {
    pub fn new(ice_urls: Vec<String>) -> Self {
        Self {
            api: APIBuilder::new().build(),
            ice_urls,
        }
    }

    fn config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_urls.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl Negotiator for WebrtcNegotiator {
    async fn connect(
        &self,
        peer_id: PeerId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcConnection>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config())
                .await
                .map_err(rejected)?,
        );
        let id = ConnectionId::next();
        debug!("Created peer connection {} for {}", id, peer_id);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            // None marks the end of gathering; nothing to forward.
            if let Some(cand) = cand {
                match cand.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate {
                            peer_id,
                            connection_id: id,
                            candidate: from_rtc_candidate(init),
                        });
                    }
                    Err(e) => warn!("Failed to encode local candidate for {}: {}", peer_id, e),
                }
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            debug!("Data channel '{}' announced by {}", dc.label(), peer_id);
            watch_channel(peer_id, id, &dc, tx.clone());
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Connection to {} is {}", peer_id, state);
            if state == RTCPeerConnectionState::Failed {
                info!("Connection to {} failed", peer_id);
                let _ = tx.send(PeerEvent::ChannelClosed {
                    peer_id,
                    connection_id: id,
                });
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(WebrtcConnection {
            id,
            peer_id,
            pc,
            events,
        }))
    }
}

/// Forward a data channel's lifecycle and messages as peer events.
fn watch_channel(
    peer_id: PeerId,
    connection_id: ConnectionId,
    dc: &Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    // Handlers are owned by the channel; a strong ref here would be a cycle.
    let weak: Weak<RTCDataChannel> = Arc::downgrade(dc);
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        if let Some(dc) = weak.upgrade() {
            let _ = tx.send(PeerEvent::ChannelOpen {
                peer_id,
                connection_id,
                channel: Arc::new(WebrtcChannel { dc }),
            });
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(PeerEvent::ChannelMessage {
                        peer_id,
                        connection_id,
                        text,
                    });
                }
                Err(e) => warn!("Invalid UTF-8 from {}: {}", peer_id, e),
            }
        } else {
            debug!("Ignoring binary message from {}", peer_id);
        }
        Box::pin(async {})
    }));

    dc.on_close(Box::new(move || {
        let _ = events.send(PeerEvent::ChannelClosed {
            peer_id,
            connection_id,
        });
        Box::pin(async {})
    }));
}

pub struct WebrtcConnection {
    id: ConnectionId,
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

#[async_trait]
impl RtcConnection for WebrtcConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(rejected)?;
        watch_channel(self.peer_id, self.id, &dc, self.events.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(rejected)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(rejected)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(rejected)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(rejected)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(rejected)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(rejected)
    }
}

/// An open webrtc-rs data channel.
pub struct WebrtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl Debug for WebrtcChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebrtcChannel")
            .field("label", &self.dc.label())
            .field("id", &self.dc.id())
            .finish()
    }
}

#[async_trait]
impl DataChannel for WebrtcChannel {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(rejected)
    }
}

fn rejected(e: webrtc::Error) -> RtcError {
    RtcError::Rejected(e.to_string())
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let converted = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return Err(RtcError::InvalidState("rollback is not supported".to_string()));
        }
    };
    converted.map_err(|e| RtcError::InvalidPayload(e.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(RtcError::InvalidPayload(
                "session description without a type".to_string(),
            ));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
