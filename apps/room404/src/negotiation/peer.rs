use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::{EngineMessage, NegotiationError};
use crate::media::LocalMedia;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(3);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(10);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

/// A track the partner is sending. `handle` is the live webrtc track when
/// the peer transport is a real one.
#[derive(Clone)]
pub struct RemoteTrack {
    pub info: RemoteTrackInfo,
    pub handle: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("info", &self.info)
            .field("live", &self.handle.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    ConnectionState(PeerConnectionState),
}

/// Where a peer transport reports its callbacks. Bound to one session
/// generation so the controller can drop events from a torn-down peer.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl PeerEventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<EngineMessage>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(EngineMessage::Peer {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// One peer media connection. `create_offer` and `create_answer` also set
/// the local description.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), NegotiationError>;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_remote_description(&self, sdp: SessionDescription)
    -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn close(&self) -> Result<(), NegotiationError>;
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError>;
}

fn build_api(setting: SettingEngine) -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(setup_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting)
        .build())
}

fn setup_error<E: std::fmt::Display>(err: E) -> NegotiationError {
    NegotiationError::PeerSetup(err.to_string())
}

fn sdp_error<E: std::fmt::Display>(err: E) -> NegotiationError {
    NegotiationError::Sdp(err.to_string())
}

/// Builds webrtc-rs peer connections with the default codec set.
#[derive(Debug, Clone, Default)]
pub struct RtcPeerFactory {
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerTransportFactory for RtcPeerFactory {
    async fn create(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(ICE_DISCONNECTED_TIMEOUT),
            Some(ICE_FAILED_TIMEOUT),
            Some(ICE_KEEPALIVE_INTERVAL),
        );
        let api = build_api(setting)?;
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(setup_error)?,
        );
        let generation = events.generation();

        let candidate_sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "room404::negotiation", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let track_sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = track_sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        other => {
                            tracing::debug!(target = "room404::negotiation", kind = ?other, "ignoring remote track of unknown kind");
                            return;
                        }
                    };
                    let info = RemoteTrackInfo {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    };
                    tracing::debug!(target = "room404::negotiation", generation, track = ?info, "remote track");
                    sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
                        info,
                        handle: Some(track),
                    }));
                })
            },
        ));

        let state_sink = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "room404::negotiation", generation, ?state, "peer connection state changed");
                let mapped = match state {
                    RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                    RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
                    _ => return,
                };
                sink.emit(PeerEvent::ConnectionState(mapped));
            })
        }));

        Ok(Arc::new(RtcPeerTransport { pc }))
    }
}

pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerTransport {
    /// With nothing to send, an offer still needs media sections to receive.
    async fn ensure_receive_sections(&self) -> Result<(), NegotiationError> {
        if !self.pc.get_transceivers().await.is_empty() {
            return Ok(());
        }
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(setup_error)?;
        }
        tracing::debug!(target = "room404::negotiation", "offering receive-only");
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), NegotiationError> {
        for track in media.tracks() {
            let sender = self
                .pc
                .add_track(track)
                .await
                .map_err(|err| NegotiationError::Track(err.to_string()))?;
            // RTCP has to be drained for the interceptors to run.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_receive_sections().await?;
        let offer = self.pc.create_offer(None).await.map_err(sdp_error)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(sdp_error)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(sdp_error)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(sdp_error)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &self,
        sdp: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = match sdp.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.sdp),
        }
        .map_err(sdp_error)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(sdp_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| NegotiationError::Candidate(err.to_string()))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await.map_err(setup_error)
    }
}
