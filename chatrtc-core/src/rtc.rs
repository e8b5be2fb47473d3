//! `webrtc` crate backend for [`PeerConnectionManager`](crate::peer::PeerConnectionManager)

use crate::config::IceServerConfig;
use crate::media::LocalTrack;
use crate::peer::{
    IceCandidate, OfferOptions, PeerConnectionBackend, PeerConnectionFactory, PeerError,
    PeerEvent, SdpType, SessionDescription,
};
use crate::types::{ConnectionState, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

fn backend_error(context: &str) -> impl FnOnce(webrtc::Error) -> PeerError + '_ {
    move |e| PeerError::Backend(format!("{context}: {e}"))
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

/// Builds `webrtc` peer connections with default codecs and interceptors
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnectionBackend>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(backend_error("Failed to register codecs"))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(backend_error("Failed to register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(backend_error("Failed to create peer connection"))?,
        );
        register_handlers(&pc, events);
        tracing::debug!(ice_servers = ice_servers.len(), "Created webrtc peer connection");

        Ok(Arc::new(WebRtcPeer {
            pc,
            senders: Mutex::new(HashMap::new()),
            receiving: Mutex::new(Vec::new()),
        }))
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize local ICE candidate"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::debug!(%state, "webrtc connection state");
        if let Some(state) = map_state(state) {
            let _ = tx.send(PeerEvent::StateChanged(state));
        }
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let _ = tx.send(PeerEvent::RemoteTrack {
                stream_id: track.stream_id(),
                track_id: track.id(),
                kind,
            });
            Box::pin(async move {
                // Drain RTP so the receive buffer never backs up; rendering is
                // left to the embedding application.
                tokio::spawn(async move {
                    let mut packets: u64 = 0;
                    while track.read_rtp().await.is_ok() {
                        packets += 1;
                    }
                    tracing::debug!(track_id = %track.id(), packets, "Remote track ended");
                });
            })
        },
    ));
}

/// One `webrtc` peer connection
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
    receiving: Mutex<Vec<TrackKind>>,
}

impl WebRtcPeer {
    /// Add recv-only transceivers for requested kinds we do not send
    async fn ensure_receivers(&self, options: OfferOptions) -> Result<(), PeerError> {
        let wanted = [
            (TrackKind::Audio, options.receive_audio),
            (TrackKind::Video, options.receive_video),
        ];
        for (kind, wanted) in wanted {
            let missing = wanted
                && !self.senders.lock().contains_key(&kind)
                && !self.receiving.lock().contains(&kind);
            if !missing {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    codec_type(kind),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(backend_error("Failed to add receive transceiver"))?;
            self.receiving.lock().push(kind);
            tracing::debug!(?kind, "Added recv-only transceiver");
        }
        Ok(())
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
        let parsed = match description.kind {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        };
        parsed.map_err(|e| PeerError::InvalidDescription(e.to_string()))
    }
}

#[async_trait]
impl PeerConnectionBackend for WebRtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let sender = self
            .pc
            .add_track(track.rtc_track())
            .await
            .map_err(backend_error("Failed to add track"))?;

        // Read incoming RTCP so interceptors (NACK, reports) keep working
        let rtcp = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().insert(track.kind(), sender);
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let sender = self.senders.lock().get(&track.kind()).cloned();
        match sender {
            Some(sender) => sender
                .replace_track(Some(track.rtc_track()))
                .await
                .map_err(backend_error("Failed to replace track")),
            None => self.add_track(track).await,
        }
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, PeerError> {
        self.ensure_receivers(options).await?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(backend_error("Failed to create offer"))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(backend_error("Failed to create answer"))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(backend_error("Failed to set local description"))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(backend_error("Failed to set remote description"))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(backend_error("Failed to add ICE candidate"))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(backend_error("Failed to close peer connection"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            Some(ConnectionState::Connected)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_offer_carries_local_tracks_and_receive_video() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = WebRtcPeerFactory::new().create(&[], tx).await.unwrap();
        let audio = LocalTrack::new(TrackKind::Audio, None, "local");
        peer.add_track(&audio).await.unwrap();

        let offer = peer.create_offer(OfferOptions::default()).await.unwrap();

        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
        peer.close().await.unwrap();
    }
}
