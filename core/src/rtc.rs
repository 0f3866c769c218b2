//! Native peer connections backed by the `webrtc` crate

use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::media::{MediaTrack, TrackKind};
use crate::models::{IceCandidate, SdpType, SessionDescription};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSender, PeerState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "homestay-call";

type SampleTracks = Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>;

/// Creates peer connections with the default codecs and interceptors.
pub struct RtcPeerFactory {
    ice_servers: Vec<String>,
    sample_tracks: SampleTracks,
}

impl RtcPeerFactory {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            sample_tracks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Outbound RTP track bound to a local media track, for the capture
    /// pipeline to write samples into.
    pub fn sample_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.sample_tracks.lock().get(track_id).cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let connection = Arc::new(api.new_peer_connection(config).await?);

        let tx = events.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => log::warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    log::info!("Remote {} track {} arrived", kind, track.id());
                    let _ = tx.send(PeerEvent::RemoteTrack(Arc::new(MediaTrack::with_id(
                        track.id(),
                        kind,
                    ))));
                })
            },
        ));

        let tx = events;
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    log::debug!("Peer connection state: {}", state);
                    let _ = tx.send(PeerEvent::StateChanged(map_state(state)));
                })
            },
        ));

        Ok(Arc::new(RtcPeer {
            connection,
            sample_tracks: self.sample_tracks.clone(),
            track_ids: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

struct RtcPeer {
    connection: Arc<RTCPeerConnection>,
    sample_tracks: SampleTracks,
    track_ids: Mutex<Vec<String>>,
    closed: AtomicBool,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(rtc)
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<()> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));

        let local: Arc<dyn TrackLocal + Send + Sync> = sample.clone();
        self.connection.add_track(local).await?;
        self.sample_tracks
            .lock()
            .insert(track.id().to_string(), sample);
        self.track_ids.lock().push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.connection
            .set_local_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.connection
            .set_remote_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.is_empty() {
            return Err(Error::Peer("empty ICE candidate".into()));
        }
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut sample_tracks = self.sample_tracks.lock();
            for id in self.track_ids.lock().drain(..) {
                sample_tracks.remove(&id);
            }
        }
        self.connection.close().await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.connection.connection_state() == RTCPeerConnectionState::Closed
    }
}
