//! Default negotiation engine backed by the `webrtc` crate.
//!
//! This is the only module that touches `webrtc` types; everything
//! above it speaks [`NegotiationEngine`] and [`EngineEvent`]. Local
//! tracks are Opus/VP8 sample tracks created by [`WebRtcMediaDevices`];
//! embedders feed captured frames into them through
//! [`LocalRtpTrack::sample_writer`].

use super::{
    ConnectionState, EngineEvent, EngineFactory, IceCandidate, NegotiationEngine,
    NegotiationError, SdpKind, SessionDescription,
};
use crate::media::{MediaDevices, MediaError, MediaTrack, MediaTrackSet, TrackKind};
use async_trait::async_trait;
use log::{debug, warn};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

fn engine_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Engine(e.to_string())
}

/// Local outgoing track backed by a WebRTC sample track.
///
/// `set_enabled(false)` gates the track without detaching it from the
/// peer connection; the embedder checks [`is_enabled`](MediaTrack::is_enabled)
/// (or simply keeps writing, with the flag consulted by its capture
/// loop) so mute never triggers renegotiation.
pub struct LocalRtpTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    inner: Arc<TrackLocalStaticSample>,
}

impl LocalRtpTrack {
    pub fn audio(id: impl Into<String>) -> Self {
        let id = id.into();
        let inner = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            id.clone(),
            "callbridge".to_owned(),
        ));
        Self {
            id,
            kind: TrackKind::Audio,
            enabled: AtomicBool::new(true),
            inner,
        }
    }

    pub fn video(id: impl Into<String>) -> Self {
        let id = id.into();
        let inner = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            id.clone(),
            "callbridge".to_owned(),
        ));
        Self {
            id,
            kind: TrackKind::Video,
            enabled: AtomicBool::new(true),
            inner,
        }
    }

    /// Sample sink the embedder's capture loop writes into.
    pub fn sample_writer(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.clone()
    }

    fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.clone()
    }
}

impl MediaTrack for LocalRtpTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Remote track handle surfaced by `on_track`.
pub struct RemoteRtpTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    inner: Arc<TrackRemote>,
}

impl RemoteRtpTrack {
    fn new(inner: Arc<TrackRemote>) -> Self {
        let kind = match inner.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        Self {
            id: inner.id(),
            kind,
            enabled: AtomicBool::new(true),
            inner,
        }
    }

    /// RTP source the embedder's playback loop reads from.
    pub fn rtp_reader(&self) -> Arc<TrackRemote> {
        self.inner.clone()
    }
}

impl MediaTrack for RemoteRtpTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        // Remote tracks stop when the peer connection closes; this
        // only gates local playback.
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// [`MediaDevices`] producing WebRTC sample tracks.
///
/// Opening never touches hardware here: the embedder owns capture and
/// pumps samples into [`LocalRtpTrack::sample_writer`]. Platforms with
/// real device enumeration implement [`MediaDevices`] themselves.
#[derive(Default)]
pub struct WebRtcMediaDevices;

#[async_trait]
impl MediaDevices for WebRtcMediaDevices {
    async fn open(&self, with_video: bool) -> Result<MediaTrackSet, MediaError> {
        let mut tracks: Vec<Arc<dyn MediaTrack>> = vec![Arc::new(LocalRtpTrack::audio("audio0"))];
        if with_video {
            tracks.push(Arc::new(LocalRtpTrack::video("video0")));
        }
        Ok(MediaTrackSet::new(tracks))
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
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

/// Peer connection engine for one call session.
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcEngine {
    pub async fn new(
        ice_servers: &[String],
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_err)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(engine_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(engine_err)?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    // End of gathering.
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(EngineEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }))
                            .await;
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {e}"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Peer connection state changed: {state}");
            let mapped = map_connection_state(state);
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(state) = mapped {
                    let _ = tx.send(EngineEvent::ConnectionState(state)).await;
                }
            })
        }));

        let tx = events;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let tx = tx.clone();
            Box::pin(async move {
                let handle: Arc<dyn MediaTrack> = Arc::new(RemoteRtpTrack::new(track));
                let _ = tx
                    .send(EngineEvent::RemoteTracks(MediaTrackSet::new(vec![handle])))
                    .await;
            })
        }));

        Ok(Self { pc })
    }

    fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
        match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(engine_err),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(engine_err),
        }
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_err)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(engine_err)?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp,
        })
    }

    async fn create_answer(
        &self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let remote = Self::to_rtc_description(remote_offer)?;
        self.pc.set_remote_description(remote).await.map_err(engine_err)?;

        let answer = self.pc.create_answer(None).await.map_err(engine_err)?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(engine_err)?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        })
    }

    async fn apply_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let remote = Self::to_rtc_description(desc)?;
        self.pc.set_remote_description(remote).await.map_err(engine_err)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(engine_err)
    }

    async fn attach_local(&self, tracks: &MediaTrackSet) -> Result<(), NegotiationError> {
        for track in tracks.tracks() {
            let Some(local) = track.as_any().downcast_ref::<LocalRtpTrack>() else {
                warn!("Skipping non-RTP local track {}", track.id());
                continue;
            };
            self.pc.add_track(local.rtp_track()).await.map_err(engine_err)?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Peer connection close: {e}");
        }
    }
}

/// Factory producing one [`WebRtcEngine`] per call session.
pub struct WebRtcEngineFactory {
    ice_servers: Vec<String>,
}

impl WebRtcEngineFactory {
    pub fn new(ice_servers: Vec<String>) -> Arc<Self> {
        Arc::new(Self { ice_servers })
    }
}

impl Default for WebRtcEngineFactory {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_owned()],
        }
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError> {
        let engine = WebRtcEngine::new(&self.ice_servers, events).await?;
        Ok(Arc::new(engine))
    }
}
