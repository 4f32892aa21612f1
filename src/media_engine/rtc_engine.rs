//! WebRTC Media Engine
//!
//! Verwaltet WebRTC Peer Connections über webrtc-rs. Lokale Tracks sind
//! RTP-Tracks (Opus, VP8); die Gerätequelle, die sie füttert, liegt
//! außerhalb dieser Crate.

use super::adapter::{MediaEngine, MediaEvent, MediaSession, TrackKind};
use super::MediaError;
use crate::config::IceServerConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "call-signaling";

fn webrtc_err(e: webrtc::Error) -> MediaError {
    MediaError::WebRTC(e.to_string())
}

// ============================================================================
// WEBRTC ENGINE
// ============================================================================

/// `MediaEngine` auf Basis von webrtc-rs
pub struct WebRtcEngine {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngine {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        Self { ice_servers }
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codecs).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(webrtc_err)?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn open_session(
        &self,
        is_video: bool,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let pc = self.create_peer_connection().await?;
        setup_peer_connection_handlers(&pc, events);
        tracing::info!("Opened media session (video: {})", is_video);

        Ok(Arc::new(WebRtcSession {
            pc,
            is_video,
            tracks: Mutex::new(None),
            flags: Mutex::new(SessionFlags {
                audio_enabled: true,
                video_enabled: is_video,
                speaker_on: is_video,
                front_camera: true,
                closed: false,
            }),
        }))
    }
}

impl std::fmt::Debug for WebRtcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcEngine")
            .field("ice_servers", &self.ice_servers.len())
            .finish()
    }
}

/// Registriert Event Handler für die Peer Connection
fn setup_peer_connection_handlers(
    pc: &Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<MediaEvent>,
) {
    // Connection State Handler
    let events_clone = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let event = match s {
            RTCPeerConnectionState::Connected => Some(MediaEvent::Connected),
            RTCPeerConnectionState::Disconnected => Some(MediaEvent::Disconnected),
            RTCPeerConnectionState::Failed => {
                Some(MediaEvent::Failed("peer connection failed".to_string()))
            }
            _ => None,
        };
        if let Some(event) = event {
            let _ = events_clone.send(event);
        }

        Box::pin(async {})
    }));

    // ICE Candidate Handler
    let events_clone = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json().map(|json| serde_json::to_string(&json)) {
                Ok(Ok(candidate_str)) => {
                    let _ = events_clone.send(MediaEvent::LocalCandidate(candidate_str));
                }
                Ok(Err(e)) => tracing::warn!("Failed to encode ICE candidate: {}", e),
                Err(e) => tracing::warn!("Failed to read ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler (Anzeige übernimmt die UI)
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        tracing::info!("Received track: {:?}", track.codec());
        let _ = events.send(MediaEvent::RemoteTrack { kind });
        Box::pin(async {})
    }));
}

// ============================================================================
// WEBRTC SESSION
// ============================================================================

struct LocalTrack {
    track: Arc<TrackLocalStaticRTP>,
    sender: Arc<RTCRtpSender>,
}

struct LocalTracks {
    audio: LocalTrack,
    video: Option<LocalTrack>,
}

#[derive(Debug, Clone, Copy)]
struct SessionFlags {
    audio_enabled: bool,
    video_enabled: bool,
    speaker_on: bool,
    front_camera: bool,
    closed: bool,
}

/// Eine Peer Connection eines Anrufs
pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    is_video: bool,
    tracks: Mutex<Option<LocalTracks>>,
    flags: Mutex<SessionFlags>,
}

impl WebRtcSession {
    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.flags.lock().closed {
            return Err(MediaError::SessionClosed);
        }
        Ok(())
    }

    async fn add_local_track(
        &self,
        mime_type: &str,
        clock_rate: u32,
        channels: u16,
        id: &str,
    ) -> Result<LocalTrack, MediaError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                clock_rate,
                channels,
                ..Default::default()
            },
            id.to_string(),
            STREAM_ID.to_string(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;

        Ok(LocalTrack { track, sender })
    }

    /// Fügt Audio (und ggf. Video) hinzu, genau einmal pro Session
    async fn attach_tracks(&self) -> Result<(), MediaError> {
        if self.tracks.lock().is_some() {
            return Ok(());
        }

        let audio = self.add_local_track(MIME_TYPE_OPUS, 48000, 2, "audio").await?;
        let video = if self.is_video {
            Some(self.add_local_track(MIME_TYPE_VP8, 90000, 0, "video").await?)
        } else {
            None
        };

        // Vorher gesetzte Toggles anwenden
        let flags = *self.flags.lock();
        if !flags.audio_enabled {
            audio.sender.replace_track(None).await.map_err(webrtc_err)?;
        }
        if let Some(video) = &video {
            if !flags.video_enabled {
                video.sender.replace_track(None).await.map_err(webrtc_err)?;
            }
        }

        *self.tracks.lock() = Some(LocalTracks { audio, video });
        Ok(())
    }

    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), MediaError> {
        let local = {
            let tracks = self.tracks.lock();
            let local = tracks.as_ref().and_then(|t| match kind {
                TrackKind::Audio => Some(&t.audio),
                TrackKind::Video => t.video.as_ref(),
            });
            local.map(|l| (Arc::clone(&l.sender), Arc::clone(&l.track)))
        };

        if let Some((sender, track)) = local {
            let replacement =
                enabled.then(|| track as Arc<dyn TrackLocal + Send + Sync>);
            sender.replace_track(replacement).await.map_err(webrtc_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn create_offer(&self) -> Result<String, MediaError> {
        self.ensure_open()?;
        self.attach_tracks().await?;

        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self, remote_offer: &str) -> Result<String, MediaError> {
        self.ensure_open()?;

        // Remote Description setzen (das Offer)
        let offer = RTCSessionDescription::offer(remote_offer.to_string())
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;

        self.attach_tracks().await?;

        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, answer: &str) -> Result<(), MediaError> {
        self.ensure_open()?;
        let answer = RTCSessionDescription::answer(answer.to_string())
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError> {
        self.ensure_open()?;
        let candidate: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| MediaError::InvalidCandidate(e.to_string()))?;
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(webrtc_err)
    }

    async fn set_audio_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.flags.lock().audio_enabled = enabled;
        self.set_track_enabled(TrackKind::Audio, enabled).await?;
        tracing::debug!("Audio {}", if enabled { "enabled" } else { "muted" });
        Ok(())
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.ensure_open()?;
        if !self.is_video {
            return Err(MediaError::Unsupported("video toggle on an audio call"));
        }
        self.flags.lock().video_enabled = enabled;
        self.set_track_enabled(TrackKind::Video, enabled).await?;
        tracing::debug!("Video {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    fn set_speaker_enabled(&self, enabled: bool) {
        // Audio-Routing übernimmt die Plattform
        self.flags.lock().speaker_on = enabled;
        tracing::debug!("Speaker {}", if enabled { "on" } else { "off" });
    }

    async fn switch_camera(&self) -> Result<(), MediaError> {
        self.ensure_open()?;
        if !self.is_video {
            return Err(MediaError::Unsupported("camera switch on an audio call"));
        }
        let mut flags = self.flags.lock();
        flags.front_camera = !flags.front_camera;
        tracing::debug!(
            "Switched to {} camera",
            if flags.front_camera { "front" } else { "back" }
        );
        Ok(())
    }

    async fn close(&self) {
        {
            let mut flags = self.flags.lock();
            if flags.closed {
                return;
            }
            flags.closed = true;
        }
        self.tracks.lock().take();
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
        tracing::info!("Media session closed");
    }
}

impl std::fmt::Debug for WebRtcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcSession")
            .field("is_video", &self.is_video)
            .field("flags", &*self.flags.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> WebRtcEngine {
        WebRtcEngine::new(&[])
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let caller = engine().open_session(true, tx_a).await.unwrap();
        let callee = engine().open_session(true, tx_b).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("m=video"));

        let answer = callee.create_answer(&offer).await.unwrap();
        assert!(answer.contains("m=audio"));
        caller.set_remote_description(&answer).await.unwrap();

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn test_audio_only_session() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = engine().open_session(false, tx).await.unwrap();

        session.set_audio_enabled(false).await.unwrap();
        let offer = session.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));
        assert!(!offer.contains("m=video"));

        assert_eq!(
            session.switch_camera().await.unwrap_err(),
            MediaError::Unsupported("camera switch on an audio call")
        );
        session.close().await;
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = engine().open_session(false, tx).await.unwrap();

        assert!(matches!(
            session.add_ice_candidate("not json").await,
            Err(MediaError::InvalidCandidate(_))
        ));
        assert!(matches!(
            session.create_answer("garbage").await,
            Err(MediaError::InvalidSdp(_))
        ));

        session.close().await;
        session.close().await;
        assert_eq!(
            session.create_offer().await.unwrap_err(),
            MediaError::SessionClosed
        );
    }
}
