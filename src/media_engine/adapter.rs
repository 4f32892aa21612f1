//! Schnittstelle zur Media Engine

use super::MediaError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Art eines empfangenen Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Callbacks der Media Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Lokal gefundener ICE Candidate (JSON)
    LocalCandidate(String),
    /// Medienpfad steht
    Connected,
    /// Verbindung unterbrochen, kann sich erholen
    Disconnected,
    /// Verbindung endgültig gescheitert
    Failed(String),
    /// Gegenseite liefert einen Track; die UI bindet ihn an eine Anzeige
    RemoteTrack { kind: TrackKind },
}

/// Öffnet Media Sessions
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Eine Session pro Anruf; Events gehen an `events`
    async fn open_session(
        &self,
        is_video: bool,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaSession>, MediaError>;
}

/// Eine Peer-Verbindung mit lokalen Tracks
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Erzeugt das Offer und setzt es als lokale Beschreibung
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Übernimmt das Offer der Gegenseite und erzeugt die Antwort
    async fn create_answer(&self, remote_offer: &str) -> Result<String, MediaError>;

    /// Übernimmt die Antwort der Gegenseite (nur Anrufer)
    async fn set_remote_description(&self, answer: &str) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError>;

    async fn set_audio_enabled(&self, enabled: bool) -> Result<(), MediaError>;

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaError>;

    fn set_speaker_enabled(&self, enabled: bool);

    async fn switch_camera(&self) -> Result<(), MediaError>;

    /// Schließt die Verbindung; mehrfacher Aufruf ist erlaubt
    async fn close(&self);
}
