//! Lokaler Anrufzustand und Snapshot für Beobachter

use super::error::CallError;
use crate::media_engine::TrackKind;
use crate::signaling::{CallRecord, CallStatus, CandidateSide};
use serde::Serialize;

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Kein aktiver Anruf
    #[default]
    Idle,
    /// Ausgehender Anruf wird aufgebaut
    Calling,
    /// Eingehender Anruf wartet auf Antwort
    Ringing,
    /// Verbindung wird hergestellt
    Connecting,
    /// Anruf aktiv
    Connected,
    /// Anruf beendet
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        }
    }

    /// Weder `Idle` noch `Ended`
    pub fn is_active(&self) -> bool {
        !matches!(self, CallState::Idle | CallState::Ended)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolle der lokalen Seite im Anruf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Recipient,
}

impl CallRole {
    pub fn local_side(&self) -> CandidateSide {
        match self {
            CallRole::Caller => CandidateSide::Caller,
            CallRole::Recipient => CandidateSide::Recipient,
        }
    }

    pub fn remote_side(&self) -> CandidateSide {
        self.local_side().opposite()
    }
}

/// Schalter während eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MediaControls {
    pub audio_muted: bool,
    pub video_enabled: bool,
    pub speaker_on: bool,
}

impl MediaControls {
    /// Lautsprecher standardmäßig an bei Videoanrufen
    pub fn for_call(is_video: bool) -> Self {
        Self {
            audio_muted: false,
            video_enabled: is_video,
            speaker_on: is_video,
        }
    }
}

/// Was Beobachter über den Anruf sehen
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub role: Option<CallRole>,
    pub call_id: Option<String>,
    pub record: Option<CallRecord>,
    /// Endstatus, sobald `state == Ended`
    pub outcome: Option<CallStatus>,
    #[serde(skip)]
    pub error: Option<CallError>,
    pub controls: MediaControls,
    /// Empfangene Tracks der Gegenseite, in Ankunftsreihenfolge
    pub remote_tracks: Vec<TrackKind>,
}

impl CallSnapshot {
    pub fn is_video(&self) -> bool {
        self.record.as_ref().map(|r| r.is_video).unwrap_or(false)
    }

    /// Ein Video-Track der Gegenseite ist da und kann angezeigt werden
    pub fn has_remote_video(&self) -> bool {
        self.remote_tracks.contains(&TrackKind::Video)
    }
}
