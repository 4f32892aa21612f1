//! Media Engine Module - WebRTC Sessions
//!
//! Dieses Modul kapselt die Media Engine hinter zwei Traits:
//! - `MediaEngine` öffnet eine Session pro Anruf
//! - `MediaSession` erzeugt Offer/Answer, nimmt Candidates an und
//!   schaltet Audio, Video, Lautsprecher und Kamera
//!
//! Verbindungs-Callbacks der Engine kommen als `MediaEvent` über einen
//! Kanal, nie als direkter Aufruf in den Anrufzustand.

mod adapter;
#[cfg(test)]
pub(crate) mod fake;
mod rtc_engine;

pub use adapter::{MediaEngine, MediaEvent, MediaSession, TrackKind};
pub use rtc_engine::{WebRtcEngine, WebRtcSession};

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Media session is closed")]
    SessionClosed,

    #[error("Not supported: {0}")]
    Unsupported(&'static str),
}
