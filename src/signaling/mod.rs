//! Signaling Module - CallRecord-Austausch über einen Document Store
//!
//! Dieses Modul verwaltet den asynchronen Signaling-Kanal:
//! - Datensatz anlegen, mergen, Candidates anhängen
//! - Änderungen als volle Snapshots abonnieren
//! - Glare-Auflösung über einen Slot pro Teilnehmerpaar
//!

mod channel;
mod client;
mod messages;
pub mod record;
pub mod store;

pub use channel::{ChannelEvent, ClaimOutcome, SignalingChannel, Subscription};
pub use client::RemoteDocumentStore;
pub use messages::*;
pub use record::{CallRecord, CallStatus, CandidateSide, RecordError, RecordPatch};
pub use store::{DocumentStore, MemoryDocumentStore, PairClaim};

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Call record not found: {0}")]
    NotFound(String),

    #[error("Call record already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid record transition: {0}")]
    InvalidTransition(String),

    #[error("Call slot taken by call {by}")]
    Preempted { by: String },

    #[error("Signaling connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to document store")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Signaling request timed out")]
    Timeout,
}

impl From<RecordError> for SignalingError {
    fn from(err: RecordError) -> Self {
        SignalingError::InvalidTransition(err.to_string())
    }
}
