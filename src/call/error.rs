//! Fehlertypen des Anruf-Managers

use super::state::CallState;
use crate::history::HistoryError;
use crate::media_engine::MediaError;
use crate::signaling::SignalingError;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Signaling channel error: {0}")]
    Channel(String),

    #[error("Media engine error: {0}")]
    MediaEngine(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Call already exists: {0}")]
    AlreadyExists(String),

    #[error("Call timed out")]
    Timeout,

    #[error("Call not found: {0}")]
    NotFound(String),

    #[error("Call history error: {0}")]
    History(String),

    #[error("Call manager is shut down")]
    ManagerClosed,
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::AlreadyExists(id) => CallError::AlreadyExists(id),
            SignalingError::NotFound(id) => CallError::NotFound(id),
            SignalingError::InvalidTransition(reason) => CallError::InvalidTransition(reason),
            SignalingError::Timeout => CallError::Timeout,
            other => CallError::Channel(other.to_string()),
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        CallError::MediaEngine(err.to_string())
    }
}

impl From<HistoryError> for CallError {
    fn from(err: HistoryError) -> Self {
        CallError::History(err.to_string())
    }
}
