//! Message Types für das Document-Store-Protokoll
//!
//! JSON über WebSocket. Jede Anfrage trägt eine `requestId`, die der
//! Server in seiner Antwort zurückgibt. Snapshots beobachteter Dokumente
//! schickt der Server unaufgefordert.

use super::record::{CallRecord, CandidateSide, RecordPatch};
use super::store::PairClaim;
use super::SignalingError;
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Anfrage mit Korrelations-ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: u64,
    #[serde(flatten)]
    pub request: StoreRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreRequest {
    Create {
        record: CallRecord,
    },

    Merge {
        #[serde(rename = "callId")]
        call_id: String,
        patch: RecordPatch,
    },

    AppendCandidate {
        #[serde(rename = "callId")]
        call_id: String,
        side: CandidateSide,
        candidate: String,
    },

    Get {
        #[serde(rename = "callId")]
        call_id: String,
    },

    Delete {
        #[serde(rename = "callId")]
        call_id: String,
    },

    Watch {
        #[serde(rename = "callId")]
        call_id: String,
    },

    Unwatch {
        #[serde(rename = "callId")]
        call_id: String,
    },

    ClaimPair {
        claim: PairClaim,
    },

    SwapPair {
        #[serde(rename = "expectedCallId")]
        expected_call_id: String,
        claim: PairClaim,
    },

    ReleasePair {
        #[serde(rename = "pairKey")]
        pair_key: String,
        #[serde(rename = "callId")]
        call_id: String,
    },

    Heartbeat,
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreMessage {
    /// Anfrage ohne Rückgabewert erfolgreich
    Ack {
        #[serde(rename = "requestId")]
        request_id: u64,
    },

    /// Antwort auf `get` und `merge`
    Record {
        #[serde(rename = "requestId")]
        request_id: u64,
        record: Option<CallRecord>,
    },

    /// Antwort auf `claim_pair`; `holder` fehlt wenn der Slot vergeben wurde
    Claim {
        #[serde(rename = "requestId")]
        request_id: u64,
        holder: Option<PairClaim>,
    },

    Swapped {
        #[serde(rename = "requestId")]
        request_id: u64,
        swapped: bool,
    },

    /// Vom Server gepushter Stand eines beobachteten Dokuments
    Snapshot {
        #[serde(rename = "callId")]
        call_id: String,
        record: CallRecord,
    },

    Rejected {
        #[serde(rename = "requestId")]
        request_id: u64,
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by: Option<String>,
    },

    /// Server kann ein Dokument nicht mehr beobachten
    WatchError {
        #[serde(rename = "callId")]
        call_id: String,
        message: String,
    },

    Pong,
}

impl StoreMessage {
    /// Korrelations-ID, `None` für Push-Nachrichten
    pub fn request_id(&self) -> Option<u64> {
        match self {
            StoreMessage::Ack { request_id }
            | StoreMessage::Record { request_id, .. }
            | StoreMessage::Claim { request_id, .. }
            | StoreMessage::Swapped { request_id, .. }
            | StoreMessage::Rejected { request_id, .. } => Some(*request_id),
            StoreMessage::Snapshot { .. } | StoreMessage::WatchError { .. } | StoreMessage::Pong => {
                None
            }
        }
    }

    /// Baut die Fehlerantwort für eine abgelehnte Anfrage
    pub fn rejected(request_id: u64, err: &SignalingError) -> Self {
        let (code, message, by) = match err {
            SignalingError::NotFound(id) => (ErrorCode::NotFound, id.clone(), None),
            SignalingError::AlreadyExists(id) => (ErrorCode::AlreadyExists, id.clone(), None),
            SignalingError::InvalidTransition(reason) => {
                (ErrorCode::InvalidTransition, reason.clone(), None)
            }
            SignalingError::Preempted { by } => {
                (ErrorCode::Preempted, err.to_string(), Some(by.clone()))
            }
            other => (ErrorCode::Internal, other.to_string(), None),
        };
        StoreMessage::Rejected {
            request_id,
            code,
            message,
            by,
        }
    }
}

// ============================================================================
// HELPER TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    InvalidTransition,
    Preempted,
    Internal,
}

impl ErrorCode {
    /// Rückübersetzung in den lokalen Fehlertyp
    pub fn into_error(self, message: String, by: Option<String>) -> SignalingError {
        match self {
            ErrorCode::NotFound => SignalingError::NotFound(message),
            ErrorCode::AlreadyExists => SignalingError::AlreadyExists(message),
            ErrorCode::InvalidTransition => SignalingError::InvalidTransition(message),
            ErrorCode::Preempted => SignalingError::Preempted {
                by: by.unwrap_or_default(),
            },
            ErrorCode::Internal => SignalingError::ConnectionFailed(message),
        }
    }
}
