//! CallRecord - Signaling-Datensatz eines Anrufversuchs
//!
//! Der Datensatz wird vom Anrufer angelegt und von beiden Seiten über den
//! Document Store fortgeschrieben:
//! - Offer (Anrufer) und Answer (Angerufener) sind nur einmal schreibbar
//! - ICE Candidates werden je Seite angehängt, nie verändert
//! - Der Status läuft nur vorwärts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("{field} is already set and cannot be changed")]
    AlreadySet { field: &'static str },

    #[error("status cannot move from {from} to {to}")]
    StatusRegression { from: CallStatus, to: CallStatus },

    #[error("record is not terminal (status {0})")]
    NotTerminal(CallStatus),
}

// ============================================================================
// CALL STATUS
// ============================================================================

/// Signaling-sichtbarer Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CallStatus {
    Ringing,
    Answered,
    InProgress,
    Completed,
    Missed,
    Declined,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Missed => "missed",
            CallStatus::Declined => "declined",
            CallStatus::Error => "error",
        }
    }

    /// Total: unbekannte oder veraltete Werte werden zu `Error`
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "ringing" => CallStatus::Ringing,
            "answered" => CallStatus::Answered,
            "in_progress" => CallStatus::InProgress,
            "completed" => CallStatus::Completed,
            "missed" => CallStatus::Missed,
            "declined" => CallStatus::Declined,
            _ => CallStatus::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Missed | CallStatus::Declined | CallStatus::Error
        )
    }

    /// Rang in der Halbordnung
    /// `Ringing < {Answered, Declined} < {InProgress, Missed} < {Completed, Error}`
    fn rank(&self) -> u8 {
        match self {
            CallStatus::Ringing => 0,
            CallStatus::Answered | CallStatus::Declined => 1,
            CallStatus::InProgress | CallStatus::Missed => 2,
            CallStatus::Completed | CallStatus::Error => 3,
        }
    }

    /// Prüft ob `next` ein erlaubter (oder identischer) Folgestatus ist
    pub fn can_advance_to(&self, next: CallStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for CallStatus {
    fn from(value: String) -> Self {
        CallStatus::parse(&value)
    }
}

impl From<CallStatus> for String {
    fn from(value: CallStatus) -> Self {
        value.as_str().to_string()
    }
}

// ============================================================================
// CANDIDATE SIDE
// ============================================================================

/// Welche Candidate-Liste im Datensatz gemeint ist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSide {
    Caller,
    Recipient,
}

impl CandidateSide {
    pub fn opposite(&self) -> Self {
        match self {
            CandidateSide::Caller => CandidateSide::Recipient,
            CandidateSide::Recipient => CandidateSide::Caller,
        }
    }
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Signaling-Datensatz, genau einer pro `call_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    pub chat_room_id: String,
    pub caller_id: String,
    pub recipient_id: String,
    pub is_video: bool,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default)]
    pub caller_candidates: Vec<String>,
    #[serde(default)]
    pub recipient_candidates: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Gesprächsdauer in Millisekunden, abgeleitet aus `end_time - answer_time`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl CallRecord {
    /// Neuer Datensatz im Status `Ringing`
    pub fn new(
        call_id: String,
        chat_room_id: String,
        caller_id: String,
        recipient_id: String,
        is_video: bool,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id,
            chat_room_id,
            caller_id,
            recipient_id,
            is_video,
            status: CallStatus::Ringing,
            offer: None,
            answer: None,
            caller_candidates: Vec::new(),
            recipient_candidates: Vec::new(),
            start_time,
            answer_time: None,
            end_time: None,
            duration: None,
        }
    }

    pub fn with_offer(mut self, offer: String) -> Self {
        self.offer = Some(offer);
        self
    }

    /// Seite eines Teilnehmers, `None` wenn der Benutzer nicht beteiligt ist
    pub fn side_of(&self, user_id: &str) -> Option<CandidateSide> {
        if self.caller_id == user_id {
            Some(CandidateSide::Caller)
        } else if self.recipient_id == user_id {
            Some(CandidateSide::Recipient)
        } else {
            None
        }
    }

    pub fn candidates(&self, side: CandidateSide) -> &[String] {
        match side {
            CandidateSide::Caller => &self.caller_candidates,
            CandidateSide::Recipient => &self.recipient_candidates,
        }
    }

    pub fn push_candidate(&mut self, side: CandidateSide, candidate: String) {
        match side {
            CandidateSide::Caller => self.caller_candidates.push(candidate),
            CandidateSide::Recipient => self.recipient_candidates.push(candidate),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Übernimmt die gesetzten Felder eines Patches.
    ///
    /// Gibt zurück ob sich der Datensatz geändert hat. Bei einem Fehler
    /// bleibt der Datensatz unverändert.
    pub fn apply_patch(&mut self, patch: &RecordPatch) -> Result<bool, RecordError> {
        if let (Some(current), Some(new)) = (&self.offer, &patch.offer) {
            if current != new {
                return Err(RecordError::AlreadySet { field: "offer" });
            }
        }
        if let (Some(current), Some(new)) = (&self.answer, &patch.answer) {
            if current != new {
                return Err(RecordError::AlreadySet { field: "answer" });
            }
        }
        if let Some(next) = patch.status {
            if !self.status.can_advance_to(next) {
                return Err(RecordError::StatusRegression {
                    from: self.status,
                    to: next,
                });
            }
        }

        let before = self.clone();

        if self.offer.is_none() {
            self.offer = patch.offer.clone();
        }
        if self.answer.is_none() {
            self.answer = patch.answer.clone();
        }
        if let Some(next) = patch.status {
            self.status = next;
        }
        // Zeitstempel: der erste Schreiber gewinnt
        if self.answer_time.is_none() {
            self.answer_time = patch.answer_time;
        }
        if self.end_time.is_none() {
            self.end_time = patch.end_time;
        }
        if let Some(end) = self.end_time {
            let millis = self
                .answer_time
                .map(|answer| (end - answer).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            self.duration = Some(millis);
        }

        Ok(*self != before)
    }
}

// ============================================================================
// RECORD PATCH
// ============================================================================

/// Partielles Update für `update_call`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl RecordPatch {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn answer(answer: String) -> Self {
        Self {
            answer: Some(answer),
            status: Some(CallStatus::Answered),
            ..Default::default()
        }
    }

    pub fn with_answer_time(mut self, at: DateTime<Utc>) -> Self {
        self.answer_time = Some(at);
        self
    }

    pub fn with_end_time(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ============================================================================
// TESTS
// ============================================================================
