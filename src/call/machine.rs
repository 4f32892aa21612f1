//! Call State Machine
//!
//! Reine Übergangslogik ohne I/O. Eingaben:
//! - `Command`: lokale Aktionen (anrufen, annehmen, ablehnen, auflegen)
//! - `CallInput`: Ergebnisse ausgeführter Effekte, Snapshots des
//!   Datensatzes, Callbacks der Media Engine und abgelaufene Timer
//!
//! Ausgabe ist jeweils eine Liste von `Effect`s, die der `CallManager`
//! in Reihenfolge ausführt.

use super::candidates::CandidateBuffer;
use super::error::CallError;
use super::state::{CallRole, CallSnapshot, CallState, MediaControls};
use crate::config::{CallConfig, TieBreak};
use crate::media_engine::TrackKind;
use crate::signaling::{CallRecord, CallStatus, CandidateSide, RecordPatch};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

// ============================================================================
// POLICY
// ============================================================================

/// Timer und Glare-Regel eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub ringing_timeout: Duration,
    pub connect_timeout: Duration,
    pub glare_window: Duration,
    pub disconnect_grace: Duration,
    pub max_call_duration: Duration,
    pub tie_break: TieBreak,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        CallConfig::default().session_policy()
    }
}

// ============================================================================
// INPUTS & EFFECTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Place {
        call_id: String,
        chat_room_id: String,
        peer_id: String,
        is_video: bool,
    },
    Incoming {
        call_id: String,
    },
    Answer {
        call_id: String,
    },
    Decline {
        call_id: String,
    },
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    Ringing,
    GlareCommit,
    Connect,
    DisconnectGrace,
    MaxDuration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallInput {
    SessionGranted,
    SessionYielded { call_id: String },
    OfferCreated(String),
    AnswerCreated(String),
    RemoteDescriptionApplied,
    RecordCreated(CallRecord),
    RecordPreempted { by: String },
    Snapshot(CallRecord),
    LocalCandidate(String),
    MediaConnected,
    MediaDisconnected,
    MediaFailed(String),
    /// Gegenseite liefert einen Track
    RemoteTrack(TrackKind),
    ChannelFailed(String),
    /// Ein Effekt ist fehlgeschlagen
    EffectFailed(CallError),
    TimerFired { timer: Timer, seq: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ClaimSession { peer_id: String, call_id: String },
    ReleaseSession { peer_id: String, call_id: String },
    OpenMedia { is_video: bool },
    CreateOffer,
    CreateAnswer { offer: String },
    ApplyRemoteAnswer { answer: String },
    AddRemoteCandidates(Vec<String>),
    CreateRecord(CallRecord),
    UpdateRecord { call_id: String, patch: RecordPatch },
    PublishCandidates {
        call_id: String,
        side: CandidateSide,
        candidates: Vec<String>,
    },
    Subscribe { call_id: String },
    Unsubscribe,
    StartTimer { timer: Timer, after: Duration, seq: u64 },
    AlertIncoming(CallRecord),
    StopAlert,
    ReleaseMedia,
}

// ============================================================================
// STATE MACHINE
// ============================================================================

/// Zustand genau eines Anrufs; ein neuer Anruf bekommt eine neue Instanz
#[derive(Debug)]
pub struct CallStateMachine {
    local_id: String,
    policy: SessionPolicy,
    state: CallState,
    role: Option<CallRole>,
    call_id: Option<String>,
    peer_id: Option<String>,
    chat_room_id: Option<String>,
    is_video: bool,
    /// Zuletzt gesehener Stand im Store
    record: Option<CallRecord>,
    /// Datensatz, der auf das Glare-Fenster wartet
    pending_record: Option<CallRecord>,
    outcome: Option<CallStatus>,
    error: Option<CallError>,
    controls: MediaControls,
    remote_tracks: Vec<TrackKind>,
    outbound: CandidateBuffer,
    inbound: CandidateBuffer,
    timers: HashMap<Timer, u64>,
    next_seq: u64,
    connected_at: Option<DateTime<Utc>>,
    media_open: bool,
    slot_claimed: bool,
    subscribed: bool,
}

impl CallStateMachine {
    pub fn new(local_id: impl Into<String>, policy: SessionPolicy) -> Self {
        Self {
            local_id: local_id.into(),
            policy,
            state: CallState::Idle,
            role: None,
            call_id: None,
            peer_id: None,
            chat_room_id: None,
            is_video: false,
            record: None,
            pending_record: None,
            outcome: None,
            error: None,
            controls: MediaControls::default(),
            remote_tracks: Vec::new(),
            outbound: CandidateBuffer::new(),
            inbound: CandidateBuffer::new(),
            timers: HashMap::new(),
            next_seq: 0,
            connected_at: None,
            media_open: false,
            slot_claimed: false,
            subscribed: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn role(&self) -> Option<CallRole> {
        self.role
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    pub fn record(&self) -> Option<&CallRecord> {
        self.record.as_ref()
    }

    pub fn outcome(&self) -> Option<CallStatus> {
        self.outcome
    }

    pub fn is_video(&self) -> bool {
        self.is_video
    }

    pub fn controls(&self) -> MediaControls {
        self.controls
    }

    /// Hat einen Anruf, der noch nicht beendet ist
    pub fn has_call(&self) -> bool {
        self.call_id.is_some() && self.state != CallState::Ended
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            role: self.role,
            call_id: self.call_id.clone(),
            record: self.record.clone(),
            outcome: self.outcome,
            error: self.error.clone(),
            controls: self.controls,
            remote_tracks: self.remote_tracks.clone(),
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    pub fn command(&mut self, command: Command, now: DateTime<Utc>) -> Result<Vec<Effect>, CallError> {
        match command {
            Command::Place {
                call_id,
                chat_room_id,
                peer_id,
                is_video,
            } => {
                if self.has_call() {
                    return Err(CallError::AlreadyInCall);
                }
                if peer_id == self.local_id {
                    return Err(CallError::InvalidTransition(
                        "cannot call yourself".to_string(),
                    ));
                }

                self.state = CallState::Calling;
                self.role = Some(CallRole::Caller);
                self.call_id = Some(call_id.clone());
                self.peer_id = Some(peer_id.clone());
                self.chat_room_id = Some(chat_room_id);
                self.is_video = is_video;
                self.controls = MediaControls::for_call(is_video);

                let ringing = self.arm(Timer::Ringing, self.policy.ringing_timeout);
                Ok(vec![Effect::ClaimSession { peer_id, call_id }, ringing])
            }

            Command::Incoming { call_id } => {
                if self.has_call() {
                    return Err(CallError::AlreadyInCall);
                }
                self.role = Some(CallRole::Recipient);
                self.call_id = Some(call_id.clone());
                self.subscribed = true;

                let ringing = self.arm(Timer::Ringing, self.policy.ringing_timeout);
                Ok(vec![Effect::Subscribe { call_id }, ringing])
            }

            Command::Answer { call_id } => {
                self.expect_ringing("answer", &call_id)?;
                let offer = self
                    .record
                    .as_ref()
                    .and_then(|r| r.offer.clone())
                    .ok_or_else(|| {
                        CallError::InvalidTransition(format!("call {} has no offer", call_id))
                    })?;

                self.state = CallState::Connecting;
                self.media_open = true;
                self.disarm(Timer::Ringing);
                let connect = self.arm(Timer::Connect, self.policy.connect_timeout);
                Ok(vec![
                    Effect::StopAlert,
                    Effect::OpenMedia {
                        is_video: self.is_video,
                    },
                    Effect::CreateAnswer { offer },
                    connect,
                ])
            }

            Command::Decline { call_id } => {
                self.expect_ringing("decline", &call_id)?;
                let mut effects = Vec::new();
                effects.extend(self.write_end(CallStatus::Declined, now));
                effects.extend(self.finish(CallStatus::Declined, None));
                Ok(effects)
            }

            Command::End => {
                if !self.state.is_active() {
                    return Err(CallError::InvalidState {
                        operation: "end call",
                        state: self.state,
                    });
                }
                let outcome = self.hangup_outcome();
                let mut effects = Vec::new();
                effects.extend(self.write_end(outcome, now));
                effects.extend(self.finish(outcome, None));
                Ok(effects)
            }
        }
    }

    // ========================================================================
    // TOGGLES
    // ========================================================================

    /// Gibt den neuen Mute-Status zurück
    pub fn toggle_audio(&mut self) -> Result<bool, CallError> {
        self.check_controls("toggle audio", false)?;
        self.controls.audio_muted = !self.controls.audio_muted;
        Ok(self.controls.audio_muted)
    }

    /// Gibt zurück ob Video jetzt an ist
    pub fn toggle_video(&mut self) -> Result<bool, CallError> {
        self.check_controls("toggle video", true)?;
        self.controls.video_enabled = !self.controls.video_enabled;
        Ok(self.controls.video_enabled)
    }

    /// Gibt zurück ob der Lautsprecher jetzt an ist
    pub fn toggle_speaker(&mut self) -> Result<bool, CallError> {
        self.check_controls("toggle speaker", false)?;
        self.controls.speaker_on = !self.controls.speaker_on;
        Ok(self.controls.speaker_on)
    }

    pub fn check_switch_camera(&self) -> Result<(), CallError> {
        self.check_controls("switch camera", true)
    }

    fn check_controls(&self, operation: &'static str, needs_video: bool) -> Result<(), CallError> {
        let legal = matches!(
            self.state,
            CallState::Calling | CallState::Connecting | CallState::Connected
        );
        if !legal || (needs_video && !self.is_video) {
            return Err(CallError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    // ========================================================================
    // INPUTS
    // ========================================================================

    pub fn handle(&mut self, input: CallInput, now: DateTime<Utc>) -> Vec<Effect> {
        if self.state == CallState::Ended {
            return self.absorb(input, now);
        }

        let is_caller = self.role == Some(CallRole::Caller);
        match input {
            CallInput::SessionGranted => {
                if self.state != CallState::Calling || !is_caller || self.slot_claimed {
                    return self.drop_input("session granted");
                }
                self.slot_claimed = true;
                self.media_open = true;
                vec![
                    Effect::OpenMedia {
                        is_video: self.is_video,
                    },
                    Effect::CreateOffer,
                ]
            }

            CallInput::SessionYielded { call_id } => {
                if self.state != CallState::Calling || !is_caller {
                    return self.drop_input("session yielded");
                }
                self.yield_to(call_id)
            }

            CallInput::OfferCreated(offer) => {
                if self.state != CallState::Calling
                    || !is_caller
                    || self.record.is_some()
                    || self.pending_record.is_some()
                {
                    return self.drop_input("offer created");
                }
                let (Some(call_id), Some(chat_room_id), Some(peer_id)) =
                    (&self.call_id, &self.chat_room_id, &self.peer_id)
                else {
                    return self.drop_input("offer created");
                };

                let record = CallRecord::new(
                    call_id.clone(),
                    chat_room_id.clone(),
                    self.local_id.clone(),
                    peer_id.clone(),
                    self.is_video,
                    now,
                )
                .with_offer(offer);

                if self.policy.tie_break.is_canonical(&self.local_id, peer_id) {
                    vec![Effect::CreateRecord(record)]
                } else {
                    // Gegenseite darf innerhalb des Fensters noch übernehmen
                    self.pending_record = Some(record);
                    vec![self.arm(Timer::GlareCommit, self.policy.glare_window)]
                }
            }

            CallInput::RecordCreated(record) => {
                if self.state != CallState::Calling
                    || !is_caller
                    || self.call_id.as_deref() != Some(record.call_id.as_str())
                {
                    return self.drop_input("record created");
                }
                let call_id = record.call_id.clone();
                self.record = Some(record);
                self.subscribed = true;

                let mut effects = vec![Effect::Subscribe { call_id }];
                effects.extend(self.publish_outbound());
                effects
            }

            CallInput::RecordPreempted { by } => {
                if self.state != CallState::Calling || !is_caller {
                    return self.drop_input("record preempted");
                }
                tracing::info!("Call preempted by {}", by);
                let mut effects = Vec::new();
                if self.media_open {
                    self.media_open = false;
                    effects.push(Effect::ReleaseMedia);
                }
                // Slot gehört jetzt dem anderen Anruf
                self.slot_claimed = false;
                effects.extend(self.yield_to(by));
                effects
            }

            CallInput::Snapshot(record) => self.on_snapshot(record, now),

            CallInput::LocalCandidate(candidate) => {
                if !self.media_open {
                    return self.drop_input("local candidate");
                }
                match self.outbound.push(candidate) {
                    Some(candidate) => self.publish(vec![candidate]),
                    None => Vec::new(),
                }
            }

            CallInput::AnswerCreated(answer) => {
                if self.state != CallState::Connecting || is_caller {
                    return self.drop_input("answer created");
                }
                let Some(call_id) = self.call_id.clone() else {
                    return Vec::new();
                };
                let mut effects = vec![Effect::UpdateRecord {
                    call_id,
                    patch: RecordPatch::answer(answer),
                }];
                let remote = self.inbound.release();
                if !remote.is_empty() {
                    effects.push(Effect::AddRemoteCandidates(remote));
                }
                effects.extend(self.publish_outbound());
                effects
            }

            CallInput::RemoteDescriptionApplied => {
                if self.state != CallState::Connecting || !is_caller {
                    return self.drop_input("remote description applied");
                }
                let remote = self.inbound.release();
                if remote.is_empty() {
                    Vec::new()
                } else {
                    vec![Effect::AddRemoteCandidates(remote)]
                }
            }

            CallInput::MediaConnected => match self.state {
                CallState::Connecting => {
                    self.state = CallState::Connected;
                    self.connected_at = Some(now);
                    self.disarm(Timer::Connect);
                    self.disarm(Timer::DisconnectGrace);

                    let mut effects = vec![self.arm(Timer::MaxDuration, self.policy.max_call_duration)];
                    // Nur der Anrufer schreibt InProgress
                    if is_caller {
                        if let Some(call_id) = self.call_id.clone() {
                            effects.push(Effect::UpdateRecord {
                                call_id,
                                patch: RecordPatch::status(CallStatus::InProgress)
                                    .with_answer_time(now),
                            });
                        }
                    }
                    effects
                }
                CallState::Connected => {
                    self.disarm(Timer::DisconnectGrace);
                    Vec::new()
                }
                _ => self.drop_input("media connected"),
            },

            CallInput::MediaDisconnected => {
                if !matches!(self.state, CallState::Connecting | CallState::Connected) {
                    return self.drop_input("media disconnected");
                }
                vec![self.arm(Timer::DisconnectGrace, self.policy.disconnect_grace)]
            }

            CallInput::MediaFailed(reason) => self.fail(CallError::MediaEngine(reason), now),

            CallInput::RemoteTrack(kind) => {
                if !matches!(self.state, CallState::Connecting | CallState::Connected) {
                    return self.drop_input("remote track");
                }
                if !self.remote_tracks.contains(&kind) {
                    self.remote_tracks.push(kind);
                }
                Vec::new()
            }

            CallInput::ChannelFailed(reason) => self.fail(CallError::Channel(reason), now),

            CallInput::EffectFailed(err) => match err {
                // z.B. Status-Schreiben gegen eine schnellere Gegenseite
                CallError::InvalidTransition(reason) => {
                    tracing::debug!("Ignoring rejected write: {}", reason);
                    Vec::new()
                }
                other => self.fail(other, now),
            },

            CallInput::TimerFired { timer, seq } => {
                if self.timers.get(&timer) != Some(&seq) {
                    return Vec::new();
                }
                self.timers.remove(&timer);
                self.on_timer(timer, now)
            }
        }
    }

    fn on_timer(&mut self, timer: Timer, now: DateTime<Utc>) -> Vec<Effect> {
        match timer {
            Timer::Ringing => {
                if !matches!(
                    self.state,
                    CallState::Idle | CallState::Calling | CallState::Ringing
                ) {
                    return Vec::new();
                }
                tracing::info!("Ringing timeout for call {:?}", self.call_id);
                let mut effects = Vec::new();
                effects.extend(self.write_end(CallStatus::Missed, now));
                effects.extend(self.finish(CallStatus::Missed, Some(CallError::Timeout)));
                effects
            }
            Timer::GlareCommit => match self.pending_record.take() {
                Some(record) => vec![Effect::CreateRecord(record)],
                None => Vec::new(),
            },
            Timer::Connect => {
                if self.state != CallState::Connecting {
                    return Vec::new();
                }
                self.fail(CallError::Timeout, now)
            }
            Timer::DisconnectGrace => self.fail(
                CallError::MediaEngine("media connection lost".to_string()),
                now,
            ),
            Timer::MaxDuration => {
                if self.state != CallState::Connected {
                    return Vec::new();
                }
                tracing::info!("Maximum call duration reached");
                let mut effects = Vec::new();
                effects.extend(self.write_end(CallStatus::Completed, now));
                effects.extend(self.finish(CallStatus::Completed, None));
                effects
            }
        }
    }

    fn on_snapshot(&mut self, record: CallRecord, now: DateTime<Utc>) -> Vec<Effect> {
        if self.call_id.as_deref() != Some(record.call_id.as_str()) {
            return Vec::new();
        }
        if let Some(last) = &self.record {
            if *last == record || !supersedes(last, &record) {
                return Vec::new();
            }
        }
        let Some(side) = record.side_of(&self.local_id) else {
            tracing::debug!("Call {} does not involve {}", record.call_id, self.local_id);
            return Vec::new();
        };
        self.record = Some(record.clone());

        if record.is_terminal() {
            tracing::info!("Call {} ended remotely ({})", record.call_id, record.status);
            let mut effects = Vec::new();
            if record.end_time.is_none() {
                effects.push(Effect::UpdateRecord {
                    call_id: record.call_id.clone(),
                    patch: RecordPatch {
                        end_time: Some(now),
                        ..Default::default()
                    },
                });
            }
            effects.extend(self.finish(record.status, None));
            return effects;
        }

        let mut effects = Vec::new();
        match (self.state, self.role) {
            (CallState::Idle | CallState::Calling, Some(CallRole::Recipient)) => {
                if record.status == CallStatus::Ringing && side == CandidateSide::Recipient {
                    self.state = CallState::Ringing;
                    self.is_video = record.is_video;
                    self.peer_id = Some(record.caller_id.clone());
                    self.chat_room_id = Some(record.chat_room_id.clone());
                    self.controls = MediaControls::for_call(record.is_video);
                    effects.push(Effect::AlertIncoming(record.clone()));
                }
            }
            (CallState::Calling, Some(CallRole::Caller)) => {
                if let Some(answer) = record.answer.clone() {
                    self.state = CallState::Connecting;
                    self.disarm(Timer::Ringing);
                    effects.push(Effect::ApplyRemoteAnswer { answer });
                    effects.push(self.arm(Timer::Connect, self.policy.connect_timeout));
                }
            }
            _ => {}
        }

        if let Some(role) = self.role {
            let fresh = self.inbound.observe(record.candidates(role.remote_side()));
            if !fresh.is_empty() {
                effects.push(Effect::AddRemoteCandidates(fresh));
            }
        }
        effects
    }

    /// Nach `Ended`: gespeicherten Datensatz nachführen und Ergebnisse
    /// verspäteter Effekte wieder freigeben
    fn absorb(&mut self, input: CallInput, now: DateTime<Utc>) -> Vec<Effect> {
        match input {
            CallInput::Snapshot(record) => {
                if self.call_id.as_deref() != Some(record.call_id.as_str()) {
                    return Vec::new();
                }
                let newer = match &self.record {
                    Some(last) => *last != record && supersedes(last, &record),
                    None => true,
                };
                if newer {
                    self.record = Some(record);
                }
                Vec::new()
            }
            // Datensatz entstand erst nach dem Auflegen
            CallInput::RecordCreated(record) => {
                if self.call_id.as_deref() != Some(record.call_id.as_str())
                    || record.is_terminal()
                {
                    return Vec::new();
                }
                let status = self.outcome.unwrap_or(CallStatus::Missed);
                let effect = Effect::UpdateRecord {
                    call_id: record.call_id.clone(),
                    patch: RecordPatch::status(status).with_end_time(now),
                };
                self.record = Some(record);
                vec![effect]
            }
            // Slot wurde erst nach dem Auflegen vergeben
            CallInput::SessionGranted => match (&self.peer_id, &self.call_id) {
                (Some(peer_id), Some(call_id)) if self.role == Some(CallRole::Caller) => {
                    vec![Effect::ReleaseSession {
                        peer_id: peer_id.clone(),
                        call_id: call_id.clone(),
                    }]
                }
                _ => Vec::new(),
            },
            other => {
                tracing::debug!("Call ended, dropping {:?}", other);
                Vec::new()
            }
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn expect_ringing(&self, operation: &'static str, call_id: &str) -> Result<(), CallError> {
        if self.state != CallState::Ringing || self.call_id.as_deref() != Some(call_id) {
            return Err(CallError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn drop_input(&self, what: &str) -> Vec<Effect> {
        tracing::debug!("Dropping {} in state {}", what, self.state);
        Vec::new()
    }

    fn arm(&mut self, timer: Timer, after: Duration) -> Effect {
        self.next_seq += 1;
        self.timers.insert(timer, self.next_seq);
        Effect::StartTimer {
            timer,
            after,
            seq: self.next_seq,
        }
    }

    fn disarm(&mut self, timer: Timer) {
        self.timers.remove(&timer);
    }

    /// Auflegen: Completed wenn je verbunden, sonst Missed
    fn hangup_outcome(&self) -> CallStatus {
        let in_progress = self
            .record
            .as_ref()
            .map(|r| r.status == CallStatus::InProgress)
            .unwrap_or(false);
        if self.connected_at.is_some() || in_progress {
            CallStatus::Completed
        } else {
            CallStatus::Missed
        }
    }

    /// Beobachtet den Anruf eines anderen statt selbst anzurufen
    fn yield_to(&mut self, call_id: String) -> Vec<Effect> {
        tracing::info!("Yielding to incoming call {}", call_id);
        self.role = Some(CallRole::Recipient);
        self.call_id = Some(call_id.clone());
        self.record = None;
        self.pending_record = None;
        self.disarm(Timer::GlareCommit);
        self.outbound = CandidateBuffer::new();
        self.inbound = CandidateBuffer::new();
        self.subscribed = true;
        vec![Effect::Subscribe { call_id }]
    }

    fn publish(&self, candidates: Vec<String>) -> Vec<Effect> {
        match (&self.call_id, self.role) {
            (Some(call_id), Some(role)) if !candidates.is_empty() => {
                vec![Effect::PublishCandidates {
                    call_id: call_id.clone(),
                    side: role.local_side(),
                    candidates,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn publish_outbound(&mut self) -> Vec<Effect> {
        let queued = self.outbound.release();
        self.publish(queued)
    }

    /// Abschluss-Schreiben: Status, Endzeit und ggf. fehlende Answer-Zeit.
    /// Ein Empfänger, bei dem es nie geklingelt hat, schreibt nichts.
    fn write_end(&self, status: CallStatus, now: DateTime<Utc>) -> Option<Effect> {
        let record = self.record.as_ref()?;
        if record.is_terminal() {
            return None;
        }
        let never_rang = self.role == Some(CallRole::Recipient)
            && matches!(self.state, CallState::Idle | CallState::Calling);
        if never_rang {
            tracing::debug!("Not writing {} to call {} that never rang here", status, record.call_id);
            return None;
        }
        let mut patch = RecordPatch::status(status).with_end_time(now);
        if let (Some(connected_at), None) = (self.connected_at, record.answer_time) {
            patch = patch.with_answer_time(connected_at);
        }
        Some(Effect::UpdateRecord {
            call_id: record.call_id.clone(),
            patch,
        })
    }

    fn fail(&mut self, error: CallError, now: DateTime<Utc>) -> Vec<Effect> {
        tracing::warn!("Call {:?} failed: {}", self.call_id, error);
        let mut effects = Vec::new();
        effects.extend(self.write_end(CallStatus::Error, now));
        effects.extend(self.finish(CallStatus::Error, Some(error)));
        effects
    }

    /// Übergang nach `Ended` und Freigabe aller Ressourcen
    fn finish(&mut self, outcome: CallStatus, error: Option<CallError>) -> Vec<Effect> {
        let was_ringing = self.state == CallState::Ringing;
        self.state = CallState::Ended;
        self.outcome = Some(outcome);
        self.error = error;
        self.timers.clear();
        self.pending_record = None;

        let mut effects = Vec::new();
        if was_ringing {
            effects.push(Effect::StopAlert);
        }
        if self.media_open {
            self.media_open = false;
            effects.push(Effect::ReleaseMedia);
        }
        if self.subscribed {
            self.subscribed = false;
            effects.push(Effect::Unsubscribe);
        }
        if self.slot_claimed {
            self.slot_claimed = false;
            if let (Some(peer_id), Some(call_id)) = (&self.peer_id, &self.call_id) {
                effects.push(Effect::ReleaseSession {
                    peer_id: peer_id.clone(),
                    call_id: call_id.clone(),
                });
            }
        }
        effects
    }
}

/// `next` ist nicht älter als `last`
fn supersedes(last: &CallRecord, next: &CallRecord) -> bool {
    last.status.can_advance_to(next.status)
        && (last.answer.is_none() || next.answer.is_some())
        && next.caller_candidates.len() >= last.caller_candidates.len()
        && next.recipient_candidates.len() >= last.recipient_candidates.len()
}

// ============================================================================
// TESTS
// ============================================================================
