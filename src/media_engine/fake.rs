//! Skriptbare Media Engine für Tests

use super::adapter::{MediaEngine, MediaEvent, MediaSession};
use super::MediaError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Aufgezeichneter Aufruf an eine Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    CreateOffer,
    CreateAnswer(String),
    SetRemote(String),
    AddCandidate(String),
    Audio(bool),
    Video(bool),
    Speaker(bool),
    SwitchCamera,
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    /// Werden nach der lokalen Beschreibung gemeldet
    pub candidates: Vec<String>,
    /// `Connected` sobald beide Beschreibungen stehen
    pub auto_connect: bool,
    pub fail_offer: bool,
}

pub struct FakeMediaEngine {
    label: String,
    script: FakeScript,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeMediaEngine {
    pub fn new(label: &str, script: FakeScript) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            script,
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn open_session(
        &self,
        is_video: bool,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let session = Arc::new(FakeSession {
            label: self.label.clone(),
            is_video,
            script: self.script.clone(),
            events,
            calls: Mutex::new(Vec::new()),
            descriptions: Mutex::new((false, false)),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

pub struct FakeSession {
    label: String,
    pub is_video: bool,
    script: FakeScript,
    events: mpsc::UnboundedSender<MediaEvent>,
    calls: Mutex<Vec<FakeCall>>,
    /// (lokal, remote)
    descriptions: Mutex<(bool, bool)>,
}

impl FakeSession {
    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().clone()
    }

    pub fn added_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                FakeCall::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.calls.lock().contains(&FakeCall::Close)
    }

    /// Simuliert einen Callback der Engine
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: FakeCall) {
        self.calls.lock().push(call);
    }

    fn described(&self, local: bool, remote: bool) {
        let ready = {
            let mut d = self.descriptions.lock();
            d.0 |= local;
            d.1 |= remote;
            d.0 && d.1
        };
        if local {
            for candidate in &self.script.candidates {
                self.emit(MediaEvent::LocalCandidate(candidate.clone()));
            }
        }
        if ready && self.script.auto_connect {
            self.emit(MediaEvent::Connected);
        }
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn create_offer(&self) -> Result<String, MediaError> {
        self.record(FakeCall::CreateOffer);
        if self.script.fail_offer {
            return Err(MediaError::WebRTC("scripted offer failure".to_string()));
        }
        self.described(true, false);
        Ok(format!("offer:{}", self.label))
    }

    async fn create_answer(&self, remote_offer: &str) -> Result<String, MediaError> {
        self.record(FakeCall::CreateAnswer(remote_offer.to_string()));
        self.described(true, true);
        Ok(format!("answer:{}", self.label))
    }

    async fn set_remote_description(&self, answer: &str) -> Result<(), MediaError> {
        self.record(FakeCall::SetRemote(answer.to_string()));
        self.described(false, true);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError> {
        self.record(FakeCall::AddCandidate(candidate.to_string()));
        Ok(())
    }

    async fn set_audio_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.record(FakeCall::Audio(enabled));
        Ok(())
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.record(FakeCall::Video(enabled));
        Ok(())
    }

    fn set_speaker_enabled(&self, enabled: bool) {
        self.record(FakeCall::Speaker(enabled));
    }

    async fn switch_camera(&self) -> Result<(), MediaError> {
        self.record(FakeCall::SwitchCamera);
        Ok(())
    }

    async fn close(&self) {
        self.record(FakeCall::Close);
    }
}
