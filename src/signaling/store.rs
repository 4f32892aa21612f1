//! Document Store - Primitive für den Signaling-Kanal
//!
//! Der Kanal braucht vom Store nur:
//! - Anlegen / Mergen / Anhängen pro Dokument (`call_id`)
//! - Änderungsbenachrichtigung pro Dokument (immer der volle Datensatz)
//! - Einen Slot pro Teilnehmerpaar für die Glare-Auflösung
//!
//! `MemoryDocumentStore` hält alles im Prozess und wird für lokale
//! Anrufe und Tests verwendet.

use super::record::{CallRecord, CandidateSide, RecordPatch};
use super::SignalingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

// ============================================================================
// WATCH TYPES
// ============================================================================

/// Ereignis eines Dokument-Watchers
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Snapshot(CallRecord),
    Error(String),
}

/// Registrierter Watcher; `id` wird für `unwatch` gebraucht
#[derive(Debug)]
pub struct Watch {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<WatchEvent>,
}

// ============================================================================
// PAIR CLAIM
// ============================================================================

/// Belegung des Slots für ein Teilnehmerpaar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairClaim {
    pub pair_key: String,
    pub owner: String,
    pub call_id: String,
    pub committed: bool,
    pub expires_at: DateTime<Utc>,
}

impl PairClaim {
    pub fn new(owner: &str, peer: &str, call_id: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            pair_key: pair_key(owner, peer),
            owner: owner.to_string(),
            call_id: call_id.to_string(),
            committed: false,
            expires_at,
        }
    }
}

/// Reihenfolgeunabhängiger Schlüssel für ein Teilnehmerpaar
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}|{}", a, b)
    } else {
        format!("{}|{}", b, a)
    }
}

// ============================================================================
// DOCUMENT STORE TRAIT
// ============================================================================

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Legt einen Datensatz an; belegt den Paar-Slot falls frei
    async fn create(&self, record: CallRecord) -> Result<(), SignalingError>;

    /// Merged einen Patch und gibt den neuen Datensatz zurück
    async fn merge(&self, call_id: &str, patch: RecordPatch) -> Result<CallRecord, SignalingError>;

    async fn append_candidate(
        &self,
        call_id: &str,
        side: CandidateSide,
        candidate: String,
    ) -> Result<(), SignalingError>;

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>, SignalingError>;

    /// Löscht einen Datensatz im Endstatus
    async fn delete(&self, call_id: &str) -> Result<(), SignalingError>;

    /// Beobachtet ein Dokument; das Dokument muss noch nicht existieren
    async fn watch(&self, call_id: &str) -> Result<Watch, SignalingError>;

    /// Entfernt einen Watcher, mehrfacher Aufruf ist erlaubt
    fn unwatch(&self, call_id: &str, watch_id: u64);

    /// `None` = Slot erhalten, sonst der aktuelle Inhaber
    async fn claim_pair(&self, claim: PairClaim) -> Result<Option<PairClaim>, SignalingError>;

    /// Compare-and-swap auf den Slot
    async fn swap_pair(
        &self,
        expected_call_id: &str,
        claim: PairClaim,
    ) -> Result<bool, SignalingError>;

    async fn release_pair(&self, pair_key: &str, call_id: &str) -> Result<(), SignalingError>;
}

// ============================================================================
// MEMORY DOCUMENT STORE
// ============================================================================

#[derive(Default)]
struct StoreInner {
    records: HashMap<String, CallRecord>,
    watchers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<WatchEvent>)>>,
    pairs: HashMap<String, PairClaim>,
    next_watch_id: u64,
}

impl StoreInner {
    fn notify(&mut self, call_id: &str) {
        let Some(record) = self.records.get(call_id) else {
            return;
        };
        if let Some(list) = self.watchers.get_mut(call_id) {
            list.retain(|(_, tx)| tx.send(WatchEvent::Snapshot(record.clone())).is_ok());
        }
    }

    /// Slot ist frei wenn abgelaufen oder der zugehörige Anruf beendet ist
    fn live_claim(&self, pair_key: &str, now: DateTime<Utc>) -> Option<&PairClaim> {
        let claim = self.pairs.get(pair_key)?;
        if claim.committed {
            match self.records.get(&claim.call_id) {
                Some(record) if !record.is_terminal() => Some(claim),
                _ => None,
            }
        } else if claim.expires_at > now {
            Some(claim)
        } else {
            None
        }
    }

    /// Entfernt abgelaufene und beendete Slots
    fn prune_pairs(&mut self, now: DateTime<Utc>) {
        let records = &self.records;
        self.pairs.retain(|_, claim| {
            if claim.committed {
                records
                    .get(&claim.call_id)
                    .is_some_and(|record| !record.is_terminal())
            } else {
                claim.expires_at > now
            }
        });
    }
}

/// In-Process Document Store
#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: Mutex<StoreInner>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simuliert einen Verbindungsabbruch für alle Watcher
    #[cfg(test)]
    pub fn interrupt_watchers(&self, reason: &str) {
        let mut inner = self.inner.lock();
        for (_, list) in inner.watchers.drain() {
            for (_, tx) in list {
                let _ = tx.send(WatchEvent::Error(reason.to_string()));
            }
        }
    }

    #[cfg(test)]
    pub fn record_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[cfg(test)]
    pub fn pair_count(&self) -> usize {
        self.inner.lock().pairs.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, record: CallRecord) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        if inner.records.contains_key(&record.call_id) {
            return Err(SignalingError::AlreadyExists(record.call_id));
        }

        let key = pair_key(&record.caller_id, &record.recipient_id);
        let now = Utc::now();
        match inner.live_claim(&key, now) {
            Some(claim) if claim.call_id != record.call_id => {
                return Err(SignalingError::Preempted {
                    by: claim.call_id.clone(),
                });
            }
            _ => {}
        }
        inner.pairs.insert(
            key.clone(),
            PairClaim {
                pair_key: key,
                owner: record.caller_id.clone(),
                call_id: record.call_id.clone(),
                committed: true,
                expires_at: now,
            },
        );

        let call_id = record.call_id.clone();
        inner.records.insert(call_id.clone(), record);
        inner.notify(&call_id);
        Ok(())
    }

    async fn merge(&self, call_id: &str, patch: RecordPatch) -> Result<CallRecord, SignalingError> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(call_id)
            .ok_or_else(|| SignalingError::NotFound(call_id.to_string()))?;

        let changed = record.apply_patch(&patch)?;
        let merged = record.clone();
        if changed {
            inner.notify(call_id);
        }
        Ok(merged)
    }

    async fn append_candidate(
        &self,
        call_id: &str,
        side: CandidateSide,
        candidate: String,
    ) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(call_id)
            .ok_or_else(|| SignalingError::NotFound(call_id.to_string()))?;
        record.push_candidate(side, candidate);
        inner.notify(call_id);
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>, SignalingError> {
        Ok(self.inner.lock().records.get(call_id).cloned())
    }

    async fn delete(&self, call_id: &str) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get(call_id)
            .ok_or_else(|| SignalingError::NotFound(call_id.to_string()))?;
        if !record.is_terminal() {
            return Err(SignalingError::InvalidTransition(format!(
                "record {} is still {}",
                call_id, record.status
            )));
        }
        inner.records.remove(call_id);
        inner.watchers.remove(call_id);
        Ok(())
    }

    async fn watch(&self, call_id: &str) -> Result<Watch, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_watch_id;
        inner.next_watch_id += 1;

        if let Some(record) = inner.records.get(call_id) {
            let _ = tx.send(WatchEvent::Snapshot(record.clone()));
        }
        inner
            .watchers
            .entry(call_id.to_string())
            .or_default()
            .push((id, tx));

        Ok(Watch { id, rx })
    }

    fn unwatch(&self, call_id: &str, watch_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.watchers.get_mut(call_id) {
            list.retain(|(id, _)| *id != watch_id);
            if list.is_empty() {
                inner.watchers.remove(call_id);
            }
        }
    }

    async fn claim_pair(&self, claim: PairClaim) -> Result<Option<PairClaim>, SignalingError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        inner.prune_pairs(now);
        if let Some(holder) = inner.live_claim(&claim.pair_key, now) {
            if holder.call_id != claim.call_id {
                return Ok(Some(holder.clone()));
            }
            return Ok(None);
        }
        inner.pairs.insert(claim.pair_key.clone(), claim);
        Ok(None)
    }

    async fn swap_pair(
        &self,
        expected_call_id: &str,
        claim: PairClaim,
    ) -> Result<bool, SignalingError> {
        let mut inner = self.inner.lock();
        let swappable = match inner.live_claim(&claim.pair_key, Utc::now()) {
            Some(holder) => holder.call_id == expected_call_id && !holder.committed,
            None => true,
        };
        if swappable {
            inner.pairs.insert(claim.pair_key.clone(), claim);
        }
        Ok(swappable)
    }

    async fn release_pair(&self, pair_key: &str, call_id: &str) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        if inner
            .pairs
            .get(pair_key)
            .map(|claim| claim.call_id == call_id)
            .unwrap_or(false)
        {
            inner.pairs.remove(pair_key);
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
