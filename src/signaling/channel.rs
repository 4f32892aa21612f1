//! Signaling-Kanal über einen Document Store
//!
//! Dünne Schicht über `DocumentStore`:
//! - Jede Operation ist zeitlich begrenzt
//! - Abos liefern volle Snapshots (at-least-once, Wiederholungen möglich)
//! - Kanalfehler kommen als `ChannelEvent::Error`, nicht als Anrufende

use super::record::{CallRecord, CandidateSide, RecordPatch};
use super::store::{DocumentStore, PairClaim, WatchEvent};
use super::SignalingError;
use crate::config::{CallConfig, TieBreak};
use chrono::Utc;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// Wie oft ein sich ändernder Paar-Slot neu versucht wird
const MAX_CLAIM_ATTEMPTS: usize = 3;

// ============================================================================
// CHANNEL EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Snapshot(CallRecord),
    Error(SignalingError),
}

impl From<WatchEvent> for ChannelEvent {
    fn from(event: WatchEvent) -> Self {
        match event {
            WatchEvent::Snapshot(record) => ChannelEvent::Snapshot(record),
            WatchEvent::Error(reason) => {
                ChannelEvent::Error(SignalingError::ConnectionFailed(reason))
            }
        }
    }
}

/// Ergebnis der Glare-Auflösung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Wir sind der Anrufer für dieses Paar
    Granted,
    /// Die Gegenseite ruft bereits an; wir beobachten deren Anruf
    Yield { call_id: String },
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Abo auf einen Datensatz
pub struct Subscription {
    call_id: String,
    watch_id: u64,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    store: Arc<dyn DocumentStore>,
    active: bool,
}

impl Subscription {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Beendet das Abo; mehrfacher Aufruf ist erlaubt
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.store.unwatch(&self.call_id, self.watch_id);
        self.rx.close();
        tracing::debug!("Unsubscribed from call {}", self.call_id);
    }
}

impl Stream for Subscription {
    type Item = ChannelEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.active {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx).map(|event| event.map(ChannelEvent::from))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("call_id", &self.call_id)
            .field("active", &self.active)
            .finish()
    }
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
    claim_ttl: Duration,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn DocumentStore>, config: &CallConfig) -> Self {
        Self {
            store,
            timeout: config.signaling_timeout,
            claim_ttl: config.ringing_timeout,
        }
    }

    /// Legt den Datensatz an (nur Anrufer)
    pub async fn create_call(&self, record: &CallRecord) -> Result<(), SignalingError> {
        tracing::debug!("Creating call record {}", record.call_id);
        self.bounded(self.store.create(record.clone())).await
    }

    /// Merged Felder in den bestehenden Datensatz
    pub async fn update_call(
        &self,
        call_id: &str,
        patch: RecordPatch,
    ) -> Result<CallRecord, SignalingError> {
        tracing::debug!("Updating call record {}: {:?}", call_id, patch.status);
        self.bounded(self.store.merge(call_id, patch)).await
    }

    /// Hängt einen Candidate an die Liste einer Seite an
    pub async fn append_candidate(
        &self,
        call_id: &str,
        side: CandidateSide,
        candidate: String,
    ) -> Result<(), SignalingError> {
        self.bounded(self.store.append_candidate(call_id, side, candidate))
            .await
    }

    pub async fn get_call(&self, call_id: &str) -> Result<CallRecord, SignalingError> {
        self.bounded(self.store.get(call_id))
            .await?
            .ok_or_else(|| SignalingError::NotFound(call_id.to_string()))
    }

    /// Löscht einen beendeten Datensatz
    pub async fn delete_call(&self, call_id: &str) -> Result<(), SignalingError> {
        self.bounded(self.store.delete(call_id)).await
    }

    /// Abonniert einen Datensatz; der aktuelle Stand kommt sofort
    pub async fn subscribe(&self, call_id: &str) -> Result<Subscription, SignalingError> {
        let watch = self.bounded(self.store.watch(call_id)).await?;
        tracing::debug!("Subscribed to call {}", call_id);
        Ok(Subscription {
            call_id: call_id.to_string(),
            watch_id: watch.id,
            rx: watch.rx,
            store: Arc::clone(&self.store),
            active: true,
        })
    }

    /// Belegt den Slot für das Paar `local`/`peer`.
    ///
    /// Hält die Gegenseite den Slot noch ohne Datensatz und sind wir laut
    /// `tie_break` kanonisch, wird der Slot übernommen.
    pub async fn claim_session(
        &self,
        local: &str,
        peer: &str,
        call_id: &str,
        tie_break: TieBreak,
    ) -> Result<ClaimOutcome, SignalingError> {
        let ttl = chrono::Duration::from_std(self.claim_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let claim = PairClaim::new(local, peer, call_id, Utc::now() + ttl);

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let holder = match self.bounded(self.store.claim_pair(claim.clone())).await? {
                None => return Ok(ClaimOutcome::Granted),
                Some(holder) => holder,
            };

            let ours = holder.owner == local;
            if !ours && (holder.committed || !tie_break.is_canonical(local, peer)) {
                tracing::info!(
                    "Glare: {} yields to call {} from {}",
                    local,
                    holder.call_id,
                    holder.owner
                );
                return Ok(ClaimOutcome::Yield {
                    call_id: holder.call_id,
                });
            }

            if self
                .bounded(self.store.swap_pair(&holder.call_id, claim.clone()))
                .await?
            {
                tracing::info!("Glare: {} takes over slot from call {}", local, holder.call_id);
                return Ok(ClaimOutcome::Granted);
            }
        }

        Err(SignalingError::InvalidTransition(format!(
            "call slot for {} and {} kept changing",
            local, peer
        )))
    }

    /// Gibt den Paar-Slot wieder frei
    pub async fn release_session(
        &self,
        local: &str,
        peer: &str,
        call_id: &str,
    ) -> Result<(), SignalingError> {
        let key = super::store::pair_key(local, peer);
        self.bounded(self.store.release_pair(&key, call_id)).await
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, SignalingError>>,
    ) -> Result<T, SignalingError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| SignalingError::Timeout)?
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::record::CallStatus;
    use crate::signaling::store::MemoryDocumentStore;
    use futures::StreamExt;

    fn channel() -> (Arc<MemoryDocumentStore>, SignalingChannel) {
        let store = Arc::new(MemoryDocumentStore::new());
        let channel = SignalingChannel::new(store.clone(), &CallConfig::default());
        (store, channel)
    }

    fn record(call_id: &str, caller: &str, recipient: &str) -> CallRecord {
        CallRecord::new(
            call_id.to_string(),
            "room".to_string(),
            caller.to_string(),
            recipient.to_string(),
            true,
            Utc::now(),
        )
        .with_offer("offer".to_string())
    }

    #[tokio::test]
    async fn test_subscribe_emits_full_snapshots() {
        let (_store, channel) = channel();
        channel.create_call(&record("c1", "alice", "bob")).await.unwrap();

        let mut sub = channel.subscribe("c1").await.unwrap();
        match sub.next().await.unwrap() {
            ChannelEvent::Snapshot(r) => assert_eq!(r.status, CallStatus::Ringing),
            other => panic!("unexpected {:?}", other),
        }

        channel
            .update_call("c1", RecordPatch::answer("answer".to_string()))
            .await
            .unwrap();
        match sub.next().await.unwrap() {
            ChannelEvent::Snapshot(r) => {
                assert_eq!(r.status, CallStatus::Answered);
                assert_eq!(r.offer.as_deref(), Some("offer"));
                assert_eq!(r.answer.as_deref(), Some("answer"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (_store, channel) = channel();
        let mut sub = channel.subscribe("c1").await.unwrap();
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(sub.next().await.is_none());
        drop(sub);

        channel.create_call(&record("c1", "alice", "bob")).await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_error_is_an_event() {
        let (store, channel) = channel();
        let mut sub = channel.subscribe("c1").await.unwrap();
        store.interrupt_watchers("network down");

        assert_eq!(
            sub.next().await.unwrap(),
            ChannelEvent::Error(SignalingError::ConnectionFailed("network down".to_string()))
        );
    }

    #[tokio::test]
    async fn test_candidates_keep_order_and_duplicates() {
        let (_store, channel) = channel();
        channel.create_call(&record("c1", "alice", "bob")).await.unwrap();
        for c in ["a", "b", "a"] {
            channel
                .append_candidate("c1", CandidateSide::Recipient, c.to_string())
                .await
                .unwrap();
        }
        let rec = channel.get_call("c1").await.unwrap();
        assert_eq!(rec.recipient_candidates, vec!["a", "b", "a"]);
        assert!(rec.caller_candidates.is_empty());

        let err = channel
            .append_candidate("missing", CandidateSide::Caller, "x".to_string())
            .await
            .unwrap_err();
        assert_eq!(err, SignalingError::NotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn test_glare_lower_id_preempts_uncommitted_claim() {
        let (_store, channel) = channel();
        let tie = TieBreak::LowerIdWins;

        assert_eq!(
            channel.claim_session("bob", "alice", "call-b", tie).await.unwrap(),
            ClaimOutcome::Granted
        );
        assert_eq!(
            channel.claim_session("alice", "bob", "call-a", tie).await.unwrap(),
            ClaimOutcome::Granted
        );

        let err = channel
            .create_call(&record("call-b", "bob", "alice"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SignalingError::Preempted {
                by: "call-a".to_string()
            }
        );
        channel.create_call(&record("call-a", "alice", "bob")).await.unwrap();
    }

    #[tokio::test]
    async fn test_glare_higher_id_yields() {
        let (_store, channel) = channel();
        let tie = TieBreak::LowerIdWins;

        channel.claim_session("alice", "bob", "call-a", tie).await.unwrap();
        assert_eq!(
            channel.claim_session("bob", "alice", "call-b", tie).await.unwrap(),
            ClaimOutcome::Yield {
                call_id: "call-a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_committed_call_is_never_preempted() {
        let (_store, channel) = channel();
        channel.create_call(&record("call-b", "bob", "alice")).await.unwrap();

        let outcome = channel
            .claim_session("alice", "bob", "call-a", TieBreak::LowerIdWins)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Yield {
                call_id: "call-b".to_string()
            }
        );

        channel
            .update_call("call-b", RecordPatch::status(CallStatus::Missed))
            .await
            .unwrap();
        channel.release_session("bob", "alice", "call-b").await.unwrap();
        assert_eq!(
            channel
                .claim_session("alice", "bob", "call-a", TieBreak::LowerIdWins)
                .await
                .unwrap(),
            ClaimOutcome::Granted
        );
    }
}
