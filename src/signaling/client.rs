//! WebSocket Client für einen gehosteten Document Store
//!
//! Verwaltet die WebSocket-Verbindung zum Store-Server:
//! - Anfrage/Antwort über `requestId`
//! - Gepushte Snapshots an lokale Watcher verteilen
//! - Heartbeat-Keeping
//! - Bei Verbindungsverlust: offene Anfragen scheitern, Watcher erhalten einen Fehler

use super::messages::*;
use super::record::{CallRecord, CandidateSide, RecordPatch};
use super::store::{DocumentStore, PairClaim, Watch, WatchEvent};
use super::SignalingError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Untergrenze für das Heartbeat-Intervall
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

type WatcherList = Vec<(u64, mpsc::UnboundedSender<WatchEvent>)>;

#[derive(Default)]
struct Routing {
    next_request_id: u64,
    next_watch_id: u64,
    pending: HashMap<u64, oneshot::Sender<StoreMessage>>,
    watchers: HashMap<String, WatcherList>,
}

// ============================================================================
// REMOTE DOCUMENT STORE
// ============================================================================

/// `DocumentStore` über eine WebSocket-Verbindung
pub struct RemoteDocumentStore {
    server_url: String,
    request_timeout: Duration,
    state: Arc<RwLock<ClientState>>,
    routing: Arc<Mutex<Routing>>,
    tx: mpsc::Sender<String>,
}

impl RemoteDocumentStore {
    /// Verbindet mit dem Store-Server
    pub async fn connect(
        server_url: &str,
        request_timeout: Duration,
        heartbeat_interval: Duration,
    ) -> Result<Arc<Self>, SignalingError> {
        let ws_url = websocket_url(server_url)?;
        tracing::info!("Connecting to document store: {}", ws_url);

        let (ws_stream, _) = tokio::time::timeout(request_timeout, connect_async(ws_url.as_str()))
            .await
            .map_err(|_| SignalingError::Timeout)?
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);

        let state = Arc::new(RwLock::new(ClientState { is_connected: true }));
        let routing = Arc::new(Mutex::new(Routing {
            next_request_id: 1,
            ..Default::default()
        }));

        // Read-Task starten
        let state_clone = Arc::clone(&state);
        let routing_clone = Arc::clone(&routing);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<StoreMessage>(&text) {
                        Ok(msg) => Self::handle_server_message(msg, &routing_clone),
                        Err(e) => tracing::warn!("Ignoring malformed store message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by document store");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            Self::fail_all(&routing_clone, "connection to document store lost");
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let client = Arc::new(Self {
            server_url: ws_url.to_string(),
            request_timeout,
            state,
            routing,
            tx,
        });
        Self::start_heartbeat(&client, heartbeat_interval);
        Ok(client)
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Sendet eine Anfrage und wartet auf die zugehörige Antwort
    async fn request(&self, request: StoreRequest) -> Result<StoreMessage, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id = {
            let mut routing = self.routing.lock();
            let id = routing.next_request_id;
            routing.next_request_id += 1;
            routing.pending.insert(id, reply_tx);
            id
        };

        let text = serde_json::to_string(&StoreEnvelope {
            request_id,
            request,
        })
        .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        if let Err(e) = self.tx.send(text).await {
            self.routing.lock().pending.remove(&request_id);
            return Err(SignalingError::SendFailed(e.to_string()));
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(StoreMessage::Rejected {
                code, message, by, ..
            })) => Err(code.into_error(message, by)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SignalingError::ConnectionFailed(
                "connection closed before reply".to_string(),
            )),
            Err(_) => {
                self.routing.lock().pending.remove(&request_id);
                Err(SignalingError::Timeout)
            }
        }
    }

    /// Anfrage ohne Antwort (non-blocking)
    fn send_sync(&self, request: StoreRequest) -> Result<(), SignalingError> {
        let request_id = {
            let mut routing = self.routing.lock();
            let id = routing.next_request_id;
            routing.next_request_id += 1;
            id
        };
        let text = serde_json::to_string(&StoreEnvelope {
            request_id,
            request,
        })
        .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // try_send ist non-blocking
        self.tx
            .try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    async fn expect_ack(&self, request: StoreRequest) -> Result<(), SignalingError> {
        match self.request(request).await? {
            StoreMessage::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Verarbeitet eingehende Server-Nachrichten
    fn handle_server_message(msg: StoreMessage, routing: &Mutex<Routing>) {
        if let Some(request_id) = msg.request_id() {
            let waiter = routing.lock().pending.remove(&request_id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(msg);
                }
                None => tracing::debug!("Reply for unknown request {}", request_id),
            }
            return;
        }

        match msg {
            StoreMessage::Snapshot { call_id, record } => {
                let mut routing = routing.lock();
                if let Some(list) = routing.watchers.get_mut(&call_id) {
                    list.retain(|(_, tx)| tx.send(WatchEvent::Snapshot(record.clone())).is_ok());
                }
            }

            StoreMessage::WatchError { call_id, message } => {
                tracing::warn!("Document store dropped watch on {}: {}", call_id, message);
                if let Some(list) = routing.lock().watchers.remove(&call_id) {
                    for (_, tx) in list {
                        let _ = tx.send(WatchEvent::Error(message.clone()));
                    }
                }
            }

            // Heartbeat-Response - nichts zu tun
            _ => {}
        }
    }

    fn fail_all(routing: &Mutex<Routing>, reason: &str) {
        let mut routing = routing.lock();
        // Wartende Anfragen sehen den geschlossenen oneshot
        routing.pending.clear();
        for (_, list) in routing.watchers.drain() {
            for (_, tx) in list {
                let _ = tx.send(WatchEvent::Error(reason.to_string()));
            }
        }
    }

    /// Startet einen Heartbeat-Task
    fn start_heartbeat(client: &Arc<Self>, every: Duration) {
        let client: Weak<Self> = Arc::downgrade(client);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(MIN_HEARTBEAT_INTERVAL));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                if !client.is_connected() {
                    break;
                }
                if let Err(e) = client.send_sync(StoreRequest::Heartbeat) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }
}

fn unexpected(msg: &StoreMessage) -> SignalingError {
    SignalingError::ConnectionFailed(format!("unexpected reply from document store: {:?}", msg))
}

/// `http(s)://` wird zu `ws(s)://`
fn websocket_url(server_url: &str) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => {
            return Err(SignalingError::ConnectionFailed(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::ConnectionFailed(format!("cannot use {}", server_url)))?;
    Ok(url)
}

#[async_trait]
impl DocumentStore for RemoteDocumentStore {
    async fn create(&self, record: CallRecord) -> Result<(), SignalingError> {
        self.expect_ack(StoreRequest::Create { record }).await
    }

    async fn merge(&self, call_id: &str, patch: RecordPatch) -> Result<CallRecord, SignalingError> {
        let request = StoreRequest::Merge {
            call_id: call_id.to_string(),
            patch,
        };
        match self.request(request).await? {
            StoreMessage::Record {
                record: Some(record),
                ..
            } => Ok(record),
            StoreMessage::Record { record: None, .. } => {
                Err(SignalingError::NotFound(call_id.to_string()))
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn append_candidate(
        &self,
        call_id: &str,
        side: CandidateSide,
        candidate: String,
    ) -> Result<(), SignalingError> {
        self.expect_ack(StoreRequest::AppendCandidate {
            call_id: call_id.to_string(),
            side,
            candidate,
        })
        .await
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>, SignalingError> {
        let request = StoreRequest::Get {
            call_id: call_id.to_string(),
        };
        match self.request(request).await? {
            StoreMessage::Record { record, .. } => Ok(record),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete(&self, call_id: &str) -> Result<(), SignalingError> {
        self.expect_ack(StoreRequest::Delete {
            call_id: call_id.to_string(),
        })
        .await
    }

    async fn watch(&self, call_id: &str) -> Result<Watch, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut routing = self.routing.lock();
            let id = routing.next_watch_id;
            routing.next_watch_id += 1;
            routing
                .watchers
                .entry(call_id.to_string())
                .or_default()
                .push((id, tx));
            id
        };

        // Der Server pusht danach den aktuellen Stand
        let result = self
            .expect_ack(StoreRequest::Watch {
                call_id: call_id.to_string(),
            })
            .await;
        if let Err(e) = result {
            self.unwatch(call_id, id);
            return Err(e);
        }
        Ok(Watch { id, rx })
    }

    fn unwatch(&self, call_id: &str, watch_id: u64) {
        let last = {
            let mut routing = self.routing.lock();
            match routing.watchers.get_mut(call_id) {
                Some(list) => {
                    list.retain(|(id, _)| *id != watch_id);
                    if list.is_empty() {
                        routing.watchers.remove(call_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last && self.is_connected() {
            let request = StoreRequest::Unwatch {
                call_id: call_id.to_string(),
            };
            if let Err(e) = self.send_sync(request) {
                tracing::debug!("Failed to send unwatch for {}: {}", call_id, e);
            }
        }
    }

    async fn claim_pair(&self, claim: PairClaim) -> Result<Option<PairClaim>, SignalingError> {
        match self.request(StoreRequest::ClaimPair { claim }).await? {
            StoreMessage::Claim { holder, .. } => Ok(holder),
            other => Err(unexpected(&other)),
        }
    }

    async fn swap_pair(
        &self,
        expected_call_id: &str,
        claim: PairClaim,
    ) -> Result<bool, SignalingError> {
        let request = StoreRequest::SwapPair {
            expected_call_id: expected_call_id.to_string(),
            claim,
        };
        match self.request(request).await? {
            StoreMessage::Swapped { swapped, .. } => Ok(swapped),
            other => Err(unexpected(&other)),
        }
    }

    async fn release_pair(&self, pair_key: &str, call_id: &str) -> Result<(), SignalingError> {
        self.expect_ack(StoreRequest::ReleasePair {
            pair_key: pair_key.to_string(),
            call_id: call_id.to_string(),
        })
        .await
    }
}

impl std::fmt::Debug for RemoteDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDocumentStore")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
