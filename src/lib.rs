//! Call Signaling - Anruf-Signaling und Session-Lebenszyklus
//!
//! Baut P2P Audio-/Videoanrufe über einen Document Store auf:
//! - `signaling`: CallRecord-Austausch, Abos und Glare-Slot pro Paar
//! - `media_engine`: WebRTC Sessions hinter einem Adapter-Trait
//! - `call`: State Machine und `CallManager` mit einer Event-Loop
//! - `history`: SQLite-Anrufprotokoll

pub mod call;
pub mod config;
pub mod history;
pub mod media_engine;
pub mod signaling;

pub use call::{CallError, CallManager, CallRole, CallSnapshot, CallState, MediaControls};
pub use config::{CallConfig, IceServerConfig, TieBreak};
pub use history::{CallHistory, HistoryEntry};
pub use signaling::{CallRecord, CallStatus, SignalingChannel};

use anyhow::Context;
use media_engine::WebRtcEngine;
use signaling::RemoteDocumentStore;
use std::sync::Arc;

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den `tracing` Subscriber (Filter über `RUST_LOG`)
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("call_signaling=debug".parse()?)
        .add_directive("webrtc=warn".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

// ============================================================================
// SETUP
// ============================================================================

/// Verbindet mit dem gehosteten Document Store und startet einen
/// `CallManager` mit WebRTC Media Engine
pub async fn connect(local_user_id: &str, config: CallConfig) -> anyhow::Result<CallManager> {
    tracing::info!("Connecting {} to {}", local_user_id, config.signaling_url);

    let store = RemoteDocumentStore::connect(
        &config.signaling_url,
        config.signaling_timeout,
        config.heartbeat_interval,
    )
    .await
    .with_context(|| format!("Failed to connect to {}", config.signaling_url))?;

    let channel = SignalingChannel::new(store, &config);
    let engine = Arc::new(WebRtcEngine::new(&config.ice_servers));
    Ok(CallManager::new(local_user_id, channel, engine, config))
}
