//! Konfiguration für Signaling, Timer und ICE Server
//!
//! Werte kommen aus den Defaults, einer JSON-Datei (`CallConfig::load`)
//! oder aus Umgebungsvariablen (`CallConfig::from_env`).

use crate::call::SessionPolicy;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default Signaling URL (kann über `SIGNALING_URL` überschrieben werden)
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8787/calls";

// ============================================================================
// TIE BREAK
// ============================================================================

/// Welche Seite bei gleichzeitigen Anrufen gewinnt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    LowerIdWins,
    HigherIdWins,
}

impl TieBreak {
    /// `true` wenn `local` gegenüber `peer` gewinnt
    pub fn is_canonical(&self, local: &str, peer: &str) -> bool {
        match self {
            TieBreak::LowerIdWins => local < peer,
            TieBreak::HigherIdWins => local > peer,
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "lower_id_wins" | "lower" => Some(TieBreak::LowerIdWins),
            "higher_id_wins" | "higher" => Some(TieBreak::HigherIdWins),
            _ => None,
        }
    }
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServerConfig {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            username: None,
            credential: None,
        },
    ]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub signaling_url: String,

    #[serde(rename = "ringing_timeout_secs", with = "secs")]
    pub ringing_timeout: Duration,

    #[serde(rename = "connect_timeout_secs", with = "secs")]
    pub connect_timeout: Duration,

    #[serde(rename = "glare_window_ms", with = "millis")]
    pub glare_window: Duration,

    #[serde(rename = "disconnect_grace_secs", with = "secs")]
    pub disconnect_grace: Duration,

    #[serde(rename = "max_call_duration_secs", with = "secs")]
    pub max_call_duration: Duration,

    #[serde(rename = "signaling_timeout_secs", with = "secs")]
    pub signaling_timeout: Duration,

    /// Neue Abos nach einem Kanalfehler, bevor der Anruf scheitert
    pub channel_retry_limit: u32,

    #[serde(rename = "heartbeat_interval_secs", with = "secs")]
    pub heartbeat_interval: Duration,

    pub tie_break: TieBreak,

    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ringing_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(30),
            glare_window: Duration::from_millis(500),
            disconnect_grace: Duration::from_secs(5),
            max_call_duration: Duration::from_secs(3600),
            signaling_timeout: Duration::from_secs(10),
            channel_retry_limit: 1,
            heartbeat_interval: Duration::from_secs(25),
            tie_break: TieBreak::LowerIdWins,
            ice_servers: default_ice_servers(),
        }
    }
}

impl CallConfig {
    /// Liest eine JSON-Konfiguration; fehlende Felder behalten ihre Defaults
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()
    }

    /// Defaults, überschrieben durch Umgebungsvariablen
    pub fn from_env() -> anyhow::Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        if let Some(url) = var("SIGNALING_URL") {
            self.signaling_url = url;
        }

        let secs = |key: &str| -> anyhow::Result<Option<Duration>> {
            var(key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .with_context(|| format!("{} must be a number of seconds", key))
                })
                .transpose()
        };

        if let Some(d) = secs("CALL_RINGING_TIMEOUT_SECS")? {
            self.ringing_timeout = d;
        }
        if let Some(d) = secs("CALL_CONNECT_TIMEOUT_SECS")? {
            self.connect_timeout = d;
        }
        if let Some(d) = secs("CALL_DISCONNECT_GRACE_SECS")? {
            self.disconnect_grace = d;
        }
        if let Some(d) = secs("CALL_MAX_DURATION_SECS")? {
            self.max_call_duration = d;
        }
        if let Some(d) = secs("CALL_SIGNALING_TIMEOUT_SECS")? {
            self.signaling_timeout = d;
        }
        if let Some(v) = var("CALL_GLARE_WINDOW_MS") {
            let ms = v
                .trim()
                .parse::<u64>()
                .context("CALL_GLARE_WINDOW_MS must be a number of milliseconds")?;
            self.glare_window = Duration::from_millis(ms);
        }
        if let Some(v) = var("CALL_TIE_BREAK") {
            self.tie_break = TieBreak::parse(&v)
                .with_context(|| format!("Unknown CALL_TIE_BREAK value: {}", v))?;
        }

        self.validate()
    }

    /// Intervalle und Timeouts müssen größer als null sein
    fn validate(self) -> anyhow::Result<Self> {
        for (name, value) in [
            ("heartbeat_interval_secs", self.heartbeat_interval),
            ("signaling_timeout_secs", self.signaling_timeout),
            ("connect_timeout_secs", self.connect_timeout),
            ("ringing_timeout_secs", self.ringing_timeout),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        Ok(self)
    }

    /// Timer und Glare-Regel für die State Machine
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            ringing_timeout: self.ringing_timeout,
            connect_timeout: self.connect_timeout,
            glare_window: self.glare_window,
            disconnect_grace: self.disconnect_grace,
            max_call_duration: self.max_call_duration,
            tie_break: self.tie_break,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ============================================================================
// TESTS
// ============================================================================
