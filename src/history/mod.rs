//! History Module - Lokales Anrufprotokoll
//!
//! Beendete Anrufe werden als finaler `CallRecord` in SQLite archiviert.
//! `summary` erzeugt daraus die Zeile für Chat-Verläufe.

mod store;
mod summary;

pub use store::{CallHistory, HistoryEntry};
pub use summary::{format_call_duration, summary_line};

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Call {0} has not ended yet")]
    NotTerminal(String),

    #[error("Invalid timestamp in history: {0}")]
    InvalidTimestamp(String),
}
