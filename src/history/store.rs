//! Call History Database
//!
//! SQLite-Tabelle mit dem finalen Stand jedes beendeten Anrufs.
//! Zeitstempel werden als RFC3339-Text gespeichert.

use super::summary::summary_line;
use super::HistoryError;
use crate::signaling::{CallRecord, CallStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SELECT_COLUMNS: &str = r#"
    SELECT call_id, chat_room_id, caller_id, recipient_id, is_video, status,
           start_time, answer_time, end_time, duration_ms
    FROM call_history
"#;

// ============================================================================
// HISTORY ENTRY
// ============================================================================

/// Archivierter Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub call_id: String,
    pub chat_room_id: String,
    pub caller_id: String,
    pub recipient_id: String,
    pub is_video: bool,
    pub status: CallStatus,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl HistoryEntry {
    /// Die jeweils andere Seite aus Sicht von `user_id`
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.caller_id == user_id {
            &self.recipient_id
        } else {
            &self.caller_id
        }
    }

    pub fn summary(&self) -> String {
        summary_line(self.is_video, self.status, Some(self.duration_ms))
    }
}

/// Rohzeile vor dem Parsen der Zeitstempel
struct RawEntry {
    call_id: String,
    chat_room_id: String,
    caller_id: String,
    recipient_id: String,
    is_video: bool,
    status: String,
    start_time: String,
    answer_time: Option<String>,
    end_time: Option<String>,
    duration_ms: i64,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            call_id: row.get(0)?,
            chat_room_id: row.get(1)?,
            caller_id: row.get(2)?,
            recipient_id: row.get(3)?,
            is_video: row.get::<_, i32>(4)? != 0,
            status: row.get(5)?,
            start_time: row.get(6)?,
            answer_time: row.get(7)?,
            end_time: row.get(8)?,
            duration_ms: row.get(9)?,
        })
    }

    fn into_entry(self) -> Result<HistoryEntry, HistoryError> {
        Ok(HistoryEntry {
            call_id: self.call_id,
            chat_room_id: self.chat_room_id,
            caller_id: self.caller_id,
            recipient_id: self.recipient_id,
            is_video: self.is_video,
            status: CallStatus::parse(&self.status),
            start_time: parse_time(&self.start_time)?,
            answer_time: self.answer_time.as_deref().map(parse_time).transpose()?,
            end_time: self.end_time.as_deref().map(parse_time).transpose()?,
            duration_ms: self.duration_ms.max(0) as u64,
        })
    }
}

/// Feste Länge, damit die Textsortierung der Zeitsortierung entspricht
fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, HistoryError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| HistoryError::InvalidTimestamp(text.to_string()))
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Anrufprotokoll (Thread-safe durch Mutex)
pub struct CallHistory {
    conn: Mutex<Connection>,
}

impl CallHistory {
    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call history at {:?}", path);
        Self::with_connection(Connection::open(path)?)
    }

    /// Öffnet die Datenbank im Datenverzeichnis der Plattform
    pub fn open_default() -> Result<Self, HistoryError> {
        Self::open(Self::default_path()?)
    }

    /// In-Memory Datenbank für Tests
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn default_path() -> Result<PathBuf, HistoryError> {
        let proj_dirs = directories::ProjectDirs::from("dev", "call-signaling", "call-signaling")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("call_history.db");
        Ok(path)
    }

    fn with_connection(conn: Connection) -> Result<Self, HistoryError> {
        let history = Self {
            conn: Mutex::new(conn),
        };
        history.init_schema()?;
        Ok(history)
    }

    fn init_schema(&self) -> Result<(), HistoryError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS call_history (
                call_id TEXT PRIMARY KEY,
                chat_room_id TEXT NOT NULL,
                caller_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                is_video INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                start_time TEXT NOT NULL,
                answer_time TEXT,
                end_time TEXT,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                archived_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_call_history_room
            ON call_history(chat_room_id, start_time)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Archiviert den finalen Stand eines Anrufs.
    ///
    /// Ein erneutes Archivieren derselben `call_id` überschreibt den Eintrag.
    pub fn archive(&self, record: &CallRecord) -> Result<HistoryEntry, HistoryError> {
        if !record.is_terminal() {
            return Err(HistoryError::NotTerminal(record.call_id.clone()));
        }

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO call_history (
                call_id, chat_room_id, caller_id, recipient_id, is_video, status,
                start_time, answer_time, end_time, duration_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(call_id) DO UPDATE SET
                status = excluded.status,
                answer_time = excluded.answer_time,
                end_time = excluded.end_time,
                duration_ms = excluded.duration_ms,
                archived_at = datetime('now')
            "#,
            params![
                record.call_id,
                record.chat_room_id,
                record.caller_id,
                record.recipient_id,
                record.is_video as i32,
                record.status.as_str(),
                format_time(record.start_time),
                record.answer_time.map(format_time),
                record.end_time.map(format_time),
                record.duration.unwrap_or(0) as i64,
            ],
        )?;

        tracing::debug!("Archived call {} ({})", record.call_id, record.status);
        Self::get_inner(&conn, &record.call_id)?
            .ok_or_else(|| HistoryError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    fn get_inner(conn: &Connection, call_id: &str) -> Result<Option<HistoryEntry>, HistoryError> {
        let raw = conn
            .query_row(
                &format!("{} WHERE call_id = ?1", SELECT_COLUMNS),
                params![call_id],
                RawEntry::from_row,
            )
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    pub fn get(&self, call_id: &str) -> Result<Option<HistoryEntry>, HistoryError> {
        let conn = self.conn.lock();
        Self::get_inner(&conn, call_id)
    }

    /// Neueste Anrufe zuerst
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY start_time DESC LIMIT ?1",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], RawEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawEntry::into_entry).collect()
    }

    /// Alle Anrufe eines Chats, neueste zuerst
    pub fn for_chat_room(&self, chat_room_id: &str) -> Result<Vec<HistoryEntry>, HistoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE chat_room_id = ?1 ORDER BY start_time DESC",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![chat_room_id], RawEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawEntry::into_entry).collect()
    }

    /// Gibt zurück ob ein Eintrag gelöscht wurde
    pub fn delete(&self, call_id: &str) -> Result<bool, HistoryError> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "DELETE FROM call_history WHERE call_id = ?1",
            params![call_id],
        )?;
        Ok(affected > 0)
    }
}

impl std::fmt::Debug for CallHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHistory").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::RecordPatch;
    use chrono::Duration;

    fn ended(call_id: &str, room: &str, offset_secs: i64, status: CallStatus) -> CallRecord {
        let start = Utc::now() + Duration::seconds(offset_secs);
        let mut record = CallRecord::new(
            call_id.to_string(),
            room.to_string(),
            "alice".to_string(),
            "bob".to_string(),
            true,
            start,
        );
        let mut patch = RecordPatch::status(status).with_end_time(start + Duration::seconds(70));
        if status == CallStatus::Completed {
            patch = patch.with_answer_time(start + Duration::seconds(5));
        }
        record.apply_patch(&patch).unwrap();
        record
    }

    #[test]
    fn test_archive_and_get() {
        let history = CallHistory::open_in_memory().unwrap();
        let record = ended("c1", "room-1", 0, CallStatus::Completed);

        let entry = history.archive(&record).unwrap();
        assert_eq!(entry.status, CallStatus::Completed);
        assert_eq!(entry.duration_ms, 65_000);
        assert_eq!(entry.answer_time, record.answer_time);
        assert_eq!(entry.summary(), "📹 Video call • 1:05");
        assert_eq!(entry.peer_of("bob"), "alice");

        assert_eq!(history.get("c1").unwrap(), Some(entry));
        assert_eq!(history.get("missing").unwrap(), None);
    }

    #[test]
    fn test_only_terminal_records_are_archived() {
        let history = CallHistory::open_in_memory().unwrap();
        let record = CallRecord::new(
            "c1".to_string(),
            "room".to_string(),
            "alice".to_string(),
            "bob".to_string(),
            false,
            Utc::now(),
        );
        assert!(matches!(
            history.archive(&record),
            Err(HistoryError::NotTerminal(_))
        ));
    }

    #[test]
    fn test_recent_and_chat_room_queries() {
        let history = CallHistory::open_in_memory().unwrap();
        history
            .archive(&ended("c1", "room-1", -300, CallStatus::Missed))
            .unwrap();
        history
            .archive(&ended("c2", "room-2", -200, CallStatus::Declined))
            .unwrap();
        history
            .archive(&ended("c3", "room-1", -100, CallStatus::Completed))
            .unwrap();

        let recent: Vec<String> = history
            .recent(2)
            .unwrap()
            .into_iter()
            .map(|e| e.call_id)
            .collect();
        assert_eq!(recent, vec!["c3", "c2"]);

        let room: Vec<String> = history
            .for_chat_room("room-1")
            .unwrap()
            .into_iter()
            .map(|e| e.call_id)
            .collect();
        assert_eq!(room, vec!["c3", "c1"]);

        assert!(history.delete("c1").unwrap());
        assert!(!history.delete("c1").unwrap());
        assert_eq!(history.for_chat_room("room-1").unwrap().len(), 1);
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = std::env::temp_dir().join(format!("call-history-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("history.db");

        let history = CallHistory::open(&path).unwrap();
        history
            .archive(&ended("c1", "room", 0, CallStatus::Missed))
            .unwrap();
        drop(history);

        let reopened = CallHistory::open(&path).unwrap();
        assert_eq!(reopened.recent(10).unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
