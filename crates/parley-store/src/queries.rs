use chrono::{DateTime, Utc};
use rusqlite::Connection;

use parley_types::{ChatEvent, ChatMessage, FileMeta, Frame};

use crate::Database;
use crate::error::Result;
use crate::models::{FileMetaRow, LogKind, LogRow};

impl Database {
    // -- Room logs --

    /// Append a chat or file-announcement frame to `history_<roomId>`.
    pub fn append_chat(&self, message: &ChatMessage, frame: &Frame) -> Result<()> {
        let log_name = LogKind::History.log_name(&message.room_id);
        let body = serde_json::to_string(frame)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO room_logs (log_name, id, parent_id, room_id, participant_id, message_type, frame, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    log_name,
                    message.id,
                    message.parent_id,
                    message.room_id,
                    message.participant_id.as_ref().map(|p| p.as_str()),
                    message.kind,
                    body,
                    message.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Append a stream-control frame to `event_<roomId>`.
    pub fn append_event(&self, event: &ChatEvent, frame: &Frame) -> Result<()> {
        let log_name = LogKind::Event.log_name(&event.room_id);
        let body = serde_json::to_string(frame)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO room_logs (log_name, id, room_id, participant_id, message_type, frame, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    log_name,
                    event.id,
                    event.room_id,
                    event.participant_id.as_ref().map(|p| p.as_str()),
                    event.message_type,
                    body,
                    event.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// All entries of one room log, in arrival order.
    pub fn read_log(&self, kind: LogKind, room_id: &str) -> Result<Vec<LogRow>> {
        let log_name = kind.log_name(room_id);
        self.with_conn(|conn| query_log(conn, &log_name))
    }

    // -- File metadata --

    /// Insert or refresh a file record. A re-announced file keeps its
    /// `complete` flag and received watermark.
    pub fn upsert_file_meta(
        &self,
        room_id: &str,
        meta: &FileMeta,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO file_meta (file_id, room_id, participant_id, name, extension, mime_type,
                                        total_size, chunk_size, realtime, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)
                 ON CONFLICT(file_id) DO UPDATE SET
                    name = excluded.name,
                    extension = excluded.extension,
                    mime_type = excluded.mime_type,
                    total_size = excluded.total_size,
                    chunk_size = excluded.chunk_size",
                rusqlite::params![
                    meta.file_id,
                    room_id,
                    meta.from.as_ref().map(|p| p.as_str()),
                    meta.name,
                    meta.extension,
                    meta.mime_type,
                    meta.size as i64,
                    meta.chunk_size as i64,
                    created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_file_meta(&self, file_id: &str) -> Result<Option<FileMetaRow>> {
        self.with_conn(|conn| query_file_meta(conn, file_id))
    }

    /// Flip `complete` to true. Returns false when no record exists.
    pub fn mark_file_complete(&self, file_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE file_meta SET complete = 1 WHERE file_id = ?1",
                [file_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Raise the received-bytes watermark to `end` (never lowers it).
    pub fn advance_received(&self, file_id: &str, end: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE file_meta SET bytes_received = MAX(bytes_received, ?2) WHERE file_id = ?1",
                rusqlite::params![file_id, end as i64],
            )?;
            Ok(())
        })
    }
}

fn query_log(conn: &Connection, log_name: &str) -> Result<Vec<LogRow>> {
    let mut stmt = conn.prepare(
        "SELECT seq, id, parent_id, room_id, participant_id, message_type, frame, created_at
         FROM room_logs
         WHERE log_name = ?1
         ORDER BY seq ASC",
    )?;

    let rows = stmt
        .query_map([log_name], |row| {
            Ok(LogRow {
                seq: row.get(0)?,
                id: row.get(1)?,
                parent_id: row.get(2)?,
                room_id: row.get(3)?,
                participant_id: row.get(4)?,
                message_type: row.get(5)?,
                frame: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn query_file_meta(conn: &Connection, file_id: &str) -> Result<Option<FileMetaRow>> {
    let mut stmt = conn.prepare(
        "SELECT file_id, room_id, participant_id, name, extension, mime_type, total_size,
                chunk_size, complete, realtime, bytes_received, created_at
         FROM file_meta
         WHERE file_id = ?1",
    )?;

    let row = stmt
        .query_row([file_id], |row| {
            Ok(FileMetaRow {
                file_id: row.get(0)?,
                room_id: row.get(1)?,
                participant_id: row.get(2)?,
                name: row.get(3)?,
                extension: row.get(4)?,
                mime_type: row.get(5)?,
                total_size: row.get(6)?,
                chunk_size: row.get(7)?,
                complete: row.get(8)?,
                realtime: row.get(9)?,
                bytes_received: row.get(10)?,
                created_at: row.get(11)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
