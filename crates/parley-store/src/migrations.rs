use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Store: running migration v1 (room logs, file meta)");
        conn.execute_batch(
            "
            -- Append-only logs. log_name is history_<roomId> or event_<roomId>.
            CREATE TABLE room_logs (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                log_name        TEXT NOT NULL,
                id              TEXT NOT NULL,
                parent_id       TEXT,
                room_id         TEXT NOT NULL,
                participant_id  TEXT,
                message_type    TEXT NOT NULL,
                frame           TEXT NOT NULL,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_room_logs_name ON room_logs(log_name, seq);

            CREATE TABLE file_meta (
                file_id         TEXT PRIMARY KEY,
                room_id         TEXT NOT NULL,
                participant_id  TEXT,
                name            TEXT NOT NULL,
                extension       TEXT NOT NULL,
                mime_type       TEXT NOT NULL,
                total_size      INTEGER NOT NULL,
                chunk_size      INTEGER NOT NULL,
                complete        INTEGER NOT NULL DEFAULT 0,
                realtime        INTEGER NOT NULL DEFAULT 0,
                bytes_received  INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    Ok(())
}
