use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::detect::DetectionResult;
use crate::error::PersistenceError;

use super::{
    retention_cutoff_ms, ActiveStateReader, ActiveStateRecord, ActiveStateStore, HistoryEntry,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// SQLite-backed active state (WAL mode).
///
/// `active_state` holds exactly one row. Commit replaces it and appends to
/// `detection_history` inside one transaction; WAL readers keep seeing the
/// previous row until that transaction commits.
pub struct SqliteActiveStateStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteActiveStateStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { conn, path };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_schema(&self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS active_state (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              run_id TEXT NOT NULL,
              generation INTEGER NOT NULL,
              committed_at INTEGER NOT NULL,
              last_success_at INTEGER NOT NULL,
              consecutive_failures INTEGER NOT NULL,
              result_json TEXT NOT NULL,
              before_jpeg BLOB NOT NULL,
              before_digest TEXT NOT NULL,
              after_jpeg BLOB NOT NULL,
              after_digest TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detection_history (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id TEXT NOT NULL,
              generation INTEGER NOT NULL,
              committed_at INTEGER NOT NULL,
              result_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_committed ON detection_history(committed_at);
            "#,
        )?;
        Ok(())
    }
}

impl ActiveStateReader for SqliteActiveStateStore {
    fn read(&self) -> Result<Option<ActiveStateRecord>, PersistenceError> {
        read_active(&self.conn)
    }

    fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, PersistenceError> {
        read_history(&self.conn, limit)
    }
}

impl ActiveStateStore for SqliteActiveStateStore {
    fn commit(&mut self, record: &ActiveStateRecord) -> Result<(), PersistenceError> {
        let result_json = serde_json::to_string(&record.result)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO active_state(
              id, run_id, generation, committed_at, last_success_at, consecutive_failures,
              result_json, before_jpeg, before_digest, after_jpeg, after_digest
            )
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
              run_id = excluded.run_id,
              generation = excluded.generation,
              committed_at = excluded.committed_at,
              last_success_at = excluded.last_success_at,
              consecutive_failures = excluded.consecutive_failures,
              result_json = excluded.result_json,
              before_jpeg = excluded.before_jpeg,
              before_digest = excluded.before_digest,
              after_jpeg = excluded.after_jpeg,
              after_digest = excluded.after_digest
            "#,
            params![
                record.run_id,
                to_i64(record.generation),
                to_i64(record.committed_at_ms),
                to_i64(record.last_success_timestamp_ms),
                i64::from(record.consecutive_failure_count),
                result_json,
                record.before_jpeg,
                record.before_digest,
                record.after_jpeg,
                record.after_digest,
            ],
        )?;
        tx.execute(
            r#"
            INSERT INTO detection_history(run_id, generation, committed_at, result_json)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                record.run_id,
                to_i64(record.generation),
                to_i64(record.committed_at_ms),
                result_json,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn prune_history(&mut self, retention: Duration) -> Result<usize, PersistenceError> {
        let cutoff = to_i64(retention_cutoff_ms(retention));
        let removed = self.conn.execute(
            "DELETE FROM detection_history WHERE committed_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    fn reader(&self) -> Result<Box<dyn ActiveStateReader>, PersistenceError> {
        Ok(Box::new(SqliteActiveStateReader::open(&self.path)?))
    }
}

/// Read-only connection to an active state database.
pub struct SqliteActiveStateReader {
    conn: Connection,
}

impl SqliteActiveStateReader {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open_with_flags(
            db_path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }
}

impl ActiveStateReader for SqliteActiveStateReader {
    fn read(&self) -> Result<Option<ActiveStateRecord>, PersistenceError> {
        read_active(&self.conn)
    }

    fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, PersistenceError> {
        read_history(&self.conn, limit)
    }
}

struct ActiveRow {
    run_id: String,
    generation: i64,
    committed_at: i64,
    last_success_at: i64,
    consecutive_failures: i64,
    result_json: String,
    before_jpeg: Vec<u8>,
    before_digest: String,
    after_jpeg: Vec<u8>,
    after_digest: String,
}

fn read_active(conn: &Connection) -> Result<Option<ActiveStateRecord>, PersistenceError> {
    // One SELECT is one read transaction: both images come from the same commit.
    let row = conn
        .query_row(
            r#"
            SELECT run_id, generation, committed_at, last_success_at, consecutive_failures,
                   result_json, before_jpeg, before_digest, after_jpeg, after_digest
            FROM active_state WHERE id = 1
            "#,
            [],
            |row| {
                Ok(ActiveRow {
                    run_id: row.get(0)?,
                    generation: row.get(1)?,
                    committed_at: row.get(2)?,
                    last_success_at: row.get(3)?,
                    consecutive_failures: row.get(4)?,
                    result_json: row.get(5)?,
                    before_jpeg: row.get(6)?,
                    before_digest: row.get(7)?,
                    after_jpeg: row.get(8)?,
                    after_digest: row.get(9)?,
                })
            },
        )
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };
    let result: DetectionResult = serde_json::from_str(&row.result_json)?;
    let record = ActiveStateRecord {
        result,
        before_jpeg: row.before_jpeg,
        after_jpeg: row.after_jpeg,
        before_digest: row.before_digest,
        after_digest: row.after_digest,
        run_id: row.run_id,
        generation: from_i64(row.generation),
        last_success_timestamp_ms: from_i64(row.last_success_at),
        consecutive_failure_count: u32::try_from(row.consecutive_failures).unwrap_or(u32::MAX),
        committed_at_ms: from_i64(row.committed_at),
    };
    record.verify()?;
    Ok(Some(record))
}

fn read_history(conn: &Connection, limit: usize) -> Result<Vec<HistoryEntry>, PersistenceError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(
        r#"
        SELECT run_id, generation, committed_at, result_json
        FROM detection_history ORDER BY id DESC LIMIT ?1
        "#,
    )?;
    let mut rows = stmt.query(params![limit])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let result_json: String = row.get(3)?;
        out.push(HistoryEntry {
            run_id: row.get(0)?,
            generation: from_i64(row.get(1)?),
            committed_at_ms: from_i64(row.get(2)?),
            result: serde_json::from_str(&result_json)?,
        });
    }
    Ok(out)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(generation: u64) -> ActiveStateRecord {
        let result = DetectionResult {
            frame_sequence: generation,
            timestamp_ms: 10_000 + generation,
            missing: vec![format!("product_{generation}")],
            ..Default::default()
        };
        ActiveStateRecord::new(
            result,
            format!("before-{generation}").into_bytes(),
            format!("after-{generation}").into_bytes(),
            "run-sqlite",
            generation,
            generation as u32,
        )
    }

    #[test]
    fn commit_replaces_the_single_active_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SqliteActiveStateStore::open(dir.path().join("state.db")).unwrap();
        assert!(store.read().unwrap().is_none());

        store.commit(&record(1)).unwrap();
        store.commit(&record(2)).unwrap();

        let reader = store.reader().unwrap();
        let latest = reader.read().unwrap().unwrap();
        assert_eq!(latest.generation, 2);
        assert_eq!(latest.consecutive_failure_count, 2);
        assert_eq!(latest.before_jpeg, b"before-2");
        assert_eq!(latest.after_jpeg, b"after-2");
        assert_eq!(latest.result.missing, vec!["product_2".to_string()]);

        let history = reader.history(5).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].generation, 2);
        assert_eq!(history[1].generation, 1);
    }

    #[test]
    fn tampered_image_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let mut store = SqliteActiveStateStore::open(&path).unwrap();
        store.commit(&record(1)).unwrap();

        let conn = Connection::open(&path).unwrap();
        conn.execute("UPDATE active_state SET after_jpeg = x'00'", [])
            .unwrap();
        assert!(matches!(store.read(), Err(PersistenceError::Corrupt(_))));
    }

    #[test]
    fn prune_keeps_recent_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SqliteActiveStateStore::open(dir.path().join("state.db")).unwrap();
        let mut old = record(1);
        old.committed_at_ms = 1;
        store.commit(&old).unwrap();
        store.commit(&record(2)).unwrap();

        assert_eq!(store.prune_history(Duration::from_secs(60)).unwrap(), 1);
        let history = store.history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].generation, 2);
    }
}
