use chatloom_core::SyncOperation;
use rusqlite::{Row, params};

use crate::database::Database;
use crate::error::Result;
use crate::rows::{collect_rows, now_ms, parse_json_column};

/// A queued remote write, oldest first by `seq`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub seq: i64,
    pub operation: SyncOperation,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
}

pub struct SyncQueue<'db> {
    pub(crate) db: &'db mut Database,
}

impl SyncQueue<'_> {
    pub fn push(&mut self, operation: &SyncOperation) -> Result<i64> {
        self.db.conn.execute(
            "INSERT INTO sync_queue (op_type, payload, created_at_ms) VALUES (?1, ?2, ?3)",
            params![operation.kind(), serde_json::to_string(operation)?, now_ms()],
        )?;
        Ok(self.db.conn.last_insert_rowid())
    }

    pub fn pending(&self) -> Result<Vec<PendingOperation>> {
        let mut stmt = self.db.conn.prepare(
            "SELECT seq, payload, attempts, last_error, created_at_ms
             FROM sync_queue
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], row_to_pending)?;
        collect_rows(rows)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .db
            .conn
            .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn remove(&mut self, seq: i64) -> Result<()> {
        self.db
            .conn
            .execute("DELETE FROM sync_queue WHERE seq = ?1", params![seq])?;
        Ok(())
    }

    /// Put a rewritten operation back in place, keeping its position.
    pub fn replace(&mut self, seq: i64, operation: &SyncOperation) -> Result<()> {
        self.db.conn.execute(
            "UPDATE sync_queue SET op_type = ?2, payload = ?3 WHERE seq = ?1",
            params![seq, operation.kind(), serde_json::to_string(operation)?],
        )?;
        Ok(())
    }

    pub fn record_failure(&mut self, seq: i64, error: &str) -> Result<()> {
        self.db.conn.execute(
            "UPDATE sync_queue SET attempts = attempts + 1, last_error = ?2 WHERE seq = ?1",
            params![seq, error],
        )?;
        Ok(())
    }
}

fn row_to_pending(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
    Ok(PendingOperation {
        seq: row.get(0)?,
        operation: parse_json_column(row, 1)?,
        attempts: row.get(2)?,
        last_error: row.get(3)?,
        created_at_ms: row.get(4)?,
    })
}
