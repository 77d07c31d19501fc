use crate::schema::open_connection;
use infostore_lib::{ContextId, IdGenerator, InfostoreError, InfostoreResult};
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

/// Per-context id sequences kept in their own database file.
///
/// Every allocation is a short IMMEDIATE transaction of its own, so it never
/// waits on (or holds back) the write transaction of the request asking for it.
pub struct DbIdGenerator {
    db_path: String,
    conn: Mutex<Connection>,
}

impl DbIdGenerator {
    pub fn new(db_path: &str) -> InfostoreResult<Self> {
        let conn = open_connection(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sequences (
                cid INTEGER NOT NULL,
                kind TEXT NOT NULL,
                next_id INTEGER NOT NULL,
                PRIMARY KEY (cid, kind)
            ) WITHOUT ROWID;",
        )
        .map_err(|e| InfostoreError::db("create sequences table failed", e))?;
        debug!("DbIdGenerator: opened {}", db_path);
        Ok(Self {
            db_path: db_path.to_string(),
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn allocate(conn: &mut Connection, context_id: ContextId, kind: &str) -> rusqlite::Result<i64> {
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let current: Option<i64> = tx
            .query_row(
                "SELECT next_id FROM sequences WHERE cid = ?1 AND kind = ?2",
                params![context_id, kind],
                |row| row.get(0),
            )
            .optional()?;
        let id = current.unwrap_or(1);
        tx.execute(
            "INSERT OR REPLACE INTO sequences (cid, kind, next_id) VALUES (?1, ?2, ?3)",
            params![context_id, kind, id + 1],
        )?;
        tx.commit()?;
        Ok(id)
    }
}

impl IdGenerator for DbIdGenerator {
    fn next_id(&self, context_id: ContextId, kind: &str) -> InfostoreResult<i64> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| InfostoreError::Internal(format!("id generator lock poisoned: {}", e)))?;
        Self::allocate(&mut conn, context_id, kind).map_err(|e| {
            warn!("DbIdGenerator: allocate {} id for context {} failed! {}", kind, context_id, e);
            InfostoreError::db("allocate id", e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ids_are_per_context_and_kind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("seq.db");
        let ids = DbIdGenerator::new(path.to_str().unwrap()).unwrap();

        assert_eq!(ids.next_id(1, "infostore").unwrap(), 1);
        assert_eq!(ids.next_id(1, "infostore").unwrap(), 2);
        assert_eq!(ids.next_id(2, "infostore").unwrap(), 1);
        assert_eq!(ids.next_id(1, "other").unwrap(), 1);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("seq.db");
        {
            let ids = DbIdGenerator::new(path.to_str().unwrap()).unwrap();
            ids.next_id(7, "infostore").unwrap();
            ids.next_id(7, "infostore").unwrap();
        }
        let ids = DbIdGenerator::new(path.to_str().unwrap()).unwrap();
        assert_eq!(ids.next_id(7, "infostore").unwrap(), 3);
    }
}
