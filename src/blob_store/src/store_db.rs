use infostore_lib::{unix_timestamp_millis, InfostoreError, InfostoreResult, QuotaOwner};
use log::{debug, warn};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobState {
    /// Bytes are being written to the temporary file.
    Writing,
    Completed,
}

impl BlobState {
    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => BlobState::Completed,
            _ => BlobState::Writing,
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            BlobState::Writing => "writing",
            BlobState::Completed => "completed",
        }
    }
}

impl ToSql for BlobState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.to_str().into())
    }
}

impl FromSql for BlobState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str().unwrap_or("writing");
        Ok(BlobState::from_str(s))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobItem {
    pub location: String,
    pub owner: QuotaOwner,
    pub size: u64,
    pub checksum: Option<String>,
    pub state: BlobState,
    pub create_time: i64,
    pub update_time: i64,
}

impl BlobItem {
    pub fn new_writing(location: &str, owner: QuotaOwner) -> Self {
        let now = unix_timestamp_millis();
        Self {
            location: location.to_string(),
            owner,
            size: 0,
            checksum: None,
            state: BlobState::Writing,
            create_time: now,
            update_time: now,
        }
    }
}

fn db_err(op: &str, e: rusqlite::Error) -> InfostoreError {
    warn!("BlobStoreDB: {} failed! {}", op, e);
    InfostoreError::db(format!("blob index {}", op), e)
}

/// Index of the blobs kept by one `LocalBlobStore`.
pub struct BlobStoreDB {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl BlobStoreDB {
    pub fn new(db_path: String) -> InfostoreResult<Self> {
        debug!("BlobStoreDB: new db path: {}", db_path);
        let conn = Connection::open(&db_path).map_err(|e| db_err("open", e))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS blob_items (
                location TEXT PRIMARY KEY,
                context_id INTEGER NOT NULL,
                owner_id INTEGER NOT NULL,
                blob_size INTEGER NOT NULL,
                checksum TEXT,
                blob_state TEXT NOT NULL,
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_blob_items_owner ON blob_items(context_id, owner_id);",
        )
        .map_err(|e| db_err("create table blob_items", e))?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> InfostoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| InfostoreError::Internal(format!("blob index lock poisoned: {}", e)))
    }

    pub fn set_blob_item(&self, item: &BlobItem) -> InfostoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO blob_items
             (location, context_id, owner_id, blob_size, checksum, blob_state, create_time, update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                item.location,
                item.owner.context_id,
                item.owner.owner_id,
                item.size as i64,
                item.checksum,
                item.state,
                item.create_time,
                item.update_time,
            ],
        )
        .map_err(|e| db_err("insert blob", e))?;
        Ok(())
    }

    /// Look up a blob of `owner`; blobs of other owners are invisible.
    pub fn get_blob_item(&self, owner: &QuotaOwner, location: &str) -> InfostoreResult<Option<BlobItem>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT blob_size, checksum, blob_state, create_time, update_time
             FROM blob_items WHERE location = ?1 AND context_id = ?2 AND owner_id = ?3",
            params![location, owner.context_id, owner.owner_id],
            |row| {
                Ok(BlobItem {
                    location: location.to_string(),
                    owner: *owner,
                    size: row.get::<_, i64>(0)? as u64,
                    checksum: row.get(1)?,
                    state: row.get(2)?,
                    create_time: row.get(3)?,
                    update_time: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| db_err("get blob", e))
    }

    pub fn update_blob_size(
        &self,
        owner: &QuotaOwner,
        location: &str,
        size: u64,
        checksum: Option<&str>,
    ) -> InfostoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE blob_items SET blob_size = ?1, checksum = ?2, update_time = ?3
             WHERE location = ?4 AND context_id = ?5 AND owner_id = ?6",
            params![
                size as i64,
                checksum,
                unix_timestamp_millis(),
                location,
                owner.context_id,
                owner.owner_id
            ],
        )
        .map_err(|e| db_err("update blob size", e))?;
        Ok(())
    }

    pub fn remove_blob_item(&self, owner: &QuotaOwner, location: &str) -> InfostoreResult<bool> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM blob_items WHERE location = ?1 AND context_id = ?2 AND owner_id = ?3",
                params![location, owner.context_id, owner.owner_id],
            )
            .map_err(|e| db_err("delete blob", e))?;
        Ok(removed > 0)
    }

    pub fn remove_blob_items(&self, owner: &QuotaOwner, locations: &[String]) -> InfostoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| db_err("transaction", e))?;
        let mut removed = 0usize;
        {
            let mut stmt = tx
                .prepare(
                    "DELETE FROM blob_items WHERE location = ?1 AND context_id = ?2 AND owner_id = ?3",
                )
                .map_err(|e| db_err("prepare delete blobs", e))?;
            for location in locations {
                removed += stmt
                    .execute(params![location, owner.context_id, owner.owner_id])
                    .map_err(|e| db_err("delete blobs", e))?;
            }
        }
        tx.commit().map_err(|e| db_err("commit", e))?;
        Ok(removed)
    }

    pub fn usage(&self, owner: &QuotaOwner) -> InfostoreResult<u64> {
        let conn = self.conn()?;
        let used: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(blob_size), 0) FROM blob_items
                 WHERE context_id = ?1 AND owner_id = ?2 AND blob_state = ?3",
                params![owner.context_id, owner.owner_id, BlobState::Completed],
                |row| row.get(0),
            )
            .map_err(|e| db_err("sum usage", e))?;
        Ok(used.max(0) as u64)
    }

    /// Blobs that never left the writing state and were last touched before `before`.
    pub fn list_stale_writing(&self, before: i64) -> InfostoreResult<Vec<BlobItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT location, context_id, owner_id, blob_size, checksum, blob_state, create_time, update_time
                 FROM blob_items WHERE blob_state = ?1 AND update_time < ?2",
            )
            .map_err(|e| db_err("prepare stale query", e))?;
        let rows = stmt
            .query_map(params![BlobState::Writing, before], |row| {
                Ok(BlobItem {
                    location: row.get(0)?,
                    owner: QuotaOwner::new(row.get(1)?, row.get(2)?),
                    size: row.get::<_, i64>(3)? as u64,
                    checksum: row.get(4)?,
                    state: row.get(5)?,
                    create_time: row.get(6)?,
                    update_time: row.get(7)?,
                })
            })
            .map_err(|e| db_err("stale query", e))?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(|e| db_err("read row", e))?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_blob_item_roundtrip_and_usage() {
        let dir = tempdir().unwrap();
        let db = BlobStoreDB::new(dir.path().join("blobs.db").to_string_lossy().to_string()).unwrap();
        let owner = QuotaOwner::new(1, 5);

        let mut item = BlobItem::new_writing("aa01", owner);
        db.set_blob_item(&item).unwrap();
        assert_eq!(db.usage(&owner).unwrap(), 0);

        item.size = 12;
        item.state = BlobState::Completed;
        item.checksum = Some("abc".to_string());
        db.set_blob_item(&item).unwrap();
        assert_eq!(db.usage(&owner).unwrap(), 12);

        let loaded = db.get_blob_item(&owner, "aa01").unwrap().unwrap();
        assert_eq!(loaded.state, BlobState::Completed);
        assert_eq!(loaded.checksum.as_deref(), Some("abc"));

        // another owner never sees the blob
        assert!(db.get_blob_item(&QuotaOwner::context(1), "aa01").unwrap().is_none());

        assert!(db.remove_blob_item(&owner, "aa01").unwrap());
        assert!(!db.remove_blob_item(&owner, "aa01").unwrap());
        assert_eq!(db.usage(&owner).unwrap(), 0);
    }

    #[test]
    fn test_list_stale_writing() {
        let dir = tempdir().unwrap();
        let db = BlobStoreDB::new(dir.path().join("blobs.db").to_string_lossy().to_string()).unwrap();
        let owner = QuotaOwner::context(1);

        let mut item = BlobItem::new_writing("bb01", owner);
        item.update_time = 10;
        db.set_blob_item(&item).unwrap();

        let stale = db.list_stale_writing(100).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].location, "bb01");
        assert!(db.list_stale_writing(5).unwrap().is_empty());
    }
}
