use infostore_lib::{InfostoreError, InfostoreResult};
use rusqlite::{Connection, OpenFlags};

pub(crate) fn init_connection(conn: &Connection) -> InfostoreResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| InfostoreError::db("pragma failed", e))?;
    Ok(())
}

pub(crate) fn create_schema(conn: &Connection) -> InfostoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS documents (
            cid INTEGER NOT NULL,
            id INTEGER NOT NULL,
            folder_id INTEGER NOT NULL,
            version INTEGER NOT NULL,
            created_by INTEGER NOT NULL,
            creating_date INTEGER NOT NULL,
            changed_by INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            sequence_number INTEGER NOT NULL,
            PRIMARY KEY (cid, id)
        );
        CREATE INDEX IF NOT EXISTS idx_documents_folder ON documents(cid, folder_id);

        CREATE TABLE IF NOT EXISTS del_documents (
            cid INTEGER NOT NULL,
            id INTEGER NOT NULL,
            folder_id INTEGER NOT NULL,
            version INTEGER NOT NULL,
            created_by INTEGER NOT NULL,
            creating_date INTEGER NOT NULL,
            changed_by INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            sequence_number INTEGER NOT NULL,
            deleted_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_del_documents_folder ON del_documents(cid, folder_id);
        CREATE INDEX IF NOT EXISTS idx_del_documents_id ON del_documents(cid, id);

        CREATE TABLE IF NOT EXISTS document_versions (
            cid INTEGER NOT NULL,
            infostore_id INTEGER NOT NULL,
            version_number INTEGER NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            filename TEXT,
            mime_type TEXT,
            file_size INTEGER NOT NULL DEFAULT 0,
            checksum TEXT,
            location TEXT,
            version_comment TEXT NOT NULL DEFAULT '',
            created_by INTEGER NOT NULL,
            creating_date INTEGER NOT NULL,
            changed_by INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            PRIMARY KEY (cid, infostore_id, version_number)
        );
        CREATE INDEX IF NOT EXISTS idx_document_versions_location ON document_versions(cid, location);

        CREATE TABLE IF NOT EXISTS del_document_versions (
            cid INTEGER NOT NULL,
            infostore_id INTEGER NOT NULL,
            version_number INTEGER NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            filename TEXT,
            mime_type TEXT,
            file_size INTEGER NOT NULL DEFAULT 0,
            checksum TEXT,
            location TEXT,
            version_comment TEXT NOT NULL DEFAULT '',
            created_by INTEGER NOT NULL,
            creating_date INTEGER NOT NULL,
            changed_by INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            deleted_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_del_document_versions_id ON del_document_versions(cid, infostore_id);

        CREATE TABLE IF NOT EXISTS object_permissions (
            cid INTEGER NOT NULL,
            document_id INTEGER NOT NULL,
            folder_id INTEGER NOT NULL,
            permission_id INTEGER NOT NULL,
            group_flag INTEGER NOT NULL,
            bits INTEGER NOT NULL,
            PRIMARY KEY (cid, document_id, permission_id, group_flag)
        );
        CREATE INDEX IF NOT EXISTS idx_object_permissions_entity ON object_permissions(cid, permission_id);",
    )
    .map_err(|e| InfostoreError::db("create schema failed", e))?;
    Ok(())
}

pub(crate) fn open_connection(db_path: &str) -> InfostoreResult<Connection> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )
    .map_err(|e| InfostoreError::db(format!("open db {} failed", db_path), e))?;
    init_connection(&conn)?;
    Ok(conn)
}

/// A fresh connection with the write lock already taken.
pub(crate) fn open_txn_connection(db_path: &str) -> InfostoreResult<Connection> {
    let conn = open_connection(db_path)?;
    // BEGIN IMMEDIATE takes the write lock up front, so no SQLITE_BUSY halfway through a save
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| InfostoreError::db("begin txn failed", e))?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_schema_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("schema.db");
        let conn = open_connection(path.to_str().unwrap()).unwrap();
        create_schema(&conn).unwrap();
        create_schema(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('documents', 'del_documents', 'document_versions',
                              'del_document_versions', 'object_permissions')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }
}
