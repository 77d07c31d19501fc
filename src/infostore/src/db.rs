//! Read queries over the document tables.
//!
//! A document is its head row joined to one version row; the head's
//! `version` column picks the current one.

use infostore_lib::{
    filename_key, map_db_err, ContextId, DocumentId, DocumentMetadata, EntityId, Field, FolderId,
    InfostoreResult, ObjectPermission, Session, SortDirection, CURRENT_VERSION,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Range;

const DOCUMENT_COLUMNS: &str = "d.id, d.folder_id, v.version_number, d.created_by, d.creating_date,
    d.changed_by, d.last_modified, d.sequence_number, v.title, v.url, v.description, v.filename,
    v.mime_type, v.file_size, v.checksum, v.location, v.version_comment, v.changed_by, v.last_modified";

const CURRENT_JOIN: &str = "FROM documents d JOIN document_versions v
    ON v.cid = d.cid AND v.infostore_id = d.id AND v.version_number = d.version";

/// `?, ?, ?` for `n` values.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub(crate) fn id_values(context_id: ContextId, ids: &[DocumentId]) -> Vec<Value> {
    let mut values = Vec::with_capacity(ids.len() + 1);
    values.push(Value::Integer(context_id));
    values.extend(ids.iter().map(|id| Value::Integer(*id)));
    values
}

/// Map a row selected with `DOCUMENT_COLUMNS`. With `version_audit` the
/// modifier fields come from the version row instead of the head.
fn map_document(row: &Row<'_>, version_audit: bool) -> rusqlite::Result<DocumentMetadata> {
    let mut doc = DocumentMetadata {
        id: row.get(0)?,
        folder_id: row.get(1)?,
        version: row.get(2)?,
        created_by: row.get(3)?,
        creation_date: row.get(4)?,
        modified_by: row.get(5)?,
        last_modified: row.get(6)?,
        sequence_number: row.get(7)?,
        title: row.get(8)?,
        url: row.get(9)?,
        description: row.get(10)?,
        filename: row.get(11)?,
        file_mime_type: row.get(12)?,
        file_size: row.get::<_, i64>(13)?.max(0) as u64,
        checksum: row.get(14)?,
        filestore_location: row.get(15)?,
        version_comment: row.get(16)?,
        ..DocumentMetadata::default()
    };
    if version_audit {
        doc.modified_by = row.get(17)?;
        doc.last_modified = row.get(18)?;
    }
    Ok(doc)
}

fn collect_documents(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
    version_audit: bool,
) -> InfostoreResult<Vec<DocumentMetadata>> {
    let mut stmt = conn.prepare(sql).map_err(map_db_err)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), |row| map_document(row, version_audit))
        .map_err(map_db_err)?;
    let mut docs = Vec::new();
    for row in rows {
        docs.push(row.map_err(map_db_err)?);
    }
    Ok(docs)
}

/// Load one document at `version`, or at its current version for `CURRENT_VERSION`.
pub(crate) fn load_document(
    conn: &Connection,
    context_id: ContextId,
    id: DocumentId,
    version: i32,
) -> InfostoreResult<Option<DocumentMetadata>> {
    if version == CURRENT_VERSION {
        let sql = format!(
            "SELECT {} {} WHERE d.cid = ?1 AND d.id = ?2",
            DOCUMENT_COLUMNS, CURRENT_JOIN
        );
        return conn
            .query_row(&sql, params![context_id, id], |row| map_document(row, false))
            .optional()
            .map_err(map_db_err);
    }

    let sql = format!(
        "SELECT {} FROM documents d JOIN document_versions v
            ON v.cid = d.cid AND v.infostore_id = d.id
         WHERE d.cid = ?1 AND d.id = ?2 AND v.version_number = ?3",
        DOCUMENT_COLUMNS
    );
    conn.query_row(&sql, params![context_id, id, version], |row| {
        map_document(row, true)
    })
    .optional()
    .map_err(map_db_err)
}

pub(crate) fn load_documents(
    conn: &Connection,
    context_id: ContextId,
    ids: &[DocumentId],
) -> InfostoreResult<Vec<DocumentMetadata>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} {} WHERE d.cid = ? AND d.id IN ({}) ORDER BY d.id",
        DOCUMENT_COLUMNS,
        CURRENT_JOIN,
        placeholders(ids.len())
    );
    collect_documents(conn, &sql, id_values(context_id, ids), false)
}

fn sort_column(field: Field) -> &'static str {
    match field {
        Field::Title => "v.title COLLATE NOCASE",
        Field::Filename => "v.filename COLLATE NOCASE",
        Field::FileSize => "v.file_size",
        Field::FileMimeType => "v.mime_type",
        Field::CreationDate => "d.creating_date",
        Field::LastModified => "d.last_modified",
        Field::SequenceNumber => "d.sequence_number",
        Field::Version => "d.version",
        _ => "d.id",
    }
}

/// One folder listing: its filter and sort order.
#[derive(Clone, Debug)]
pub(crate) struct FolderQuery {
    pub context_id: ContextId,
    pub folder_id: FolderId,
    pub sort: Option<Field>,
    pub direction: SortDirection,
    /// Only documents this entity created.
    pub created_by: Option<EntityId>,
}

impl FolderQuery {
    pub fn new(context_id: ContextId, folder_id: FolderId) -> Self {
        Self {
            context_id,
            folder_id,
            sort: None,
            direction: SortDirection::Ascending,
            created_by: None,
        }
    }

    pub fn sorted(mut self, sort: Option<Field>, direction: SortDirection) -> Self {
        self.sort = sort;
        self.direction = direction;
        self
    }

    pub fn created_by(mut self, entity: EntityId) -> Self {
        self.created_by = Some(entity);
        self
    }

    /// `FROM .. WHERE .. ORDER BY .. [LIMIT .. OFFSET ..]` and its values.
    fn tail(&self, range: Option<&Range<usize>>) -> (String, Vec<Value>) {
        let order = match self.direction {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        };
        let mut sql = format!("{} WHERE d.cid = ? AND d.folder_id = ?", CURRENT_JOIN);
        let mut values = vec![Value::Integer(self.context_id), Value::Integer(self.folder_id)];
        if let Some(entity) = self.created_by {
            sql.push_str(" AND d.created_by = ?");
            values.push(Value::Integer(entity));
        }
        sql.push_str(&format!(
            " ORDER BY {} {}, d.id ASC",
            sort_column(self.sort.unwrap_or(Field::Id)),
            order
        ));
        if let Some(range) = range {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(Value::Integer(range.end.saturating_sub(range.start) as i64));
            values.push(Value::Integer(range.start as i64));
        }
        (sql, values)
    }
}

pub(crate) fn list_folder(
    conn: &Connection,
    query: &FolderQuery,
    range: Option<Range<usize>>,
) -> InfostoreResult<Vec<DocumentMetadata>> {
    let (tail, values) = query.tail(range.as_ref());
    let sql = format!("SELECT {} {}", DOCUMENT_COLUMNS, tail);
    collect_documents(conn, &sql, values, false)
}

/// Highest sequence number among the documents a listing of `range` returns.
pub(crate) fn folder_sequence_number(
    conn: &Connection,
    query: &FolderQuery,
    range: Option<Range<usize>>,
) -> InfostoreResult<i64> {
    let (tail, values) = query.tail(range.as_ref());
    let sql = format!(
        "SELECT COALESCE(MAX(sequence_number), 0) FROM (SELECT d.sequence_number {})",
        tail
    );
    conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
        .map_err(map_db_err)
}

/// Documents carrying an object permission that addresses the session.
pub(crate) fn list_shared_with(
    conn: &Connection,
    session: &Session,
) -> InfostoreResult<Vec<DocumentMetadata>> {
    let mut values = vec![Value::Integer(session.context_id), Value::Integer(session.user_id)];
    let mut group_clause = String::new();
    if !session.groups.is_empty() {
        group_clause = format!(
            " OR (p.group_flag = 1 AND p.permission_id IN ({}))",
            placeholders(session.groups.len())
        );
        values.extend(session.groups.iter().map(|g| Value::Integer(*g)));
    }
    let sql = format!(
        "SELECT {} {} WHERE d.cid = ?1 AND d.id IN (
            SELECT p.document_id FROM object_permissions p
            WHERE p.cid = ?1 AND ((p.group_flag = 0 AND p.permission_id = ?2){}))
         ORDER BY d.id",
        DOCUMENT_COLUMNS, CURRENT_JOIN, group_clause
    );
    // anonymous parameters are numbered on from ?2
    collect_documents(conn, &sql, values, false)
}

/// Every live version with content, newest first.
pub(crate) fn list_versions(
    conn: &Connection,
    context_id: ContextId,
    id: DocumentId,
) -> InfostoreResult<Vec<DocumentMetadata>> {
    let sql = format!(
        "SELECT {} FROM documents d JOIN document_versions v
            ON v.cid = d.cid AND v.infostore_id = d.id
         WHERE d.cid = ? AND d.id = ? AND v.version_number > 0
         ORDER BY v.version_number DESC",
        DOCUMENT_COLUMNS
    );
    collect_documents(
        conn,
        &sql,
        vec![Value::Integer(context_id), Value::Integer(id)],
        true,
    )
}

pub(crate) fn version_numbers(
    conn: &Connection,
    context_id: ContextId,
    id: DocumentId,
) -> InfostoreResult<Vec<i32>> {
    let mut stmt = conn
        .prepare(
            "SELECT version_number FROM document_versions
             WHERE cid = ?1 AND infostore_id = ?2 ORDER BY version_number",
        )
        .map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![context_id, id], |row| row.get::<_, i32>(0))
        .map_err(map_db_err)?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row.map_err(map_db_err)?);
    }
    Ok(versions)
}

/// Highest version number the document ever had, deleted versions included.
pub(crate) fn max_version(
    conn: &Connection,
    context_id: ContextId,
    id: DocumentId,
) -> InfostoreResult<i32> {
    conn.query_row(
        "SELECT MAX(
            COALESCE((SELECT MAX(version_number) FROM document_versions
                      WHERE cid = ?1 AND infostore_id = ?2), 0),
            COALESCE((SELECT MAX(version_number) FROM del_document_versions
                      WHERE cid = ?1 AND infostore_id = ?2), 0))",
        params![context_id, id],
        |row| row.get(0),
    )
    .map_err(map_db_err)
}

/// Committed filenames of a folder, keyed the way uniqueness is compared.
pub(crate) fn occupied_names(
    conn: &Connection,
    context_id: ContextId,
    folder_id: FolderId,
) -> InfostoreResult<BTreeMap<String, DocumentId>> {
    let sql = format!(
        "SELECT d.id, v.filename {} WHERE d.cid = ?1 AND d.folder_id = ?2 AND v.filename IS NOT NULL",
        CURRENT_JOIN
    );
    let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![context_id, folder_id], |row| {
            Ok((row.get::<_, DocumentId>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(map_db_err)?;
    let mut names = BTreeMap::new();
    for row in rows {
        let (id, filename) = row.map_err(map_db_err)?;
        names.insert(filename_key(&filename), id);
    }
    Ok(names)
}

pub(crate) fn count_documents(
    conn: &Connection,
    context_id: ContextId,
    folder_id: Option<FolderId>,
) -> InfostoreResult<u64> {
    let count: i64 = match folder_id {
        Some(folder_id) => conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE cid = ?1 AND folder_id = ?2",
            params![context_id, folder_id],
            |row| row.get(0),
        ),
        None => conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE cid = ?1",
            params![context_id],
            |row| row.get(0),
        ),
    }
    .map_err(map_db_err)?;
    Ok(count.max(0) as u64)
}

pub(crate) fn exists(conn: &Connection, context_id: ContextId, id: DocumentId) -> InfostoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM documents WHERE cid = ?1 AND id = ?2",
            params![context_id, id],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_db_err)?;
    Ok(found.is_some())
}

pub(crate) fn ids_in_folder(
    conn: &Connection,
    context_id: ContextId,
    folder_id: FolderId,
) -> InfostoreResult<Vec<DocumentId>> {
    let mut stmt = conn
        .prepare("SELECT id FROM documents WHERE cid = ?1 AND folder_id = ?2 ORDER BY id")
        .map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![context_id, folder_id], |row| row.get(0))
        .map_err(map_db_err)?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row.map_err(map_db_err)?);
    }
    Ok(ids)
}

pub(crate) fn object_permissions(
    conn: &Connection,
    context_id: ContextId,
    id: DocumentId,
) -> InfostoreResult<Vec<ObjectPermission>> {
    let mut stmt = conn
        .prepare(
            "SELECT permission_id, group_flag, bits FROM object_permissions
             WHERE cid = ?1 AND document_id = ?2 ORDER BY group_flag, permission_id",
        )
        .map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![context_id, id], |row| {
            Ok(ObjectPermission::new(
                row.get(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get::<_, i64>(2)? as u8,
            ))
        })
        .map_err(map_db_err)?;
    let mut permissions = Vec::new();
    for row in rows {
        permissions.push(row.map_err(map_db_err)?);
    }
    Ok(permissions)
}

/// Users (not groups) holding an object permission on any of `ids`.
pub(crate) fn permission_grantees(
    conn: &Connection,
    context_id: ContextId,
    ids: &[DocumentId],
) -> InfostoreResult<BTreeSet<EntityId>> {
    if ids.is_empty() {
        return Ok(BTreeSet::new());
    }
    let sql = format!(
        "SELECT DISTINCT permission_id FROM object_permissions
         WHERE cid = ? AND group_flag = 0 AND document_id IN ({})",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
    let rows = stmt
        .query_map(params_from_iter(id_values(context_id, ids).iter()), |row| {
            row.get::<_, EntityId>(0)
        })
        .map_err(map_db_err)?;
    let mut grantees = BTreeSet::new();
    for row in rows {
        grantees.insert(row.map_err(map_db_err)?);
    }
    Ok(grantees)
}

/// Number of object permissions still held by one user.
pub(crate) fn permission_count(
    conn: &Connection,
    context_id: ContextId,
    entity: EntityId,
) -> InfostoreResult<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM object_permissions
             WHERE cid = ?1 AND permission_id = ?2 AND group_flag = 0",
            params![context_id, entity],
            |row| row.get(0),
        )
        .map_err(map_db_err)?;
    Ok(count.max(0) as u64)
}

/// The subset of `locations` still referenced by a live version row.
pub(crate) fn referenced_locations(
    conn: &Connection,
    context_id: ContextId,
    locations: &[String],
) -> InfostoreResult<HashSet<String>> {
    if locations.is_empty() {
        return Ok(HashSet::new());
    }
    let sql = format!(
        "SELECT DISTINCT location FROM document_versions WHERE cid = ? AND location IN ({})",
        placeholders(locations.len())
    );
    let mut values = vec![Value::Integer(context_id)];
    values.extend(locations.iter().map(|l| Value::Text(l.clone())));
    let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))
        .map_err(map_db_err)?;
    let mut referenced = HashSet::new();
    for row in rows {
        referenced.insert(row.map_err(map_db_err)?);
    }
    Ok(referenced)
}

/// `(version, location)` of every live version with content.
pub(crate) fn version_locations(
    conn: &Connection,
    context_id: ContextId,
    ids: &[DocumentId],
) -> InfostoreResult<Vec<(DocumentId, i32, String)>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT infostore_id, version_number, location FROM document_versions
         WHERE cid = ? AND location IS NOT NULL AND infostore_id IN ({})",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
    let rows = stmt
        .query_map(params_from_iter(id_values(context_id, ids).iter()), |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .map_err(map_db_err)?;
    let mut locations = Vec::new();
    for row in rows {
        locations.push(row.map_err(map_db_err)?);
    }
    Ok(locations)
}

/// Live documents of a folder changed after `since`.
pub(crate) fn changed_since(
    conn: &Connection,
    context_id: ContextId,
    folder_id: FolderId,
    since: i64,
) -> InfostoreResult<Vec<DocumentMetadata>> {
    let sql = format!(
        "SELECT {} {} WHERE d.cid = ? AND d.folder_id = ? AND d.sequence_number > ? ORDER BY d.id",
        DOCUMENT_COLUMNS, CURRENT_JOIN
    );
    collect_documents(
        conn,
        &sql,
        vec![
            Value::Integer(context_id),
            Value::Integer(folder_id),
            Value::Integer(since),
        ],
        false,
    )
}

/// Tombstones of a folder written after `since`, newest per document, minus
/// documents that are live in the folder again.
pub(crate) fn tombstones_since(
    conn: &Connection,
    context_id: ContextId,
    folder_id: FolderId,
    since: i64,
) -> InfostoreResult<Vec<DocumentMetadata>> {
    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.folder_id, t.version, t.created_by, t.creating_date, t.changed_by,
                    t.last_modified, MAX(t.sequence_number),
                    COALESCE(
                        (SELECT v.filename FROM document_versions v
                         WHERE v.cid = t.cid AND v.infostore_id = t.id AND v.version_number = t.version),
                        (SELECT dv.filename FROM del_document_versions dv
                         WHERE dv.cid = t.cid AND dv.infostore_id = t.id AND dv.version_number = t.version
                         ORDER BY dv.deleted_at DESC LIMIT 1)),
                    COALESCE(
                        (SELECT v.title FROM document_versions v
                         WHERE v.cid = t.cid AND v.infostore_id = t.id AND v.version_number = t.version),
                        (SELECT dv.title FROM del_document_versions dv
                         WHERE dv.cid = t.cid AND dv.infostore_id = t.id AND dv.version_number = t.version
                         ORDER BY dv.deleted_at DESC LIMIT 1), '')
             FROM del_documents t
             WHERE t.cid = ?1 AND t.folder_id = ?2 AND t.sequence_number > ?3
               AND NOT EXISTS (SELECT 1 FROM documents d
                               WHERE d.cid = t.cid AND d.id = t.id AND d.folder_id = t.folder_id)
             GROUP BY t.id
             ORDER BY t.id",
        )
        .map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![context_id, folder_id, since], |row| {
            Ok(DocumentMetadata {
                id: row.get(0)?,
                folder_id: row.get(1)?,
                version: row.get(2)?,
                created_by: row.get(3)?,
                creation_date: row.get(4)?,
                modified_by: row.get(5)?,
                last_modified: row.get(6)?,
                sequence_number: row.get(7)?,
                filename: row.get(8)?,
                title: row.get(9)?,
                ..DocumentMetadata::default()
            })
        })
        .map_err(map_db_err)?;
    let mut docs = Vec::new();
    for row in rows {
        docs.push(row.map_err(map_db_err)?);
    }
    Ok(docs)
}

/// Number of tombstones written for one document.
pub(crate) fn tombstone_count(
    conn: &Connection,
    context_id: ContextId,
    id: DocumentId,
) -> InfostoreResult<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM del_documents WHERE cid = ?1 AND id = ?2",
            params![context_id, id],
            |row| row.get(0),
        )
        .map_err(map_db_err)?;
    Ok(count.max(0) as u64)
}

pub(crate) fn latest_tombstone_time(
    conn: &Connection,
    context_id: ContextId,
    id: DocumentId,
) -> InfostoreResult<Option<i64>> {
    conn.query_row(
        "SELECT MAX(deleted_at) FROM del_documents WHERE cid = ?1 AND id = ?2",
        params![context_id, id],
        |row| row.get(0),
    )
    .map_err(map_db_err)
}
