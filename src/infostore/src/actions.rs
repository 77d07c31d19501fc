//! Structural mutations of the document tables.
//!
//! Each action runs inside its own savepoint: it either applies completely or
//! leaves the enclosing transaction as it found it.

use crate::db::{id_values, placeholders};
use infostore_lib::{
    ContextId, DocumentId, DocumentMetadata, EntityId, FolderId, InfostoreError, InfostoreResult,
    ObjectPermission, PLACEHOLDER_VERSION,
};
use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};

pub(crate) trait SqlAction {
    fn name(&self) -> &'static str;

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize>;
}

/// Run `action` in a savepoint, undoing its partial effects on failure.
pub(crate) fn perform(conn: &Connection, action: &dyn SqlAction) -> InfostoreResult<usize> {
    conn.execute_batch("SAVEPOINT infostore_action")
        .map_err(|e| InfostoreError::db(format!("{}: savepoint failed", action.name()), e))?;
    match action.execute(conn) {
        Ok(changed) => {
            conn.execute_batch("RELEASE infostore_action").map_err(|e| {
                InfostoreError::db(format!("{}: release failed", action.name()), e)
            })?;
            debug!("action {} changed {} rows", action.name(), changed);
            Ok(changed)
        }
        Err(e) => {
            warn!("action {} failed, undoing! {}", action.name(), e);
            if let Err(undo) =
                conn.execute_batch("ROLLBACK TO infostore_action; RELEASE infostore_action")
            {
                warn!("action {} undo failed! {}", action.name(), undo);
            }
            Err(InfostoreError::db(action.name(), e))
        }
    }
}

fn insert_version_row(
    conn: &Connection,
    context_id: ContextId,
    doc: &DocumentMetadata,
    version: i32,
    with_content: bool,
) -> rusqlite::Result<usize> {
    let (size, checksum, location) = if with_content {
        (
            doc.file_size as i64,
            doc.checksum.clone(),
            doc.filestore_location.clone(),
        )
    } else {
        (0, None, None)
    };
    conn.execute(
        "INSERT INTO document_versions
         (cid, infostore_id, version_number, title, url, description, filename, mime_type,
          file_size, checksum, location, version_comment, created_by, creating_date,
          changed_by, last_modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            context_id,
            doc.id,
            version,
            doc.title,
            doc.url,
            doc.description,
            doc.filename,
            doc.file_mime_type,
            size,
            checksum,
            location,
            doc.version_comment,
            doc.modified_by,
            doc.last_modified,
            doc.modified_by,
            doc.last_modified,
        ],
    )
}

fn insert_permissions(
    conn: &Connection,
    context_id: ContextId,
    id: DocumentId,
    folder_id: FolderId,
    permissions: &[ObjectPermission],
) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO object_permissions
         (cid, document_id, folder_id, permission_id, group_flag, bits)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    let mut inserted = 0;
    for permission in permissions {
        inserted += stmt.execute(params![
            context_id,
            id,
            folder_id,
            permission.entity,
            permission.group as i64,
            permission.bits as i64
        ])?;
    }
    Ok(inserted)
}

/// New head plus its content-less placeholder version.
pub(crate) struct InsertDocument<'a> {
    pub context_id: ContextId,
    pub doc: &'a DocumentMetadata,
}

impl SqlAction for InsertDocument<'_> {
    fn name(&self) -> &'static str {
        "insert document"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let doc = self.doc;
        let mut changed = conn.execute(
            "INSERT INTO documents
             (cid, id, folder_id, version, created_by, creating_date, changed_by,
              last_modified, sequence_number)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                self.context_id,
                doc.id,
                doc.folder_id,
                PLACEHOLDER_VERSION,
                doc.created_by,
                doc.creation_date,
                doc.modified_by,
                doc.last_modified,
                doc.sequence_number
            ],
        )?;
        changed += insert_version_row(conn, self.context_id, doc, PLACEHOLDER_VERSION, false)?;
        if let Some(permissions) = doc.object_permissions.as_ref() {
            changed += insert_permissions(conn, self.context_id, doc.id, doc.folder_id, permissions)?;
        }
        Ok(changed)
    }
}

/// A version row carrying the document's content fields; the head moves to it.
pub(crate) struct InsertVersion<'a> {
    pub context_id: ContextId,
    pub doc: &'a DocumentMetadata,
}

impl SqlAction for InsertVersion<'_> {
    fn name(&self) -> &'static str {
        "insert version"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let mut changed = insert_version_row(conn, self.context_id, self.doc, self.doc.version, true)?;
        changed += conn.execute(
            "UPDATE documents SET version = ?1 WHERE cid = ?2 AND id = ?3",
            params![self.doc.version, self.context_id, self.doc.id],
        )?;
        Ok(changed)
    }
}

/// Write head columns and the descriptive fields of the current version and
/// of the placeholder mirror. Content fields are left to `SetVersionContent`.
pub(crate) struct UpdateDocument<'a> {
    pub context_id: ContextId,
    pub doc: &'a DocumentMetadata,
}

impl SqlAction for UpdateDocument<'_> {
    fn name(&self) -> &'static str {
        "update document"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let doc = self.doc;
        let mut changed = conn.execute(
            "UPDATE documents SET folder_id = ?1, version = ?2, changed_by = ?3,
                last_modified = ?4, sequence_number = ?5
             WHERE cid = ?6 AND id = ?7",
            params![
                doc.folder_id,
                doc.version,
                doc.modified_by,
                doc.last_modified,
                doc.sequence_number,
                self.context_id,
                doc.id
            ],
        )?;
        let mut versions = vec![PLACEHOLDER_VERSION];
        if doc.version != PLACEHOLDER_VERSION {
            versions.push(doc.version);
        }
        for version in versions {
            changed += conn.execute(
                "UPDATE document_versions SET title = ?1, url = ?2, description = ?3,
                    filename = ?4, mime_type = ?5, version_comment = ?6,
                    changed_by = ?7, last_modified = ?8
                 WHERE cid = ?9 AND infostore_id = ?10 AND version_number = ?11",
                params![
                    doc.title,
                    doc.url,
                    doc.description,
                    doc.filename,
                    doc.file_mime_type,
                    doc.version_comment,
                    doc.modified_by,
                    doc.last_modified,
                    self.context_id,
                    doc.id,
                    version
                ],
            )?;
        }
        Ok(changed)
    }
}

/// Copy heads into `del_documents` before they are moved or removed.
pub(crate) struct TombstoneDocuments<'a> {
    pub context_id: ContextId,
    pub ids: &'a [DocumentId],
    pub deleted_at: i64,
    pub sequence_number: i64,
}

impl SqlAction for TombstoneDocuments<'_> {
    fn name(&self) -> &'static str {
        "tombstone documents"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        if self.ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO del_documents
             (cid, id, folder_id, version, created_by, creating_date, changed_by,
              last_modified, sequence_number, deleted_at)
             SELECT cid, id, folder_id, version, created_by, creating_date, changed_by,
                    last_modified, ?, ?
             FROM documents WHERE cid = ? AND id IN ({})",
            placeholders(self.ids.len())
        );
        let mut values = vec![
            Value::Integer(self.sequence_number),
            Value::Integer(self.deleted_at),
        ];
        values.extend(id_values(self.context_id, self.ids));
        conn.execute(&sql, params_from_iter(values.iter()))
    }
}

/// Tombstone and delete whole documents: versions, permissions, heads.
pub(crate) struct RemoveDocuments<'a> {
    pub context_id: ContextId,
    pub ids: &'a [DocumentId],
    pub deleted_at: i64,
    pub sequence_number: i64,
}

impl SqlAction for RemoveDocuments<'_> {
    fn name(&self) -> &'static str {
        "remove documents"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        if self.ids.is_empty() {
            return Ok(0);
        }
        let mut changed = TombstoneDocuments {
            context_id: self.context_id,
            ids: self.ids,
            deleted_at: self.deleted_at,
            sequence_number: self.sequence_number,
        }
        .execute(conn)?;

        let in_ids = placeholders(self.ids.len());
        let copy_versions = format!(
            "INSERT INTO del_document_versions
             (cid, infostore_id, version_number, title, url, description, filename, mime_type,
              file_size, checksum, location, version_comment, created_by, creating_date,
              changed_by, last_modified, deleted_at)
             SELECT cid, infostore_id, version_number, title, url, description, filename,
                    mime_type, file_size, checksum, location, version_comment, created_by,
                    creating_date, changed_by, last_modified, ?
             FROM document_versions WHERE cid = ? AND infostore_id IN ({})",
            in_ids
        );
        let mut values = vec![Value::Integer(self.deleted_at)];
        values.extend(id_values(self.context_id, self.ids));
        changed += conn.execute(&copy_versions, params_from_iter(values.iter()))?;

        let ids = id_values(self.context_id, self.ids);
        for table_and_column in [
            ("document_versions", "infostore_id"),
            ("object_permissions", "document_id"),
            ("documents", "id"),
        ] {
            let sql = format!(
                "DELETE FROM {} WHERE cid = ? AND {} IN ({})",
                table_and_column.0, table_and_column.1, in_ids
            );
            changed += conn.execute(&sql, params_from_iter(ids.iter()))?;
        }
        Ok(changed)
    }
}

/// Tombstone and delete selected version rows of one document.
pub(crate) struct RemoveVersions<'a> {
    pub context_id: ContextId,
    pub id: DocumentId,
    pub versions: &'a [i32],
    pub deleted_at: i64,
}

impl SqlAction for RemoveVersions<'_> {
    fn name(&self) -> &'static str {
        "remove versions"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        if self.versions.is_empty() {
            return Ok(0);
        }
        let in_versions = placeholders(self.versions.len());
        let mut values = vec![
            Value::Integer(self.deleted_at),
            Value::Integer(self.context_id),
            Value::Integer(self.id),
        ];
        values.extend(self.versions.iter().map(|v| Value::Integer(*v as i64)));
        let mut changed = conn.execute(
            &format!(
                "INSERT INTO del_document_versions
                 (cid, infostore_id, version_number, title, url, description, filename, mime_type,
                  file_size, checksum, location, version_comment, created_by, creating_date,
                  changed_by, last_modified, deleted_at)
                 SELECT cid, infostore_id, version_number, title, url, description, filename,
                        mime_type, file_size, checksum, location, version_comment, created_by,
                        creating_date, changed_by, last_modified, ?
                 FROM document_versions
                 WHERE cid = ? AND infostore_id = ? AND version_number IN ({})",
                in_versions
            ),
            params_from_iter(values.iter()),
        )?;
        changed += conn.execute(
            &format!(
                "DELETE FROM document_versions
                 WHERE cid = ? AND infostore_id = ? AND version_number IN ({})",
                in_versions
            ),
            params_from_iter(values.iter().skip(1)),
        )?;
        Ok(changed)
    }
}

/// Point the placeholder version's descriptive fields at `source`.
pub(crate) struct MirrorPlaceholder<'a> {
    pub context_id: ContextId,
    pub doc: &'a DocumentMetadata,
}

impl SqlAction for MirrorPlaceholder<'_> {
    fn name(&self) -> &'static str {
        "mirror placeholder"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let doc = self.doc;
        let mut changed = conn.execute(
            "UPDATE document_versions SET title = ?1, url = ?2, description = ?3,
                filename = ?4, mime_type = ?5, changed_by = ?6, last_modified = ?7
             WHERE cid = ?8 AND infostore_id = ?9 AND version_number = 0",
            params![
                doc.title,
                doc.url,
                doc.description,
                doc.filename,
                doc.file_mime_type,
                doc.modified_by,
                doc.last_modified,
                self.context_id,
                doc.id
            ],
        )?;
        changed += conn.execute(
            "UPDATE documents SET version = ?1, changed_by = ?2, last_modified = ?3,
                sequence_number = ?4
             WHERE cid = ?5 AND id = ?6",
            params![
                doc.version,
                doc.modified_by,
                doc.last_modified,
                doc.sequence_number,
                self.context_id,
                doc.id
            ],
        )?;
        Ok(changed)
    }
}

/// Move heads to another folder in one statement, tombstoning their old rows
/// and dropping their object permissions.
pub(crate) struct MoveDocuments<'a> {
    pub context_id: ContextId,
    pub ids: &'a [DocumentId],
    pub folder_id: FolderId,
    pub modified_by: EntityId,
    pub last_modified: i64,
    pub sequence_number: i64,
}

impl SqlAction for MoveDocuments<'_> {
    fn name(&self) -> &'static str {
        "move documents"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        if self.ids.is_empty() {
            return Ok(0);
        }
        let mut changed = TombstoneDocuments {
            context_id: self.context_id,
            ids: self.ids,
            deleted_at: self.last_modified,
            sequence_number: self.sequence_number,
        }
        .execute(conn)?;

        let in_ids = placeholders(self.ids.len());
        let mut values = vec![
            Value::Integer(self.folder_id),
            Value::Integer(self.modified_by),
            Value::Integer(self.last_modified),
            Value::Integer(self.sequence_number),
        ];
        values.extend(id_values(self.context_id, self.ids));
        changed += conn.execute(
            &format!(
                "UPDATE documents SET folder_id = ?, changed_by = ?, last_modified = ?,
                    sequence_number = ?
                 WHERE cid = ? AND id IN ({})",
                in_ids
            ),
            params_from_iter(values.iter()),
        )?;
        changed += conn.execute(
            &format!(
                "DELETE FROM object_permissions WHERE cid = ? AND document_id IN ({})",
                in_ids
            ),
            params_from_iter(id_values(self.context_id, self.ids).iter()),
        )?;
        Ok(changed)
    }
}

/// Set the filename (and optionally the title) of the current and placeholder versions.
pub(crate) struct RenameDocument<'a> {
    pub context_id: ContextId,
    pub id: DocumentId,
    pub version: i32,
    pub filename: &'a str,
    pub title: Option<&'a str>,
}

impl SqlAction for RenameDocument<'_> {
    fn name(&self) -> &'static str {
        "rename document"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let mut changed = 0;
        for version in [PLACEHOLDER_VERSION, self.version] {
            changed += match self.title {
                Some(title) => conn.execute(
                    "UPDATE document_versions SET filename = ?1, title = ?2
                     WHERE cid = ?3 AND infostore_id = ?4 AND version_number = ?5",
                    params![self.filename, title, self.context_id, self.id, version],
                )?,
                None => conn.execute(
                    "UPDATE document_versions SET filename = ?1
                     WHERE cid = ?2 AND infostore_id = ?3 AND version_number = ?4",
                    params![self.filename, self.context_id, self.id, version],
                )?,
            };
            if self.version == PLACEHOLDER_VERSION {
                break;
            }
        }
        Ok(changed)
    }
}

pub(crate) struct ReplaceObjectPermissions<'a> {
    pub context_id: ContextId,
    pub id: DocumentId,
    pub folder_id: FolderId,
    pub permissions: &'a [ObjectPermission],
}

impl SqlAction for ReplaceObjectPermissions<'_> {
    fn name(&self) -> &'static str {
        "replace object permissions"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let mut changed = conn.execute(
            "DELETE FROM object_permissions WHERE cid = ?1 AND document_id = ?2",
            params![self.context_id, self.id],
        )?;
        changed += insert_permissions(
            conn,
            self.context_id,
            self.id,
            self.folder_id,
            self.permissions,
        )?;
        Ok(changed)
    }
}

/// Bump last-modified and sequence number of a head without other changes.
pub(crate) struct TouchDocument {
    pub context_id: ContextId,
    pub id: DocumentId,
    pub modified_by: EntityId,
    pub last_modified: i64,
    pub sequence_number: i64,
}

impl SqlAction for TouchDocument {
    fn name(&self) -> &'static str {
        "touch document"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE documents SET changed_by = ?1, last_modified = ?2, sequence_number = ?3
             WHERE cid = ?4 AND id = ?5",
            params![
                self.modified_by,
                self.last_modified,
                self.sequence_number,
                self.context_id,
                self.id
            ],
        )
    }
}

/// Point a version row at a blob stored elsewhere.
pub(crate) struct SetVersionLocation<'a> {
    pub context_id: ContextId,
    pub id: DocumentId,
    pub version: i32,
    pub location: &'a str,
}

impl SqlAction for SetVersionLocation<'_> {
    fn name(&self) -> &'static str {
        "set version location"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE document_versions SET location = ?1
             WHERE cid = ?2 AND infostore_id = ?3 AND version_number = ?4",
            params![self.location, self.context_id, self.id, self.version],
        )
    }
}

/// Content fields of one version, written once its blob is in place.
pub(crate) struct SetVersionContent<'a> {
    pub context_id: ContextId,
    pub id: DocumentId,
    pub version: i32,
    pub file_size: u64,
    pub checksum: Option<&'a str>,
    pub location: &'a str,
}

impl SqlAction for SetVersionContent<'_> {
    fn name(&self) -> &'static str {
        "set version content"
    }

    fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE document_versions SET file_size = ?1, checksum = ?2, location = ?3
             WHERE cid = ?4 AND infostore_id = ?5 AND version_number = ?6",
            params![
                self.file_size as i64,
                self.checksum,
                self.location,
                self.context_id,
                self.id,
                self.version
            ],
        )
    }
}
