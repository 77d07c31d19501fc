//! Create and update of documents, including moves, renames and new content.

use crate::actions::{
    perform, InsertDocument, InsertVersion, MoveDocuments, ReplaceObjectPermissions,
    SetVersionContent, SetVersionLocation, UpdateDocument,
};
use crate::db;
use crate::engine::{document_event, next_sequence, present_shared, InfostoreEngine};
use crate::quota::{check_file_count, check_storage, recheck_storage};
use crate::save_params::{SaveOptions, SaveParameters};
use crate::tx::InfostoreTransaction;
use infostore_lib::{
    unix_timestamp_millis, validate_filename, validate_object_permissions, ContextId, DocumentId,
    DocumentMetadata, EffectivePermission, EntityId, Field, FolderId, IdVersionPair,
    InfostoreError, InfostoreEventKind, InfostoreResult, ObjectPermission, QuotaOwner,
    ReservationRequest, Session, CURRENT_VERSION, NEW, PLACEHOLDER_VERSION, SHARED_FOLDER_ID,
};
use log::{debug, info};
use std::collections::{BTreeSet, HashMap};
use std::io::Read;

const ID_KIND: &str = "infostore";

fn same_permissions(a: &[ObjectPermission], b: &[ObjectPermission]) -> bool {
    let key = |p: &ObjectPermission| (p.group, p.entity, p.bits);
    let mut a: Vec<_> = a.iter().map(key).collect();
    let mut b: Vec<_> = b.iter().map(key).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

fn user_grantees(permissions: &[ObjectPermission]) -> BTreeSet<EntityId> {
    permissions
        .iter()
        .filter(|p| !p.group)
        .map(|p| p.entity)
        .collect()
}

/// Copy the caller's values of `columns` over the stored document.
fn merge_columns(original: &DocumentMetadata, params: &SaveParameters<'_>) -> DocumentMetadata {
    let mut merged = original.clone();
    let doc = &params.document;
    for column in params.columns.iter() {
        match column {
            Field::FolderId => merged.folder_id = doc.folder_id,
            Field::Title => merged.title = doc.title.clone(),
            Field::Filename => merged.filename = doc.filename.clone(),
            Field::Description => merged.description = doc.description.clone(),
            Field::Url => merged.url = doc.url.clone(),
            Field::FileMimeType => merged.file_mime_type = doc.file_mime_type.clone(),
            Field::VersionComment => merged.version_comment = doc.version_comment.clone(),
            Field::ObjectPermissions => merged.object_permissions = doc.object_permissions.clone(),
            _ => {}
        }
    }
    merged
}

impl InfostoreEngine {
    /// Create (`doc.id == NEW`) or update a document, with optional new content.
    ///
    /// On success `doc` holds the stored state.
    pub fn save_document<'a>(
        &self,
        tx: &mut InfostoreTransaction,
        session: &'a Session,
        doc: &mut DocumentMetadata,
        data: Option<&'a mut dyn Read>,
        options: SaveOptions,
    ) -> InfostoreResult<IdVersionPair> {
        tx.ensure_active()?;
        let saved = if doc.is_new() {
            self.create_document(tx, session, doc.clone(), data, &options)?
        } else {
            self.update_document(tx, session, doc.clone(), data, &options)?
        };
        *doc = saved;
        Ok(doc.id_version())
    }

    fn create_document<'a>(
        &self,
        tx: &mut InfostoreTransaction,
        session: &'a Session,
        mut doc: DocumentMetadata,
        data: Option<&'a mut dyn Read>,
        options: &SaveOptions,
    ) -> InfostoreResult<DocumentMetadata> {
        let context_id = session.context_id;
        let folder = self.infostore_folder(context_id, doc.folder_id)?;
        let permission = self
            .services
            .permissions
            .folder_permission(session, folder.id)?;
        if !permission.create_objects {
            return Err(InfostoreError::CreateDenied(folder.id));
        }
        if let Some(permissions) = doc.object_permissions.as_deref() {
            if !permissions.is_empty() {
                if !permission.share {
                    return Err(InfostoreError::ShareDenied(NEW));
                }
                validate_object_permissions(permissions, session.user_id)?;
            }
        }
        check_file_count(tx.conn(), self.services.quota.as_ref(), context_id)?;

        if let Some(filename) = doc.filename.as_deref() {
            validate_filename(filename)?;
        }
        if doc.title.is_empty() {
            if let Some(filename) = doc.filename.as_ref() {
                doc.title = filename.clone();
            }
        }

        let mut params = SaveParameters::new(
            session,
            doc,
            None,
            data,
            options,
            self.config.auto_rename,
            folder.quota_owner(context_id),
        )?;
        self.assign_filename(tx, &mut params, folder.id)?;

        let id = self.services.ids.next_id(context_id, ID_KIND)?;
        let now = unix_timestamp_millis();
        {
            let doc = &mut params.document;
            doc.id = id;
            doc.version = PLACEHOLDER_VERSION;
            doc.created_by = session.user_id;
            doc.modified_by = session.user_id;
            doc.creation_date = now;
            doc.last_modified = now;
            doc.sequence_number = now;
            doc.original_folder_id = None;
            doc.file_size = 0;
            doc.checksum = None;
            doc.filestore_location = None;
        }
        perform(
            tx.conn(),
            &InsertDocument {
                context_id,
                doc: &params.document,
            },
        )?;

        if let Some(data) = params.data.take() {
            let owner = params.quota_owner;
            self.write_first_version(tx, &owner, data, &mut params.document)?;
            perform(
                tx.conn(),
                &InsertVersion {
                    context_id,
                    doc: &params.document,
                },
            )?;
        }

        tx.post_event(document_event(
            InfostoreEventKind::Created,
            session,
            &params.document,
        ));
        let mut doc = params.document;
        doc.object_permissions = Some(doc.object_permissions.take().unwrap_or_default());
        doc.shareable = EffectivePermission::new(session, id, doc.created_by, permission, &[])
            .can_share();
        info!(
            "document created: ctx={}, id={}, folder={}, version={}",
            context_id, doc.id, doc.folder_id, doc.version
        );
        Ok(doc)
    }

    fn write_first_version(
        &self,
        tx: &mut InfostoreTransaction,
        owner: &QuotaOwner,
        data: &mut dyn Read,
        doc: &mut DocumentMetadata,
    ) -> InfostoreResult<()> {
        check_storage(self.services.blobs.as_ref(), self.services.quota.as_ref(), owner)?;
        let blob = self.services.blobs.write(owner, data)?;
        tx.track_written_blob(*owner, blob.location.clone());
        recheck_storage(self.services.blobs.as_ref(), self.services.quota.as_ref(), owner)?;
        doc.file_size = blob.size;
        doc.checksum = blob.checksum;
        doc.filestore_location = Some(blob.location);
        doc.version = 1;
        Ok(())
    }

    fn update_document<'a>(
        &self,
        tx: &mut InfostoreTransaction,
        session: &'a Session,
        doc: DocumentMetadata,
        data: Option<&'a mut dyn Read>,
        options: &SaveOptions,
    ) -> InfostoreResult<DocumentMetadata> {
        let context_id = session.context_id;
        let id = doc.id;
        let original = db::load_document(tx.conn(), context_id, id, CURRENT_VERSION)?
            .ok_or(InfostoreError::DocumentNotFound(id))?;
        let source_owner = self.quota_owner_of(context_id, original.folder_id)?;
        let mut params = SaveParameters::new(
            session,
            doc,
            Some(original.clone()),
            data,
            options,
            self.config.auto_rename,
            source_owner,
        )?;

        // the shared folder is a view; saving through it never moves the document
        let via_shared =
            params.changes(Field::FolderId) && params.document.folder_id == SHARED_FOLDER_ID;
        if via_shared || !params.changes(Field::FolderId) {
            params.document.folder_id = original.folder_id;
            params.drop_column(Field::FolderId);
        }

        let (permission, stored_permissions) =
            self.effective_permission(tx.conn(), session, &original)?;
        if !permission.can_write() {
            return Err(InfostoreError::WriteDenied(id));
        }

        if params.changes(Field::ObjectPermissions) {
            match params.document.object_permissions.as_deref() {
                Some(requested) if !same_permissions(requested, &stored_permissions) => {
                    if !via_shared && !permission.can_share() {
                        return Err(InfostoreError::ShareDenied(id));
                    }
                    validate_object_permissions(requested, original.created_by)?;
                }
                _ => params.drop_column(Field::ObjectPermissions),
            }
        }

        let target_folder = params.document.folder_id;
        let is_move = target_folder != original.folder_id;
        if is_move {
            let destination = self.infostore_folder(context_id, target_folder)?;
            let destination_permission = self
                .services
                .permissions
                .folder_permission(session, target_folder)?;
            if !destination_permission.create_objects {
                return Err(InfostoreError::CreateDenied(target_folder));
            }
            if !permission.can_delete() {
                return Err(InfostoreError::DeleteDenied(id));
            }
            if params.is_append() {
                return Err(InfostoreError::InvalidParam(
                    "append cannot be combined with a move".to_string(),
                ));
            }
            params.quota_owner = destination.quota_owner(context_id);
        }
        if params.is_append() && original.version == PLACEHOLDER_VERSION {
            return Err(InfostoreError::InvalidParam(format!(
                "document {} has no content to append to at offset {}",
                id, params.offset
            )));
        }

        self.check_write_lock(session, &original)?;
        if params.sequence_number < original.sequence_number {
            debug!(
                "document {} modified concurrently: caller={}, stored={}",
                id, params.sequence_number, original.sequence_number
            );
            return Err(InfostoreError::ConcurrentModification(id));
        }
        if params.has_data() {
            check_storage(
                self.services.blobs.as_ref(),
                self.services.quota.as_ref(),
                &params.quota_owner,
            )?;
        }

        // filename and title
        let title_mirrors = params.title_mirrors_filename();
        if !params.changes(Field::Filename) {
            params.document.filename = original.filename.clone();
        }
        let renamed = params.document.filename != original.filename;
        if renamed {
            if let Some(filename) = params.document.filename.as_deref() {
                validate_filename(filename)?;
            }
            if title_mirrors {
                params.document.title = params.document.filename.clone().unwrap_or_default();
                params.columns.insert(Field::Title);
            }
        }
        if renamed || is_move {
            self.assign_filename(tx, &mut params, target_folder)?;
            params.columns.insert(Field::Filename);
            if params.document.title != original.title {
                params.columns.insert(Field::Title);
            }
        }

        let sequence_number = next_sequence(original.sequence_number);
        let mut updated = merge_columns(&original, &params);
        updated.modified_by = session.user_id;
        updated.last_modified = sequence_number;
        updated.sequence_number = sequence_number;

        // blobs follow the document to another quota owner
        let mut current_location = original.filestore_location.clone();
        if is_move && source_owner != params.quota_owner {
            let moved =
                self.relocate_content(tx, context_id, &[id], &source_owner, &params.quota_owner)?;
            if let Some(location) = moved.get(&(id, original.version)) {
                current_location = Some(location.clone());
            }
            updated.filestore_location = current_location.clone();
        }

        let owner = params.quota_owner;
        let content = params.data.take();
        let new_version = content.is_some()
            && !(params.ignore_version && original.version > PLACEHOLDER_VERSION);

        // rows first, the blob after; only the rows recording the blob follow it
        if is_move {
            perform(
                tx.conn(),
                &MoveDocuments {
                    context_id,
                    ids: &[id],
                    folder_id: target_folder,
                    modified_by: session.user_id,
                    last_modified: sequence_number,
                    sequence_number,
                },
            )?;
            tx.schedule_guest_cleanup(context_id, user_grantees(&stored_permissions));
            params.drop_column(Field::ObjectPermissions);
            updated.object_permissions = Some(Vec::new());
        }
        if !new_version {
            perform(
                tx.conn(),
                &UpdateDocument {
                    context_id,
                    doc: &updated,
                },
            )?;
        }
        if params.changes(Field::ObjectPermissions) {
            let requested = updated.object_permissions.clone().unwrap_or_default();
            perform(
                tx.conn(),
                &ReplaceObjectPermissions {
                    context_id,
                    id,
                    folder_id: updated.folder_id,
                    permissions: &requested,
                },
            )?;
            let kept = user_grantees(&requested);
            tx.schedule_guest_cleanup(
                context_id,
                user_grantees(&stored_permissions)
                    .into_iter()
                    .filter(|entity| !kept.contains(entity)),
            );
        } else if !is_move {
            updated.object_permissions = Some(stored_permissions);
        }

        if let Some(data) = content {
            if new_version {
                let blob = self.services.blobs.write(&owner, data)?;
                tx.track_written_blob(owner, blob.location.clone());
                updated.version = db::max_version(tx.conn(), context_id, id)? + 1;
                updated.file_size = blob.size;
                updated.checksum = blob.checksum;
                updated.filestore_location = Some(blob.location);
                perform(
                    tx.conn(),
                    &InsertVersion {
                        context_id,
                        doc: &updated,
                    },
                )?;
                perform(
                    tx.conn(),
                    &UpdateDocument {
                        context_id,
                        doc: &updated,
                    },
                )?;
            } else {
                let blob = if params.is_append() {
                    let location = current_location.clone().ok_or_else(|| {
                        InfostoreError::InvalidState(format!(
                            "document {} has no content to append to",
                            id
                        ))
                    })?;
                    let stored_size = self.services.blobs.size(&owner, &location)?;
                    tx.track_appended_blob(
                        owner,
                        location.clone(),
                        stored_size,
                        original.checksum.clone(),
                    );
                    let mut blob =
                        self.services.blobs.append(&owner, &location, data, params.offset)?;
                    blob.checksum = None;
                    blob
                } else {
                    let blob = self.services.blobs.write(&owner, data)?;
                    tx.track_written_blob(owner, blob.location.clone());
                    if let Some(old) = current_location.clone() {
                        tx.defer_blob_deletion(owner, old);
                    }
                    blob
                };
                perform(
                    tx.conn(),
                    &SetVersionContent {
                        context_id,
                        id,
                        version: updated.version,
                        file_size: blob.size,
                        checksum: blob.checksum.as_deref(),
                        location: &blob.location,
                    },
                )?;
                updated.file_size = blob.size;
                updated.checksum = blob.checksum;
                updated.filestore_location = Some(blob.location);
            }
            recheck_storage(
                self.services.blobs.as_ref(),
                self.services.quota.as_ref(),
                &owner,
            )?;
        }

        tx.post_event(document_event(InfostoreEventKind::Updated, session, &updated));
        debug!(
            "document updated: ctx={}, id={}, folder={}, version={}, seq={}",
            context_id, id, updated.folder_id, updated.version, updated.sequence_number
        );
        updated.shareable = permission.can_share();
        if via_shared || permission.is_shared_access_only() {
            present_shared(&mut updated);
        }
        Ok(updated)
    }

    /// Reserve the document's filename in `folder_id`, taking over an adjusted
    /// name (and title, if it mirrored the filename).
    pub(crate) fn assign_filename(
        &self,
        tx: &mut InfostoreTransaction,
        params: &mut SaveParameters<'_>,
        folder_id: FolderId,
    ) -> InfostoreResult<()> {
        let Some(filename) = params.document.filename.clone() else {
            return Ok(());
        };
        let occupied = db::occupied_names(tx.conn(), params.context_id, folder_id)?;
        let request = ReservationRequest {
            context_id: params.context_id,
            folder_id,
            document_id: params.document.id,
            filename: &filename,
            auto_adjust: params.auto_rename,
            title_mirrors_filename: params.title_mirrors_filename()
                || params.document.title == filename,
            occupied: &occupied,
        };
        let reservation = self.reserve_filename(tx, &request)?;
        if reservation.adjusted {
            debug!(
                "filename adjusted in folder {}: {} -> {}",
                folder_id, filename, reservation.filename
            );
            if reservation.adjust_title {
                params.document.title = reservation.filename.clone();
            }
            params.document.filename = Some(reservation.filename);
        }
        Ok(())
    }

    /// Copy the content of every version of `ids` from one quota owner to
    /// another. The old blobs go once the transaction commits.
    pub(crate) fn relocate_content(
        &self,
        tx: &mut InfostoreTransaction,
        context_id: ContextId,
        ids: &[DocumentId],
        from: &QuotaOwner,
        to: &QuotaOwner,
    ) -> InfostoreResult<HashMap<(DocumentId, i32), String>> {
        let mut moved = HashMap::new();
        for (id, version, location) in db::version_locations(tx.conn(), context_id, ids)? {
            let mut reader = self.services.blobs.read(from, &location, None)?;
            let blob = self.services.blobs.write(to, &mut reader)?;
            tx.track_written_blob(*to, blob.location.clone());
            perform(
                tx.conn(),
                &SetVersionLocation {
                    context_id,
                    id,
                    version,
                    location: &blob.location,
                },
            )?;
            tx.defer_blob_deletion(*from, location);
            moved.insert((id, version), blob.location);
        }
        if !moved.is_empty() {
            recheck_storage(self.services.blobs.as_ref(), self.services.quota.as_ref(), to)?;
            debug!(
                "relocated {} blobs from {:?} to {:?}",
                moved.len(),
                from,
                to
            );
        }
        Ok(moved)
    }
}
