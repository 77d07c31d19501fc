//! Deletion of documents and pruning of versions.

use crate::actions::{perform, MirrorPlaceholder, RemoveDocuments, RemoveVersions, RenameDocument, TouchDocument};
use crate::db::{self, FolderQuery};
use crate::engine::{document_event, next_sequence, InfostoreEngine};
use crate::tx::InfostoreTransaction;
use infostore_lib::{
    ContextId, DocumentId, DocumentMetadata, DocumentRef, EntityId, FolderId, InfostoreError,
    InfostoreEventKind, InfostoreResult, QuotaOwner, ReservationRequest, Session,
    CURRENT_VERSION, PLACEHOLDER_VERSION, SHARED_FOLDER_ID,
};
use log::{debug, info};
use std::collections::{BTreeSet, HashMap};

/// Hand `item` to the caller's collector, or fail with `err` when there is none.
pub(crate) fn divert_or_fail(
    rejected: &mut Option<&mut Vec<DocumentRef>>,
    item: DocumentRef,
    err: InfostoreError,
) -> InfostoreResult<()> {
    match rejected {
        Some(collector) => {
            debug!("document {} rejected: {}", item.id, err);
            collector.push(item);
            Ok(())
        }
        None => Err(err),
    }
}

impl InfostoreEngine {
    /// Delete documents last seen at or before `horizon`.
    ///
    /// Without a `rejected` collector any conflict aborts the whole call;
    /// with one, conflicting documents are collected and the rest deleted.
    /// Returns the ids actually deleted.
    pub fn remove_documents(
        &self,
        tx: &mut InfostoreTransaction,
        session: &Session,
        refs: &[DocumentRef],
        horizon: i64,
        mut rejected: Option<&mut Vec<DocumentRef>>,
    ) -> InfostoreResult<Vec<DocumentId>> {
        tx.ensure_active()?;
        let context_id = session.context_id;
        let mut ids: Vec<DocumentId> = refs.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        let stored: HashMap<DocumentId, DocumentMetadata> =
            db::load_documents(tx.conn(), context_id, &ids)?
                .into_iter()
                .map(|doc| (doc.id, doc))
                .collect();

        let mut deletable = Vec::new();
        let mut seen = BTreeSet::new();
        for item in refs {
            if !seen.insert(item.id) {
                continue;
            }
            let Some(doc) = stored.get(&item.id) else {
                divert_or_fail(&mut rejected, *item, InfostoreError::DocumentNotFound(item.id))?;
                continue;
            };
            if item.folder_id != doc.folder_id && item.folder_id != SHARED_FOLDER_ID {
                divert_or_fail(&mut rejected, *item, InfostoreError::DocumentNotFound(item.id))?;
                continue;
            }
            let (permission, _) = self.effective_permission(tx.conn(), session, doc)?;
            if !permission.can_delete() {
                return Err(InfostoreError::DeleteDenied(doc.id));
            }
            if let Err(e) = self.check_write_lock(session, doc) {
                divert_or_fail(&mut rejected, *item, e)?;
                continue;
            }
            if doc.sequence_number > horizon {
                divert_or_fail(
                    &mut rejected,
                    *item,
                    InfostoreError::ConcurrentModification(doc.id),
                )?;
                continue;
            }
            deletable.push(doc.clone());
        }

        self.purge_documents(tx, session, &deletable)?;
        Ok(deletable.iter().map(|doc| doc.id).collect())
    }

    /// Delete every document of a folder the caller last saw at or before
    /// `horizon`; returns the ones kept back.
    pub fn clear_folder(
        &self,
        tx: &mut InfostoreTransaction,
        session: &Session,
        folder_id: FolderId,
        horizon: i64,
    ) -> InfostoreResult<Vec<DocumentRef>> {
        self.infostore_folder(session.context_id, folder_id)?;
        let refs: Vec<DocumentRef> = db::ids_in_folder(tx.conn(), session.context_id, folder_id)?
            .into_iter()
            .map(|id| DocumentRef::new(id, folder_id))
            .collect();
        let mut rejected = Vec::new();
        self.remove_documents(tx, session, &refs, horizon, Some(&mut rejected))?;
        Ok(rejected)
    }

    /// Bulk removal on behalf of the folder subsystem, e.g. before a folder
    /// or its owner goes away. No permission, lock or horizon checks.
    pub fn remove_folder_contents(
        &self,
        tx: &mut InfostoreTransaction,
        context_id: ContextId,
        folder_id: FolderId,
        actor: EntityId,
    ) -> InfostoreResult<usize> {
        tx.ensure_active()?;
        let docs = db::list_folder(tx.conn(), &FolderQuery::new(context_id, folder_id), None)?;
        self.purge_documents(tx, &Session::new(context_id, actor), &docs)?;
        info!(
            "folder contents removed: ctx={}, folder={}, documents={}",
            context_id,
            folder_id,
            docs.len()
        );
        Ok(docs.len())
    }

    /// Tombstone and delete `docs`; their blobs go once the transaction commits.
    fn purge_documents(
        &self,
        tx: &mut InfostoreTransaction,
        actor: &Session,
        docs: &[DocumentMetadata],
    ) -> InfostoreResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let context_id = actor.context_id;
        let ids: Vec<DocumentId> = docs.iter().map(|doc| doc.id).collect();
        let grantees = db::permission_grantees(tx.conn(), context_id, &ids)?;
        let locations = db::version_locations(tx.conn(), context_id, &ids)?;
        let sequence_number =
            next_sequence(docs.iter().map(|doc| doc.sequence_number).max().unwrap_or(0));

        perform(
            tx.conn(),
            &RemoveDocuments {
                context_id,
                ids: &ids,
                deleted_at: sequence_number,
                sequence_number,
            },
        )?;

        let folder_of: HashMap<DocumentId, FolderId> =
            docs.iter().map(|doc| (doc.id, doc.folder_id)).collect();
        self.defer_unreferenced_blobs(tx, context_id, &folder_of, locations)?;
        self.services.locks.remove_all(tx.txid(), context_id, &ids)?;
        tx.schedule_guest_cleanup(context_id, grantees);
        for doc in docs {
            tx.post_event(document_event(InfostoreEventKind::Deleted, actor, doc));
        }
        info!(
            "documents removed: ctx={}, count={}, seq={}",
            context_id,
            ids.len(),
            sequence_number
        );
        Ok(())
    }

    /// Schedule deletion of `locations` no surviving version points at,
    /// grouped by the quota owner of each document's folder.
    fn defer_unreferenced_blobs(
        &self,
        tx: &mut InfostoreTransaction,
        context_id: ContextId,
        folder_of: &HashMap<DocumentId, FolderId>,
        locations: Vec<(DocumentId, i32, String)>,
    ) -> InfostoreResult<()> {
        let candidates: Vec<String> = locations.iter().map(|(_, _, l)| l.clone()).collect();
        let referenced = db::referenced_locations(tx.conn(), context_id, &candidates)?;
        let mut owners: HashMap<FolderId, QuotaOwner> = HashMap::new();
        for (id, _, location) in locations {
            if referenced.contains(&location) {
                continue;
            }
            let Some(folder_id) = folder_of.get(&id).copied() else {
                continue;
            };
            let owner = match owners.get(&folder_id) {
                Some(owner) => *owner,
                None => {
                    let owner = self.quota_owner_of(context_id, folder_id)?;
                    owners.insert(folder_id, owner);
                    owner
                }
            };
            tx.defer_blob_deletion(owner, location);
        }
        Ok(())
    }

    /// Prune versions of one document. Returns the requested versions that
    /// were not removed: the placeholder and versions that do not exist.
    pub fn remove_versions(
        &self,
        tx: &mut InfostoreTransaction,
        session: &Session,
        id: DocumentId,
        versions: &[i32],
    ) -> InfostoreResult<Vec<i32>> {
        tx.ensure_active()?;
        let context_id = session.context_id;
        let original = db::load_document(tx.conn(), context_id, id, CURRENT_VERSION)?
            .ok_or(InfostoreError::DocumentNotFound(id))?;
        let (permission, _) = self.effective_permission(tx.conn(), session, &original)?;
        if !permission.can_delete() {
            return Err(InfostoreError::DeleteDenied(id));
        }
        self.check_write_lock(session, &original)?;

        let live: BTreeSet<i32> = db::version_numbers(tx.conn(), context_id, id)?
            .into_iter()
            .collect();
        let mut to_remove = Vec::new();
        let mut not_removed = Vec::new();
        for version in versions.iter().copied().collect::<BTreeSet<i32>>() {
            if version > PLACEHOLDER_VERSION && live.contains(&version) {
                to_remove.push(version);
            } else {
                not_removed.push(version);
            }
        }
        if to_remove.is_empty() {
            return Ok(not_removed);
        }

        let locations: Vec<(DocumentId, i32, String)> =
            db::version_locations(tx.conn(), context_id, &[id])?
                .into_iter()
                .filter(|(_, version, _)| to_remove.contains(version))
                .collect();
        let sequence_number = next_sequence(original.sequence_number);
        perform(
            tx.conn(),
            &RemoveVersions {
                context_id,
                id,
                versions: &to_remove,
                deleted_at: sequence_number,
            },
        )?;

        let mut updated = original.clone();
        updated.modified_by = session.user_id;
        updated.last_modified = sequence_number;
        updated.sequence_number = sequence_number;

        if to_remove.contains(&original.version) {
            let successor = live
                .iter()
                .copied()
                .filter(|v| *v > PLACEHOLDER_VERSION && !to_remove.contains(v))
                .max()
                .unwrap_or(PLACEHOLDER_VERSION);
            self.retarget_current_version(tx, context_id, &mut updated, successor)?;
        } else {
            perform(
                tx.conn(),
                &TouchDocument {
                    context_id,
                    id,
                    modified_by: session.user_id,
                    last_modified: sequence_number,
                    sequence_number,
                },
            )?;
        }

        let folder_of = HashMap::from([(id, original.folder_id)]);
        self.defer_unreferenced_blobs(tx, context_id, &folder_of, locations)?;
        tx.post_event(document_event(InfostoreEventKind::Updated, session, &updated));
        debug!(
            "versions pruned: id={}, removed={:?}, current={}",
            id, to_remove, updated.version
        );
        Ok(not_removed)
    }

    /// Make `successor` the current version and mirror its descriptive fields
    /// onto the placeholder, re-reserving the filename if it now collides.
    fn retarget_current_version(
        &self,
        tx: &mut InfostoreTransaction,
        context_id: ContextId,
        doc: &mut DocumentMetadata,
        successor: i32,
    ) -> InfostoreResult<()> {
        let id = doc.id;
        let previous_filename = doc.filename.clone();
        if successor > PLACEHOLDER_VERSION {
            let source = db::load_document(tx.conn(), context_id, id, successor)?
                .ok_or(InfostoreError::VersionNotFound(id, successor))?;
            doc.title = source.title;
            doc.filename = source.filename;
            doc.description = source.description;
            doc.url = source.url;
            doc.file_mime_type = source.file_mime_type;
            doc.version_comment = source.version_comment;
            doc.file_size = source.file_size;
            doc.checksum = source.checksum;
            doc.filestore_location = source.filestore_location;
        } else {
            doc.file_size = 0;
            doc.checksum = None;
            doc.filestore_location = None;
        }
        doc.version = successor;

        if let Some(filename) = doc.filename.clone() {
            if doc.filename != previous_filename {
                let occupied = db::occupied_names(tx.conn(), context_id, doc.folder_id)?;
                let request = ReservationRequest {
                    context_id,
                    folder_id: doc.folder_id,
                    document_id: id,
                    filename: &filename,
                    auto_adjust: true,
                    title_mirrors_filename: doc.title == filename,
                    occupied: &occupied,
                };
                let reservation = self.reserve_filename(tx, &request)?;
                if reservation.adjusted {
                    if reservation.adjust_title {
                        doc.title = reservation.filename.clone();
                    }
                    doc.filename = Some(reservation.filename);
                    perform(
                        tx.conn(),
                        &RenameDocument {
                            context_id,
                            id,
                            version: successor,
                            filename: doc.filename.as_deref().unwrap_or_default(),
                            title: reservation.adjust_title.then_some(doc.title.as_str()),
                        },
                    )?;
                }
            }
        }
        perform(tx.conn(), &MirrorPlaceholder { context_id, doc })?;
        Ok(())
    }
}
