use crate::actions::{perform, MoveDocuments, RenameDocument};
use crate::db;
use crate::engine::{document_event, next_sequence, InfostoreEngine};
use crate::remove::divert_or_fail;
use crate::tx::InfostoreTransaction;
use infostore_lib::{
    ContextId, DocumentId, DocumentMetadata, DocumentRef, FolderId, InfostoreError, InfostoreEventKind,
    InfostoreResult, QuotaOwner, ReservationRequest, Session, SHARED_FOLDER_ID,
};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet, HashMap};

impl InfostoreEngine {
    /// Move documents into `destination`.
    ///
    /// Documents already there are skipped. Conflicting documents (missing,
    /// locked, changed after `horizon`) fail the call, or are collected in
    /// `rejected` when one is given. Returns the ids actually moved.
    pub fn move_documents(
        &self,
        tx: &mut InfostoreTransaction,
        session: &Session,
        refs: &[DocumentRef],
        destination: FolderId,
        horizon: i64,
        mut rejected: Option<&mut Vec<DocumentRef>>,
    ) -> InfostoreResult<Vec<DocumentId>> {
        tx.ensure_active()?;
        let context_id = session.context_id;
        let target = self.infostore_folder(context_id, destination)?;
        let target_permission = self
            .services
            .permissions
            .folder_permission(session, destination)?;
        if !target_permission.create_objects {
            return Err(InfostoreError::CreateDenied(destination));
        }
        let target_owner = target.quota_owner(context_id);

        let ids: Vec<DocumentId> = refs.iter().map(|r| r.id).collect();
        let stored: HashMap<DocumentId, DocumentMetadata> =
            db::load_documents(tx.conn(), context_id, &ids)?
                .into_iter()
                .map(|doc| (doc.id, doc))
                .collect();

        let mut movable: Vec<DocumentMetadata> = Vec::new();
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
            if doc.folder_id == destination {
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
            movable.push(doc.clone());
        }
        if movable.is_empty() {
            return Ok(Vec::new());
        }

        self.claim_names_in(tx, context_id, destination, &mut movable)?;

        let mut by_owner: BTreeMap<QuotaOwner, Vec<DocumentId>> = BTreeMap::new();
        for doc in movable.iter() {
            let owner = self.quota_owner_of(context_id, doc.folder_id)?;
            by_owner.entry(owner).or_default().push(doc.id);
        }
        for (owner, owned) in by_owner.iter() {
            if *owner != target_owner {
                self.relocate_content(tx, context_id, owned, owner, &target_owner)?;
            }
        }

        let moved: Vec<DocumentId> = movable.iter().map(|doc| doc.id).collect();
        let grantees = db::permission_grantees(tx.conn(), context_id, &moved)?;
        let sequence_number =
            next_sequence(movable.iter().map(|doc| doc.sequence_number).max().unwrap_or(0));
        perform(
            tx.conn(),
            &MoveDocuments {
                context_id,
                ids: &moved,
                folder_id: destination,
                modified_by: session.user_id,
                last_modified: sequence_number,
                sequence_number,
            },
        )?;
        tx.schedule_guest_cleanup(context_id, grantees);

        for doc in movable.iter_mut() {
            doc.folder_id = destination;
            doc.modified_by = session.user_id;
            doc.last_modified = sequence_number;
            doc.sequence_number = sequence_number;
            doc.object_permissions = Some(Vec::new());
            tx.post_event(document_event(InfostoreEventKind::Updated, session, doc));
        }
        info!(
            "documents moved: ctx={}, folder={}, count={}",
            context_id,
            destination,
            moved.len()
        );
        Ok(moved)
    }

    /// Reserve every filename of `docs` in `folder_id`, renaming documents
    /// whose name had to be adjusted.
    fn claim_names_in(
        &self,
        tx: &mut InfostoreTransaction,
        context_id: ContextId,
        folder_id: FolderId,
        docs: &mut [DocumentMetadata],
    ) -> InfostoreResult<()> {
        let occupied = db::occupied_names(tx.conn(), context_id, folder_id)?;
        for doc in docs.iter_mut() {
            let Some(filename) = doc.filename.clone() else {
                continue;
            };
            let request = ReservationRequest {
                context_id,
                folder_id,
                document_id: doc.id,
                filename: &filename,
                auto_adjust: self.config.auto_rename,
                title_mirrors_filename: doc.title == filename,
                occupied: &occupied,
            };
            let reservation = self.reserve_filename(tx, &request)?;
            if !reservation.adjusted {
                continue;
            }
            debug!(
                "renaming {} on move: {} -> {}",
                doc.id, filename, reservation.filename
            );
            if reservation.adjust_title {
                doc.title = reservation.filename.clone();
            }
            doc.filename = Some(reservation.filename);
            perform(
                tx.conn(),
                &RenameDocument {
                    context_id,
                    id: doc.id,
                    version: doc.version,
                    filename: doc.filename.as_deref().unwrap_or_default(),
                    title: reservation.adjust_title.then_some(doc.title.as_str()),
                },
            )?;
        }
        Ok(())
    }
}
