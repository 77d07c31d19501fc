//! The document lifecycle engine: services, transactions, reads and queries.
//!
//! Mutating entry points live next to this file (`save`, `remove`,
//! `move_docs`, `locking`) and all take the transaction they run in.

use crate::config::InfostoreConfig;
use crate::db::{self, FolderQuery};
use crate::folders::FolderDirectory;
use crate::id_generator::DbIdGenerator;
use crate::loader::{DecoratedDocuments, LoadContext, MetadataLoader};
use crate::loaders::{
    IdentityDecorator, IdentityLoader, LockExpiryLoader, ObjectPermissionLoader,
    VersionCountLoader,
};
use crate::lock_manager::MemoryLockManager;
use crate::quota::ConfiguredQuota;
use crate::reservation::{MemoryFilenameReserver, ReservationGuard};
use crate::schema::{create_schema, open_connection, open_txn_connection};
use crate::tx::{InfostoreTransaction, TxParticipants};
use blob_store::LocalBlobStore;
use infostore_lib::{
    unix_timestamp_millis, AccessLevel, BlobReader, BlobStore, ContextId, Delta, DocumentId,
    DocumentMetadata, EffectivePermission, EntityId, EventSink, Field, FilenameReservation,
    FilenameReserver, FolderId, FolderInfo, FolderPermission, FolderResolver,
    GuestCleanupScheduler, IdGenerator, IdentityResolver, InfostoreError, InfostoreEvent,
    InfostoreEventKind, InfostoreResult, LockManager, ObjectPermission, PermissionEvaluator,
    QuotaOwner, QuotaProvider, ReservationOutcome, ReservationRequest, Session, SortDirection,
    TimedResult, CURRENT_VERSION, SHARED_FOLDER_ID,
};
use log::{debug, info, warn};
use rusqlite::Connection;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Collaborators the engine delegates to.
#[derive(Clone)]
pub struct InfostoreServices {
    pub ids: Arc<dyn IdGenerator>,
    pub reserver: Arc<dyn FilenameReserver>,
    pub locks: Arc<dyn LockManager>,
    pub permissions: Arc<dyn PermissionEvaluator>,
    pub folders: Arc<dyn FolderResolver>,
    pub quota: Arc<dyn QuotaProvider>,
    pub blobs: Arc<dyn BlobStore>,
    pub events: Vec<Arc<dyn EventSink>>,
    pub guest_cleanup: Option<Arc<dyn GuestCleanupScheduler>>,
    pub identities: Option<Arc<dyn IdentityResolver>>,
}

impl InfostoreServices {
    /// Services backed by the local sequence database, the local blob store
    /// and in-memory folders, locks and reservations.
    pub fn local(config: &InfostoreConfig, folders: Arc<FolderDirectory>) -> InfostoreResult<Self> {
        let ids = DbIdGenerator::new(&config.sequence_db_path().to_string_lossy())?;
        let blobs = LocalBlobStore::open(config.blob_dir.clone())?;
        Ok(Self {
            ids: Arc::new(ids),
            reserver: Arc::new(MemoryFilenameReserver::new()),
            locks: Arc::new(MemoryLockManager::new()),
            permissions: folders.clone(),
            folders,
            quota: Arc::new(ConfiguredQuota::new(
                config.max_files_per_context,
                config.max_storage_per_owner,
            )),
            blobs: Arc::new(blobs),
            events: Vec::new(),
            guest_cleanup: None,
            identities: None,
        })
    }

    pub fn with_locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_quota(mut self, quota: Arc<dyn QuotaProvider>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events.push(sink);
        self
    }

    pub fn with_guest_cleanup(mut self, scheduler: Arc<dyn GuestCleanupScheduler>) -> Self {
        self.guest_cleanup = Some(scheduler);
        self
    }

    pub fn with_identities(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identities = Some(resolver);
        self
    }
}

/// `max(now, previous + 1)`: strictly increasing per document, close to wall time.
pub(crate) fn next_sequence(previous: i64) -> i64 {
    unix_timestamp_millis().max(previous.saturating_add(1))
}

/// Show a document through the virtual shared folder.
pub(crate) fn present_shared(doc: &mut DocumentMetadata) {
    if doc.folder_id != SHARED_FOLDER_ID {
        doc.original_folder_id = Some(doc.folder_id);
    }
    doc.folder_id = SHARED_FOLDER_ID;
    doc.shareable = false;
}

pub(crate) fn document_event(
    kind: InfostoreEventKind,
    session: &Session,
    doc: &DocumentMetadata,
) -> InfostoreEvent {
    InfostoreEvent {
        kind,
        context_id: session.context_id,
        document_id: doc.id,
        folder_id: doc.physical_folder_id(),
        actor: session.user_id,
        version: Some(doc.version),
    }
}

pub struct InfostoreEngine {
    pub(crate) config: InfostoreConfig,
    db_path: String,
    conn: Mutex<Connection>,
    pub(crate) services: InfostoreServices,
    next_txid: AtomicU64,
}

impl InfostoreEngine {
    pub fn new(config: InfostoreConfig, services: InfostoreServices) -> InfostoreResult<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    InfostoreError::storage(format!("create {} failed", parent.display()), e)
                })?;
            }
        }
        let db_path = config.db_path.to_string_lossy().to_string();
        let conn = open_connection(&db_path)?;
        create_schema(&conn)?;
        info!("infostore engine opened: db={}", db_path);
        Ok(Self {
            config,
            db_path,
            conn: Mutex::new(conn),
            services,
            next_txid: AtomicU64::new(1),
        })
    }

    /// Engine over local services, with folders managed by the returned directory.
    pub fn open_local(config: InfostoreConfig) -> InfostoreResult<(Self, Arc<FolderDirectory>)> {
        let folders = Arc::new(FolderDirectory::new());
        let services = InfostoreServices::local(&config, folders.clone())?;
        Ok((Self::new(config, services)?, folders))
    }

    pub fn config(&self) -> &InfostoreConfig {
        &self.config
    }

    pub fn services(&self) -> &InfostoreServices {
        &self.services
    }

    pub fn begin(&self) -> InfostoreResult<InfostoreTransaction> {
        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        let conn = open_txn_connection(&self.db_path)?;
        InfostoreTransaction::begin(
            txid,
            conn,
            TxParticipants {
                permissions: self.services.permissions.clone(),
                locks: self.services.locks.clone(),
                blobs: self.services.blobs.clone(),
                guest_cleanup: self.services.guest_cleanup.clone(),
                events: self.services.events.clone(),
            },
        )
    }

    /// Run `f` in a fresh transaction, committing on success and rolling back on error.
    pub fn with_transaction<T, F>(&self, f: F) -> InfostoreResult<T>
    where
        F: FnOnce(&mut InfostoreTransaction) -> InfostoreResult<T>,
    {
        let mut tx = self.begin()?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!("rollback after failure failed! {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    pub(crate) fn read_conn(&self) -> InfostoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| InfostoreError::Internal(format!("read connection poisoned: {}", e)))
    }

    // ========== shared checks ==========

    /// The folder, provided it can hold documents.
    pub(crate) fn infostore_folder(
        &self,
        context_id: ContextId,
        folder_id: FolderId,
    ) -> InfostoreResult<FolderInfo> {
        let folder = self.services.folders.folder(context_id, folder_id)?;
        if !folder.accepts_documents() {
            return Err(InfostoreError::NotInfostoreFolder(folder_id));
        }
        Ok(folder)
    }

    pub(crate) fn quota_owner_of(
        &self,
        context_id: ContextId,
        folder_id: FolderId,
    ) -> InfostoreResult<QuotaOwner> {
        Ok(self
            .services
            .folders
            .folder(context_id, folder_id)?
            .quota_owner(context_id))
    }

    pub(crate) fn effective_permission(
        &self,
        conn: &Connection,
        session: &Session,
        doc: &DocumentMetadata,
    ) -> InfostoreResult<(EffectivePermission, Vec<ObjectPermission>)> {
        let object_permissions = db::object_permissions(conn, session.context_id, doc.id)?;
        let folder = self
            .services
            .permissions
            .folder_permission(session, doc.physical_folder_id())?;
        Ok((
            EffectivePermission::new(session, doc.id, doc.created_by, folder, &object_permissions),
            object_permissions,
        ))
    }

    /// A save is refused while someone else holds a lock, unless the actor
    /// was the last one to modify the document.
    pub(crate) fn check_write_lock(
        &self,
        session: &Session,
        doc: &DocumentMetadata,
    ) -> InfostoreResult<()> {
        if doc.modified_by == session.user_id {
            return Ok(());
        }
        let locks = self.services.locks.find_locks(session.context_id, doc.id)?;
        if locks.iter().any(|lock| lock.owner != session.user_id) {
            return Err(InfostoreError::Locked(doc.id));
        }
        Ok(())
    }

    /// Claim a filename for the rest of the transaction.
    pub(crate) fn reserve_filename(
        &self,
        tx: &mut InfostoreTransaction,
        request: &ReservationRequest<'_>,
    ) -> InfostoreResult<FilenameReservation> {
        match self.services.reserver.reserve(request)? {
            ReservationOutcome::Reserved(reservation) => {
                let guard = ReservationGuard::new(self.services.reserver.clone(), reservation);
                let reservation = guard.reservation().clone();
                tx.hold_reservation(guard);
                Ok(reservation)
            }
            ReservationOutcome::Conflict {
                filename,
                folder_id,
                conflicting_id,
                suggested,
            } => Err(InfostoreError::FilenameNotUnique {
                filename,
                folder_id,
                conflicting_id,
                suggested,
            }),
        }
    }

    // ========== reads ==========

    pub(crate) fn load_readable(
        &self,
        conn: &Connection,
        session: &Session,
        id: DocumentId,
        version: i32,
        via_folder: Option<FolderId>,
    ) -> InfostoreResult<DocumentMetadata> {
        let context_id = session.context_id;
        let mut doc = match db::load_document(conn, context_id, id, version)? {
            Some(doc) => doc,
            None if version != CURRENT_VERSION && db::exists(conn, context_id, id)? => {
                return Err(InfostoreError::VersionNotFound(id, version));
            }
            None => return Err(InfostoreError::DocumentNotFound(id)),
        };
        let (permission, object_permissions) = self.effective_permission(conn, session, &doc)?;
        if !permission.can_read() {
            return Err(InfostoreError::ReadDenied(id));
        }
        doc.object_permissions = Some(object_permissions);
        if via_folder == Some(SHARED_FOLDER_ID) || permission.is_shared_access_only() {
            present_shared(&mut doc);
        } else {
            doc.shareable = permission.can_share();
        }
        Ok(doc)
    }

    fn decorate_document(
        &self,
        conn: &Connection,
        session: &Session,
        doc: &mut DocumentMetadata,
    ) -> InfostoreResult<()> {
        let ctx = LoadContext {
            conn,
            session,
            now: unix_timestamp_millis(),
        };
        VersionCountLoader.add_to_document(doc, &ctx)?;
        LockExpiryLoader::new(self.services.locks.clone()).add_to_document(doc, &ctx)?;
        if let Some(resolver) = self.services.identities.as_ref() {
            let sources = [doc.clone()];
            IdentityLoader::new(resolver.clone(), &sources).add_to_document(doc, &ctx)?;
        }
        Ok(())
    }

    fn open_content(
        &self,
        context_id: ContextId,
        doc: &DocumentMetadata,
        range: Option<Range<u64>>,
    ) -> InfostoreResult<BlobReader> {
        let Some(location) = doc.filestore_location.as_deref() else {
            return Ok(Box::new(std::io::empty()));
        };
        let owner = self.quota_owner_of(context_id, doc.physical_folder_id())?;
        self.services.blobs.read(&owner, location, range)
    }

    fn emit_access(&self, session: &Session, doc: &DocumentMetadata) {
        let event = document_event(InfostoreEventKind::Accessed, session, doc);
        for sink in self.services.events.iter() {
            sink.handle(&event);
        }
    }

    /// Metadata of one version; `CURRENT_VERSION` for the current one.
    /// Pass `Some(SHARED_FOLDER_ID)` as `via_folder` to address the document
    /// through the shared folder.
    pub fn get_document_metadata(
        &self,
        session: &Session,
        id: DocumentId,
        version: i32,
        via_folder: Option<FolderId>,
    ) -> InfostoreResult<DocumentMetadata> {
        let conn = self.read_conn()?;
        let mut doc = self.load_readable(&conn, session, id, version, via_folder)?;
        self.decorate_document(&conn, session, &mut doc)?;
        Ok(doc)
    }

    /// Metadata plus content. A `client_etag` equal to the document's E-Tag
    /// skips the content.
    pub fn get_document_and_metadata(
        &self,
        session: &Session,
        id: DocumentId,
        version: i32,
        via_folder: Option<FolderId>,
        client_etag: Option<&str>,
    ) -> InfostoreResult<(DocumentMetadata, Option<BlobReader>)> {
        let doc = self.get_document_metadata(session, id, version, via_folder)?;
        if client_etag == Some(doc.etag().as_str()) {
            debug!("document {} not modified, etag {}", id, doc.etag());
            return Ok((doc, None));
        }
        let reader = self.open_content(session.context_id, &doc, None)?;
        self.emit_access(session, &doc);
        Ok((doc, Some(reader)))
    }

    /// Content of one version, optionally a byte range of it.
    pub fn get_document(
        &self,
        session: &Session,
        id: DocumentId,
        version: i32,
        range: Option<Range<u64>>,
    ) -> InfostoreResult<BlobReader> {
        let doc = {
            let conn = self.read_conn()?;
            self.load_readable(&conn, session, id, version, None)?
        };
        let reader = self.open_content(session.context_id, &doc, range)?;
        self.emit_access(session, &doc);
        Ok(reader)
    }

    // ========== queries ==========

    /// Documents of a folder, decorated lazily with the requested loaded fields.
    pub fn get_documents(
        &self,
        session: &Session,
        folder_id: FolderId,
        fields: &[Field],
        sort: Option<Field>,
        direction: SortDirection,
        range: Option<Range<usize>>,
    ) -> InfostoreResult<TimedResult<DecoratedDocuments>> {
        let (sequence_number, source) = if folder_id == SHARED_FOLDER_ID {
            let docs = {
                let conn = self.read_conn()?;
                self.shared_documents(&conn, session, range)?
            };
            let sequence_number = docs.iter().map(|d| d.sequence_number).max().unwrap_or(0);
            let source: Box<dyn Iterator<Item = InfostoreResult<DocumentMetadata>> + Send> =
                Box::new(docs.into_iter().map(Ok));
            (sequence_number, source)
        } else {
            let pages = self.folder_documents(session, folder_id, sort, direction, range)?;
            let sequence_number = {
                let conn = self.read_conn()?;
                db::folder_sequence_number(&conn, &pages.query, pages.range())?
            };
            let source: Box<dyn Iterator<Item = InfostoreResult<DocumentMetadata>> + Send> =
                Box::new(pages);
            (sequence_number, source)
        };

        let mut results = DecoratedDocuments::new(
            open_connection(&self.db_path)?,
            session.clone(),
            source,
            self.config.batch_size(),
        );
        if fields.contains(&Field::ObjectPermissions) && folder_id != SHARED_FOLDER_ID {
            results = results.with_decorator(Box::new(ObjectPermissionLoader));
        }
        if fields.contains(&Field::NumberOfVersions) {
            results = results.with_decorator(Box::new(VersionCountLoader));
        }
        if fields.contains(&Field::LockedUntil) {
            results = results.with_decorator(Box::new(LockExpiryLoader::new(
                self.services.locks.clone(),
            )));
        }
        if fields.contains(&Field::CreatedFrom) || fields.contains(&Field::ModifiedFrom) {
            if let Some(resolver) = self.services.identities.as_ref() {
                results = results.with_decorator(Box::new(IdentityDecorator::new(resolver.clone())));
            }
        }
        Ok(TimedResult {
            sequence_number,
            results,
        })
    }

    fn folder_documents(
        &self,
        session: &Session,
        folder_id: FolderId,
        sort: Option<Field>,
        direction: SortDirection,
        range: Option<Range<usize>>,
    ) -> InfostoreResult<FolderPages> {
        self.infostore_folder(session.context_id, folder_id)?;
        let permission = self.services.permissions.folder_permission(session, folder_id)?;
        if !permission.can_read_folder() {
            return Err(InfostoreError::FolderReadDenied(folder_id));
        }
        let mut query = FolderQuery::new(session.context_id, folder_id).sorted(sort, direction);
        if permission.read == AccessLevel::Own {
            query = query.created_by(session.user_id);
        }
        Ok(FolderPages {
            conn: open_connection(&self.db_path)?,
            session: session.clone(),
            permission,
            query,
            next: range.as_ref().map_or(0, |r| r.start),
            end: range.map(|r| r.end),
            page_size: self.config.batch_size(),
            page: Vec::new().into_iter(),
            exhausted: false,
        })
    }

    fn shared_documents(
        &self,
        conn: &Connection,
        session: &Session,
        range: Option<Range<usize>>,
    ) -> InfostoreResult<Vec<DocumentMetadata>> {
        let mut docs = db::list_shared_with(conn, session)?;
        let ctx = LoadContext {
            conn,
            session,
            now: unix_timestamp_millis(),
        };
        ObjectPermissionLoader.add_to_list(&mut docs, &ctx)?;
        docs.retain(|doc| {
            doc.object_permissions
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|p| p.can_read() && session.is_addressed_by(p))
        });
        for doc in docs.iter_mut() {
            present_shared(doc);
        }
        if let Some(range) = range {
            docs = docs
                .into_iter()
                .skip(range.start)
                .take(range.end.saturating_sub(range.start))
                .collect();
        }
        Ok(docs)
    }

    /// Every live version with content, newest first.
    pub fn get_versions(
        &self,
        session: &Session,
        id: DocumentId,
    ) -> InfostoreResult<Vec<DocumentMetadata>> {
        let conn = self.read_conn()?;
        let current = self.load_readable(&conn, session, id, CURRENT_VERSION, None)?;
        let mut versions = db::list_versions(&conn, session.context_id, id)?;
        for version in versions.iter_mut() {
            version.sequence_number = current.sequence_number;
            version.shareable = current.shareable;
            version.original_folder_id = current.original_folder_id;
            version.folder_id = current.folder_id;
        }
        Ok(versions)
    }

    /// New, modified and deleted documents of a folder since `since`.
    pub fn get_delta(
        &self,
        session: &Session,
        folder_id: FolderId,
        since: i64,
    ) -> InfostoreResult<Delta> {
        self.infostore_folder(session.context_id, folder_id)?;
        let permission = self.services.permissions.folder_permission(session, folder_id)?;
        if !permission.can_read_folder() {
            return Err(InfostoreError::FolderReadDenied(folder_id));
        }
        let own_only = permission.read == AccessLevel::Own;
        let visible = |doc: &DocumentMetadata| !own_only || doc.created_by == session.user_id;

        let conn = self.read_conn()?;
        let mut delta = Delta {
            sequence_number: since,
            ..Delta::default()
        };
        for doc in db::changed_since(&conn, session.context_id, folder_id, since)? {
            delta.sequence_number = delta.sequence_number.max(doc.sequence_number);
            if !visible(&doc) {
                continue;
            }
            if doc.creation_date > since {
                delta.new.push(doc);
            } else {
                delta.modified.push(doc);
            }
        }
        for tombstone in db::tombstones_since(&conn, session.context_id, folder_id, since)? {
            delta.sequence_number = delta.sequence_number.max(tombstone.sequence_number);
            if visible(&tombstone) {
                delta.deleted.push(tombstone);
            }
        }
        debug!(
            "delta of folder {} since {}: new={}, modified={}, deleted={}",
            folder_id,
            since,
            delta.new.len(),
            delta.modified.len(),
            delta.deleted.len()
        );
        Ok(delta)
    }

    pub fn exists(&self, session: &Session, id: DocumentId) -> InfostoreResult<bool> {
        let conn = self.read_conn()?;
        db::exists(&conn, session.context_id, id)
    }

    pub fn count_documents(&self, session: &Session, folder_id: FolderId) -> InfostoreResult<u64> {
        self.infostore_folder(session.context_id, folder_id)?;
        let permission = self.services.permissions.folder_permission(session, folder_id)?;
        if !permission.can_read_folder() {
            return Err(InfostoreError::FolderReadDenied(folder_id));
        }
        let conn = self.read_conn()?;
        db::count_documents(&conn, session.context_id, Some(folder_id))
    }

    pub fn get_used_storage(&self, owner: &QuotaOwner) -> InfostoreResult<u64> {
        self.services.blobs.usage(owner)
    }

    /// Object permissions a user still holds anywhere in the context.
    pub fn remaining_shares(&self, context_id: ContextId, entity: EntityId) -> InfostoreResult<u64> {
        let conn = self.read_conn()?;
        db::permission_count(&conn, context_id, entity)
    }
}

/// A folder listing read from its own connection one page at a time.
pub(crate) struct FolderPages {
    conn: Connection,
    session: Session,
    permission: FolderPermission,
    pub(crate) query: FolderQuery,
    next: usize,
    end: Option<usize>,
    page_size: usize,
    page: std::vec::IntoIter<DocumentMetadata>,
    exhausted: bool,
}

impl FolderPages {
    /// Rows not yet pulled from the database.
    pub(crate) fn range(&self) -> Option<Range<usize>> {
        self.end.map(|end| self.next..end)
    }

    fn fetch_page(&mut self) -> InfostoreResult<()> {
        let limit = match self.end {
            Some(end) => end.saturating_sub(self.next).min(self.page_size),
            None => self.page_size,
        };
        if limit == 0 {
            self.exhausted = true;
            return Ok(());
        }
        let docs = db::list_folder(&self.conn, &self.query, Some(self.next..self.next + limit))?;
        if docs.len() < limit {
            self.exhausted = true;
        }
        self.next += docs.len();
        self.page = docs.into_iter();
        Ok(())
    }
}

impl Iterator for FolderPages {
    type Item = InfostoreResult<DocumentMetadata>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(mut doc) = self.page.next() {
                doc.shareable = EffectivePermission::new(
                    &self.session,
                    doc.id,
                    doc.created_by,
                    self.permission,
                    &[],
                )
                .can_share();
                return Some(Ok(doc));
            }
            if self.exhausted {
                return None;
            }
            if let Err(err) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
    }
}
