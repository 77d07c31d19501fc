//! Contracts of the subsystems the engine consumes.

use crate::{
    ContextId, DocumentId, EntityId, EntityInfo, FolderId, FolderPermission, InfostoreResult,
    Session,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::ops::Range;
use std::time::Duration;

pub type TxId = u64;

/// Lifecycle hooks mirrored from the engine's transaction.
pub trait Transactional: Send + Sync {
    fn start_transaction(&self, _txid: TxId) -> InfostoreResult<()> {
        Ok(())
    }

    fn commit(&self, _txid: TxId) -> InfostoreResult<()> {
        Ok(())
    }

    fn rollback(&self, _txid: TxId) -> InfostoreResult<()> {
        Ok(())
    }

    fn finish(&self, _txid: TxId) -> InfostoreResult<()> {
        Ok(())
    }
}

// ========== Permission ==========

pub trait PermissionEvaluator: Transactional {
    fn folder_permission(
        &self,
        session: &Session,
        folder_id: FolderId,
    ) -> InfostoreResult<FolderPermission>;

    fn folder_permissions(
        &self,
        session: &Session,
        folder_ids: &[FolderId],
    ) -> InfostoreResult<HashMap<FolderId, FolderPermission>> {
        let mut result = HashMap::with_capacity(folder_ids.len());
        for folder_id in folder_ids {
            if !result.contains_key(folder_id) {
                result.insert(*folder_id, self.folder_permission(session, *folder_id)?);
            }
        }
        Ok(result)
    }
}

// ========== Folders ==========

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FolderModule {
    Infostore,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FolderType {
    Private,
    Public,
    Shared,
    Trash,
    Virtual,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInfo {
    pub id: FolderId,
    pub module: FolderModule,
    pub folder_type: FolderType,
    pub owner: EntityId,
}

impl FolderInfo {
    /// Personal folders are charged to their owner, everything else to the context.
    pub fn quota_owner(&self, context_id: ContextId) -> QuotaOwner {
        match self.folder_type {
            FolderType::Private | FolderType::Trash => QuotaOwner::new(context_id, self.owner),
            _ => QuotaOwner::context(context_id),
        }
    }

    pub fn accepts_documents(&self) -> bool {
        self.module == FolderModule::Infostore && self.folder_type != FolderType::Virtual
    }
}

pub trait FolderResolver: Send + Sync {
    fn folder(&self, context_id: ContextId, folder_id: FolderId) -> InfostoreResult<FolderInfo>;
}

// ========== Quota ==========

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuotaOwner {
    pub context_id: ContextId,
    /// 0 for the context-wide store.
    pub owner_id: EntityId,
}

impl QuotaOwner {
    pub fn new(context_id: ContextId, owner_id: EntityId) -> Self {
        Self {
            context_id,
            owner_id,
        }
    }

    pub fn context(context_id: ContextId) -> Self {
        Self::new(context_id, 0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_files: Option<u64>,
    pub max_storage: Option<u64>,
}

pub trait QuotaProvider: Send + Sync {
    fn limits(&self, owner: &QuotaOwner) -> InfostoreResult<QuotaLimits>;
}

// ========== Blob store ==========

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlob {
    pub location: String,
    pub size: u64,
    /// Hex digest; `None` when it could not be computed cheaply (appends).
    pub checksum: Option<String>,
}

pub type BlobReader = Box<dyn Read + Send>;

pub trait BlobStore: Send + Sync {
    fn write(&self, owner: &QuotaOwner, data: &mut dyn Read) -> InfostoreResult<StoredBlob>;

    /// Append `data` to an existing blob at `offset`, which must equal its current size.
    fn append(
        &self,
        owner: &QuotaOwner,
        location: &str,
        data: &mut dyn Read,
        offset: u64,
    ) -> InfostoreResult<StoredBlob>;

    /// Cut a blob back to `size` bytes and restore its recorded checksum.
    /// Undoes an `append` whose transaction rolled back.
    fn truncate(
        &self,
        owner: &QuotaOwner,
        location: &str,
        size: u64,
        checksum: Option<&str>,
    ) -> InfostoreResult<()>;

    fn read(
        &self,
        owner: &QuotaOwner,
        location: &str,
        range: Option<Range<u64>>,
    ) -> InfostoreResult<BlobReader>;

    fn size(&self, owner: &QuotaOwner, location: &str) -> InfostoreResult<u64>;

    fn delete(&self, owner: &QuotaOwner, location: &str) -> InfostoreResult<bool>;

    /// Returns the locations that could not be deleted.
    fn delete_all(&self, owner: &QuotaOwner, locations: &[String]) -> InfostoreResult<Vec<String>> {
        let mut failed = Vec::new();
        for location in locations {
            if !self.delete(owner, location)? {
                failed.push(location.clone());
            }
        }
        Ok(failed)
    }

    fn usage(&self, owner: &QuotaOwner) -> InfostoreResult<u64>;
}

// ========== Locks ==========

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockScope {
    Exclusive,
    Shared,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    WriteLock,
    ReadLock,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: u64,
    pub context_id: ContextId,
    pub document_id: DocumentId,
    pub owner: EntityId,
    pub scope: LockScope,
    pub lock_type: LockType,
    pub created_at: i64,
    pub expires_at: i64,
}

impl Lock {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    pub fn remaining(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }
}

pub trait LockManager: Transactional {
    /// Unexpired locks held on the document.
    fn find_locks(&self, context_id: ContextId, document_id: DocumentId) -> InfostoreResult<Vec<Lock>>;

    fn find_locks_batch(
        &self,
        context_id: ContextId,
        document_ids: &[DocumentId],
    ) -> InfostoreResult<HashMap<DocumentId, Vec<Lock>>> {
        let mut result = HashMap::new();
        for id in document_ids {
            let locks = self.find_locks(context_id, *id)?;
            if !locks.is_empty() {
                result.insert(*id, locks);
            }
        }
        Ok(result)
    }

    fn is_locked(&self, context_id: ContextId, document_id: DocumentId) -> InfostoreResult<bool> {
        Ok(!self.find_locks(context_id, document_id)?.is_empty())
    }

    /// Takes effect at once; undone if `txid` rolls back.
    fn lock(
        &self,
        txid: TxId,
        context_id: ContextId,
        document_id: DocumentId,
        owner: EntityId,
        timeout: Duration,
        scope: LockScope,
        lock_type: LockType,
    ) -> InfostoreResult<u64>;

    /// Takes effect at once; the lock comes back if `txid` rolls back.
    fn unlock(&self, txid: TxId, context_id: ContextId, lock_id: u64) -> InfostoreResult<bool>;

    /// Drop every lock of the documents once `txid` commits.
    fn remove_all(
        &self,
        txid: TxId,
        context_id: ContextId,
        document_ids: &[DocumentId],
    ) -> InfostoreResult<()>;
}

pub trait LockExpiryListener: Send + Sync {
    fn lock_expired(&self, lock: &Lock);
}

// ========== Filename reservation ==========

#[derive(Clone, Debug)]
pub struct ReservationRequest<'a> {
    pub context_id: ContextId,
    pub folder_id: FolderId,
    /// The document the name is reserved for, `NEW` for creations.
    pub document_id: DocumentId,
    pub filename: &'a str,
    pub auto_adjust: bool,
    /// Whether the title currently mirrors the filename.
    pub title_mirrors_filename: bool,
    /// Lower-cased committed names of the folder, mapped to their owners.
    pub occupied: &'a BTreeMap<String, DocumentId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilenameReservation {
    pub id: u64,
    pub context_id: ContextId,
    pub folder_id: FolderId,
    pub requested: String,
    pub filename: String,
    pub adjusted: bool,
    /// The adjusted name should replace the title as well.
    pub adjust_title: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReservationOutcome {
    Reserved(FilenameReservation),
    /// The name is taken and adjusting was not allowed.
    Conflict {
        filename: String,
        folder_id: FolderId,
        conflicting_id: DocumentId,
        suggested: String,
    },
}

pub trait FilenameReserver: Send + Sync {
    fn reserve(&self, request: &ReservationRequest<'_>) -> InfostoreResult<ReservationOutcome>;

    /// Idempotent.
    fn release(&self, reservation_id: u64);
}

// ========== Ids ==========

pub trait IdGenerator: Send + Sync {
    fn next_id(&self, context_id: ContextId, kind: &str) -> InfostoreResult<i64>;
}

// ========== Events / cleanup / identity ==========

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfostoreEventKind {
    Created,
    Updated,
    Deleted,
    Accessed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfostoreEvent {
    pub kind: InfostoreEventKind,
    pub context_id: ContextId,
    pub document_id: DocumentId,
    pub folder_id: FolderId,
    pub actor: EntityId,
    pub version: Option<i32>,
}

pub trait EventSink: Send + Sync {
    fn handle(&self, event: &InfostoreEvent);
}

pub trait GuestCleanupScheduler: Send + Sync {
    fn schedule(&self, context_id: ContextId, entities: &BTreeSet<EntityId>) -> InfostoreResult<()>;
}

pub trait IdentityResolver: Send + Sync {
    fn resolve(
        &self,
        context_id: ContextId,
        entities: &[EntityId],
    ) -> InfostoreResult<HashMap<EntityId, EntityInfo>>;
}
