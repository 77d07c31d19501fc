//! Document locks and sequence-number touches.

use crate::actions::{perform, TouchDocument};
use crate::db;
use crate::engine::{document_event, next_sequence, InfostoreEngine};
use crate::tx::InfostoreTransaction;
use infostore_lib::{
    ContextId, DocumentId, DocumentMetadata, InfostoreError, InfostoreEventKind, InfostoreResult,
    Lock, LockScope, LockType, Session, CURRENT_VERSION,
};
use log::{debug, info};
use std::time::Duration;

impl InfostoreEngine {
    fn writable_document(
        &self,
        tx: &InfostoreTransaction,
        session: &Session,
        id: DocumentId,
    ) -> InfostoreResult<DocumentMetadata> {
        let doc = db::load_document(tx.conn(), session.context_id, id, CURRENT_VERSION)?
            .ok_or(InfostoreError::DocumentNotFound(id))?;
        let (permission, _) = self.effective_permission(tx.conn(), session, &doc)?;
        if !permission.can_write() {
            return Err(InfostoreError::WriteDenied(id));
        }
        Ok(doc)
    }

    /// Bump the sequence number so clients notice the document changed.
    fn touch_document(
        &self,
        tx: &mut InfostoreTransaction,
        actor: &Session,
        doc: &mut DocumentMetadata,
    ) -> InfostoreResult<i64> {
        let sequence_number = next_sequence(doc.sequence_number);
        perform(
            tx.conn(),
            &TouchDocument {
                context_id: actor.context_id,
                id: doc.id,
                modified_by: actor.user_id,
                last_modified: sequence_number,
                sequence_number,
            },
        )?;
        doc.modified_by = actor.user_id;
        doc.last_modified = sequence_number;
        doc.sequence_number = sequence_number;
        tx.post_event(document_event(InfostoreEventKind::Updated, actor, doc));
        Ok(sequence_number)
    }

    /// Lock a document; `timeout` falls back to the configured default and
    /// is clamped to the configured maximum. Returns the lock id.
    pub fn lock(
        &self,
        tx: &mut InfostoreTransaction,
        session: &Session,
        id: DocumentId,
        timeout: Option<Duration>,
        scope: LockScope,
    ) -> InfostoreResult<u64> {
        tx.ensure_active()?;
        let mut doc = self.writable_document(tx, session, id)?;
        let timeout = self.config.lock_timeout(timeout);
        let lock_id = self.services.locks.lock(
            tx.txid(),
            session.context_id,
            id,
            session.user_id,
            timeout,
            scope,
            LockType::WriteLock,
        )?;
        self.touch_document(tx, session, &mut doc)?;
        info!(
            "document locked: id={}, lock={}, owner={}, timeout={:?}",
            id, lock_id, session.user_id, timeout
        );
        Ok(lock_id)
    }

    /// Release the caller's locks. `Ok(false)` if the document was not locked.
    pub fn unlock(
        &self,
        tx: &mut InfostoreTransaction,
        session: &Session,
        id: DocumentId,
    ) -> InfostoreResult<bool> {
        tx.ensure_active()?;
        let mut doc = self.writable_document(tx, session, id)?;
        let held = self.services.locks.find_locks(session.context_id, id)?;
        let (own, foreign): (Vec<Lock>, Vec<Lock>) = held
            .into_iter()
            .partition(|lock| lock.owner == session.user_id);
        if own.is_empty() {
            if foreign.is_empty() {
                return Ok(false);
            }
            return Err(InfostoreError::LockedByAnother(id));
        }
        for lock in own.iter() {
            self.services.locks.unlock(tx.txid(), session.context_id, lock.id)?;
        }
        self.touch_document(tx, session, &mut doc)?;
        info!("document unlocked: id={}, locks={}", id, own.len());
        Ok(true)
    }

    /// Advance a document's sequence number without changing it otherwise.
    pub fn touch(
        &self,
        tx: &mut InfostoreTransaction,
        session: &Session,
        id: DocumentId,
    ) -> InfostoreResult<i64> {
        tx.ensure_active()?;
        let mut doc = self.writable_document(tx, session, id)?;
        self.check_write_lock(session, &doc)?;
        self.touch_document(tx, session, &mut doc)
    }

    /// Runs in its own transaction on behalf of the last modifier.
    /// `Ok(false)` if the document is gone.
    pub fn touch_after_lock_expiry(
        &self,
        context_id: ContextId,
        id: DocumentId,
    ) -> InfostoreResult<bool> {
        self.with_transaction(|tx| {
            let Some(mut doc) = db::load_document(tx.conn(), context_id, id, CURRENT_VERSION)?
            else {
                debug!("lock expired on vanished document {}", id);
                return Ok(false);
            };
            let actor = Session::new(context_id, doc.modified_by);
            self.touch_document(tx, &actor, &mut doc)?;
            Ok(true)
        })
    }

    /// Unexpired locks of a document the caller may read.
    pub fn get_locks(&self, session: &Session, id: DocumentId) -> InfostoreResult<Vec<Lock>> {
        {
            let conn = self.read_conn()?;
            self.load_readable(&conn, session, id, CURRENT_VERSION, None)?;
        }
        self.services.locks.find_locks(session.context_id, id)
    }
}
