use crate::reservation::ReservationGuard;
use infostore_lib::{
    BlobStore, ContextId, EntityId, EventSink, GuestCleanupScheduler, InfostoreError,
    InfostoreEvent, InfostoreResult, LockManager, PermissionEvaluator, QuotaOwner, TxId,
};
use log::{debug, error, warn};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Length and checksum of a blob before this transaction appended to it.
struct AppendedBlob {
    owner: QuotaOwner,
    location: String,
    size: u64,
    checksum: Option<String>,
}

/// Participants a transaction fans its lifecycle out to.
#[derive(Clone)]
pub(crate) struct TxParticipants {
    pub permissions: Arc<dyn PermissionEvaluator>,
    pub locks: Arc<dyn LockManager>,
    pub blobs: Arc<dyn BlobStore>,
    pub guest_cleanup: Option<Arc<dyn GuestCleanupScheduler>>,
    pub events: Vec<Arc<dyn EventSink>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// One write transaction of the engine.
///
/// Owns its own connection (opened with `BEGIN IMMEDIATE`) and the per-request
/// accumulators: blob deletions and guest cleanups wait for a durable commit.
/// On rollback, blobs written inside the transaction are discarded and
/// appended blobs are cut back to their old length.
pub struct InfostoreTransaction {
    txid: TxId,
    conn: Connection,
    state: TxState,
    participants: TxParticipants,
    pending_blob_deletions: BTreeMap<QuotaOwner, Vec<String>>,
    written_blobs: Vec<(QuotaOwner, String)>,
    appended_blobs: Vec<AppendedBlob>,
    pending_guest_cleanup: BTreeMap<ContextId, BTreeSet<EntityId>>,
    pending_events: Vec<InfostoreEvent>,
    reservations: Vec<ReservationGuard>,
}

impl InfostoreTransaction {
    pub(crate) fn begin(
        txid: TxId,
        conn: Connection,
        participants: TxParticipants,
    ) -> InfostoreResult<Self> {
        participants.permissions.start_transaction(txid)?;
        participants.locks.start_transaction(txid)?;
        debug!("txn {} started", txid);
        Ok(Self {
            txid,
            conn,
            state: TxState::Active,
            participants,
            pending_blob_deletions: BTreeMap::new(),
            written_blobs: Vec::new(),
            appended_blobs: Vec::new(),
            pending_guest_cleanup: BTreeMap::new(),
            pending_events: Vec::new(),
            reservations: Vec::new(),
        })
    }

    pub fn txid(&self) -> TxId {
        self.txid
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn ensure_active(&self) -> InfostoreResult<()> {
        if self.state != TxState::Active {
            return Err(InfostoreError::InvalidState(format!(
                "transaction {} is {:?}",
                self.txid, self.state
            )));
        }
        Ok(())
    }

    /// The blob is removed only after the database commit succeeded.
    pub(crate) fn defer_blob_deletion(&mut self, owner: QuotaOwner, location: String) {
        self.pending_blob_deletions
            .entry(owner)
            .or_default()
            .push(location);
    }

    /// A blob created by this transaction; dropped again on rollback.
    pub(crate) fn track_written_blob(&mut self, owner: QuotaOwner, location: String) {
        self.written_blobs.push((owner, location));
    }

    /// Call before appending to an existing blob; rollback restores `size`.
    pub(crate) fn track_appended_blob(
        &mut self,
        owner: QuotaOwner,
        location: String,
        size: u64,
        checksum: Option<String>,
    ) {
        self.appended_blobs.push(AppendedBlob {
            owner,
            location,
            size,
            checksum,
        });
    }

    pub(crate) fn schedule_guest_cleanup<I>(&mut self, context_id: ContextId, entities: I)
    where
        I: IntoIterator<Item = EntityId>,
    {
        let pending = self.pending_guest_cleanup.entry(context_id).or_default();
        pending.extend(entities);
        if pending.is_empty() {
            self.pending_guest_cleanup.remove(&context_id);
        }
    }

    pub(crate) fn post_event(&mut self, event: InfostoreEvent) {
        self.pending_events.push(event);
    }

    /// Keep a filename claim alive until the transaction ends.
    pub(crate) fn hold_reservation(&mut self, guard: ReservationGuard) {
        self.reservations.push(guard);
    }

    pub fn pending_blob_deletions(&self) -> usize {
        self.pending_blob_deletions.values().map(|v| v.len()).sum()
    }

    pub fn commit(mut self) -> InfostoreResult<()> {
        self.ensure_active()?;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            error!("txn {} commit failed! {}", self.txid, e);
            self.abort();
            return Err(InfostoreError::db("commit failed", e));
        }
        self.state = TxState::Committed;

        if let Err(e) = self.participants.permissions.commit(self.txid) {
            warn!("txn {} permission commit failed: {}", self.txid, e);
        }
        if let Err(e) = self.participants.locks.commit(self.txid) {
            warn!("txn {} lock commit failed: {}", self.txid, e);
        }

        self.written_blobs.clear();
        self.appended_blobs.clear();
        let deletions = std::mem::take(&mut self.pending_blob_deletions);
        for (owner, locations) in deletions {
            match self.participants.blobs.delete_all(&owner, &locations) {
                Ok(failed) if !failed.is_empty() => {
                    warn!(
                        "txn {}: {} blobs of {:?} could not be deleted: {:?}",
                        self.txid,
                        failed.len(),
                        owner,
                        failed
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("txn {}: delete blobs of {:?} failed: {}", self.txid, owner, e),
            }
        }

        let cleanups = std::mem::take(&mut self.pending_guest_cleanup);
        if let Some(scheduler) = self.participants.guest_cleanup.as_ref() {
            for (context_id, entities) in cleanups {
                if let Err(e) = scheduler.schedule(context_id, &entities) {
                    warn!(
                        "txn {}: schedule guest cleanup in context {} failed: {}",
                        self.txid, context_id, e
                    );
                }
            }
        }

        let events = std::mem::take(&mut self.pending_events);
        for event in events.iter() {
            for sink in self.participants.events.iter() {
                sink.handle(event);
            }
        }

        self.finish();
        debug!("txn {} committed", self.txid);
        Ok(())
    }

    pub fn rollback(mut self) -> InfostoreResult<()> {
        self.ensure_active()?;
        self.abort();
        Ok(())
    }

    fn abort(&mut self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            // a failed COMMIT may already have ended the transaction
            debug!("txn {} rollback: {}", self.txid, e);
        }
        self.state = TxState::RolledBack;

        if let Err(e) = self.participants.permissions.rollback(self.txid) {
            warn!("txn {} permission rollback failed: {}", self.txid, e);
        }
        if let Err(e) = self.participants.locks.rollback(self.txid) {
            warn!("txn {} lock rollback failed: {}", self.txid, e);
        }

        // latest append first, so each blob ends at its pre-transaction length
        for appended in std::mem::take(&mut self.appended_blobs).into_iter().rev() {
            if let Err(e) = self.participants.blobs.truncate(
                &appended.owner,
                &appended.location,
                appended.size,
                appended.checksum.as_deref(),
            ) {
                warn!(
                    "txn {}: restore blob {} of {:?} to {} bytes failed: {}",
                    self.txid, appended.location, appended.owner, appended.size, e
                );
            }
        }
        for (owner, location) in std::mem::take(&mut self.written_blobs) {
            if let Err(e) = self.participants.blobs.delete(&owner, &location) {
                warn!(
                    "txn {}: discard blob {} of {:?} failed: {}",
                    self.txid, location, owner, e
                );
            }
        }
        self.pending_blob_deletions.clear();
        self.pending_guest_cleanup.clear();
        self.pending_events.clear();
        self.finish();
        debug!("txn {} rolled back", self.txid);
    }

    fn finish(&mut self) {
        if let Err(e) = self.participants.permissions.finish(self.txid) {
            warn!("txn {} permission finish failed: {}", self.txid, e);
        }
        if let Err(e) = self.participants.locks.finish(self.txid) {
            warn!("txn {} lock finish failed: {}", self.txid, e);
        }
        for mut guard in self.reservations.drain(..) {
            guard.clean_up();
        }
    }
}

impl Drop for InfostoreTransaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            warn!("txn {} dropped while active, rolling back", self.txid);
            self.abort();
        }
    }
}
