use infostore_lib::{
    unix_timestamp_millis, ContextId, DocumentId, EntityId, InfostoreError, InfostoreResult, Lock,
    LockExpiryListener, LockManager, LockScope, LockType, Transactional, TxId,
};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How to take back one lock change of a transaction.
enum LockUndo {
    Acquired(Lock),
    Refreshed(Lock),
    Released(Lock),
}

#[derive(Default)]
struct LockState {
    next_id: u64,
    locks: HashMap<(ContextId, DocumentId), Vec<Lock>>,
    staged_removals: HashMap<TxId, Vec<(ContextId, Vec<DocumentId>)>>,
    undo: HashMap<TxId, Vec<LockUndo>>,
}

impl LockState {
    fn record(&mut self, txid: TxId, undo: LockUndo) {
        self.undo.entry(txid).or_default().push(undo);
    }

    fn revert(&mut self, undo: LockUndo) {
        match undo {
            LockUndo::Acquired(lock) => self.drop_lock(&lock),
            LockUndo::Refreshed(previous) => {
                let key = (previous.context_id, previous.document_id);
                if let Some(held) = self.locks.get_mut(&key) {
                    if let Some(current) = held.iter_mut().find(|l| l.id == previous.id) {
                        *current = previous;
                    }
                }
            }
            LockUndo::Released(lock) => {
                let key = (lock.context_id, lock.document_id);
                self.locks.entry(key).or_default().push(lock);
            }
        }
    }

    fn drop_lock(&mut self, lock: &Lock) {
        let key = (lock.context_id, lock.document_id);
        if let Some(held) = self.locks.get_mut(&key) {
            held.retain(|l| l.id != lock.id);
            if held.is_empty() {
                self.locks.remove(&key);
            }
        }
    }

    /// Drop expired locks of one document and hand them back for notification.
    fn reap(&mut self, context_id: ContextId, document_id: DocumentId, now: i64) -> Vec<Lock> {
        let key = (context_id, document_id);
        let Some(held) = self.locks.get_mut(&key) else {
            return Vec::new();
        };
        let (expired, alive): (Vec<Lock>, Vec<Lock>) =
            held.drain(..).partition(|lock| lock.is_expired_at(now));
        if alive.is_empty() {
            self.locks.remove(&key);
        } else {
            *held = alive;
        }
        expired
    }
}

/// Wall-clock document locks with lazy expiry.
pub struct MemoryLockManager {
    state: Mutex<LockState>,
    listener: Option<Arc<dyn LockExpiryListener>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn LockExpiryListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    fn state(&self) -> InfostoreResult<MutexGuard<'_, LockState>> {
        self.state
            .lock()
            .map_err(|e| InfostoreError::Internal(format!("lock table poisoned: {}", e)))
    }

    fn notify_expired(&self, expired: Vec<Lock>) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        for lock in expired.iter() {
            debug!(
                "lock {} on document {} expired",
                lock.id, lock.document_id
            );
            listener.lock_expired(lock);
        }
    }
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Transactional for MemoryLockManager {
    fn commit(&self, txid: TxId) -> InfostoreResult<()> {
        let mut state = self.state()?;
        state.undo.remove(&txid);
        if let Some(staged) = state.staged_removals.remove(&txid) {
            for (context_id, document_ids) in staged {
                for document_id in document_ids {
                    state.locks.remove(&(context_id, document_id));
                }
            }
        }
        Ok(())
    }

    fn rollback(&self, txid: TxId) -> InfostoreResult<()> {
        let mut state = self.state()?;
        state.staged_removals.remove(&txid);
        if let Some(changes) = state.undo.remove(&txid) {
            debug!("lock manager: txn {} undoes {} lock changes", txid, changes.len());
            for undo in changes.into_iter().rev() {
                state.revert(undo);
            }
        }
        Ok(())
    }

    fn finish(&self, txid: TxId) -> InfostoreResult<()> {
        let mut state = self.state()?;
        if state.staged_removals.remove(&txid).is_some() {
            warn!("lock manager: txn {} finished with unapplied removals", txid);
        }
        state.undo.remove(&txid);
        Ok(())
    }
}

impl LockManager for MemoryLockManager {
    fn find_locks(&self, context_id: ContextId, document_id: DocumentId) -> InfostoreResult<Vec<Lock>> {
        let now = unix_timestamp_millis();
        let (expired, held) = {
            let mut state = self.state()?;
            let expired = state.reap(context_id, document_id, now);
            let held = state
                .locks
                .get(&(context_id, document_id))
                .cloned()
                .unwrap_or_default();
            (expired, held)
        };
        self.notify_expired(expired);
        Ok(held)
    }

    fn lock(
        &self,
        txid: TxId,
        context_id: ContextId,
        document_id: DocumentId,
        owner: EntityId,
        timeout: Duration,
        scope: LockScope,
        lock_type: LockType,
    ) -> InfostoreResult<u64> {
        let now = unix_timestamp_millis();
        let expires_at = now.saturating_add(timeout.as_millis() as i64);
        let key = (context_id, document_id);
        let (expired, result) = {
            let mut state = self.state()?;
            let expired = state.reap(context_id, document_id, now);
            let blocked = state
                .locks
                .get(&key)
                .map(|held| {
                    held.iter().any(|lock| {
                        lock.owner != owner
                            && (lock.scope == LockScope::Exclusive || scope == LockScope::Exclusive)
                    })
                })
                .unwrap_or(false);
            let result = if blocked {
                Err(InfostoreError::LockedByAnother(document_id))
            } else {
                state.next_id += 1;
                let next_id = state.next_id;
                let held = state.locks.entry(key).or_default();
                let (lock_id, undo) = match held.iter_mut().find(|lock| lock.owner == owner) {
                    Some(mine) => {
                        let previous = mine.clone();
                        mine.expires_at = expires_at;
                        mine.scope = scope;
                        mine.lock_type = lock_type;
                        (mine.id, LockUndo::Refreshed(previous))
                    }
                    None => {
                        let lock = Lock {
                            id: next_id,
                            context_id,
                            document_id,
                            owner,
                            scope,
                            lock_type,
                            created_at: now,
                            expires_at,
                        };
                        held.push(lock.clone());
                        (next_id, LockUndo::Acquired(lock))
                    }
                };
                state.record(txid, undo);
                Ok(lock_id)
            };
            (expired, result)
        };
        self.notify_expired(expired);
        result
    }

    fn unlock(&self, txid: TxId, context_id: ContextId, lock_id: u64) -> InfostoreResult<bool> {
        let mut state = self.state()?;
        let released = state
            .locks
            .iter()
            .filter(|(key, _)| key.0 == context_id)
            .flat_map(|(_, held)| held.iter())
            .find(|lock| lock.id == lock_id)
            .cloned();
        let Some(lock) = released else {
            return Ok(false);
        };
        state.drop_lock(&lock);
        state.record(txid, LockUndo::Released(lock));
        Ok(true)
    }

    fn remove_all(
        &self,
        txid: TxId,
        context_id: ContextId,
        document_ids: &[DocumentId],
    ) -> InfostoreResult<()> {
        if document_ids.is_empty() {
            return Ok(());
        }
        self.state()?
            .staged_removals
            .entry(txid)
            .or_default()
            .push((context_id, document_ids.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TX: TxId = 1;

    struct CountingListener(AtomicUsize);

    impl LockExpiryListener for CountingListener {
        fn lock_expired(&self, _lock: &Lock) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_exclusive_lock_blocks_other_owner() {
        let locks = MemoryLockManager::new();
        let id = locks
            .lock(TX, 1, 100, 5, Duration::from_secs(60), LockScope::Exclusive, LockType::WriteLock)
            .unwrap();
        assert!(locks
            .lock(TX, 1, 100, 6, Duration::from_secs(60), LockScope::Shared, LockType::ReadLock)
            .is_err());
        // relocking by the owner refreshes the same lock
        let again = locks
            .lock(TX, 1, 100, 5, Duration::from_secs(90), LockScope::Exclusive, LockType::WriteLock)
            .unwrap();
        assert_eq!(id, again);
        assert_eq!(locks.find_locks(1, 100).unwrap().len(), 1);

        assert!(locks.unlock(TX, 1, id).unwrap());
        assert!(!locks.unlock(TX, 1, id).unwrap());
        assert!(!locks.is_locked(1, 100).unwrap());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let locks = MemoryLockManager::new();
        locks
            .lock(TX, 1, 100, 5, Duration::from_secs(60), LockScope::Shared, LockType::ReadLock)
            .unwrap();
        locks
            .lock(TX, 1, 100, 6, Duration::from_secs(60), LockScope::Shared, LockType::ReadLock)
            .unwrap();
        assert_eq!(locks.find_locks(1, 100).unwrap().len(), 2);
    }

    #[test]
    fn test_expired_lock_is_reaped_and_reported() {
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        let locks = MemoryLockManager::new().with_listener(listener.clone());
        locks
            .lock(TX, 1, 100, 5, Duration::from_millis(10), LockScope::Exclusive, LockType::WriteLock)
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert!(locks.find_locks(1, 100).unwrap().is_empty());
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
        // already reaped, not reported twice
        assert!(locks.find_locks(1, 100).unwrap().is_empty());
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_all_applies_on_commit_only() {
        let locks = MemoryLockManager::new();
        locks
            .lock(TX, 1, 100, 5, Duration::from_secs(60), LockScope::Exclusive, LockType::WriteLock)
            .unwrap();

        locks.remove_all(7, 1, &[100]).unwrap();
        locks.rollback(7).unwrap();
        assert!(locks.is_locked(1, 100).unwrap());

        locks.remove_all(8, 1, &[100]).unwrap();
        locks.commit(8).unwrap();
        assert!(!locks.is_locked(1, 100).unwrap());
    }

    #[test]
    fn test_rollback_undoes_lock_and_unlock() {
        let locks = MemoryLockManager::new();
        locks
            .lock(2, 1, 100, 5, Duration::from_secs(60), LockScope::Exclusive, LockType::WriteLock)
            .unwrap();
        locks.rollback(2).unwrap();
        assert!(!locks.is_locked(1, 100).unwrap());

        let id = locks
            .lock(3, 1, 100, 5, Duration::from_secs(60), LockScope::Exclusive, LockType::WriteLock)
            .unwrap();
        locks.commit(3).unwrap();

        // a refresh rolled back keeps the old expiry
        let before = locks.find_locks(1, 100).unwrap()[0].expires_at;
        locks
            .lock(4, 1, 100, 5, Duration::from_secs(600), LockScope::Exclusive, LockType::WriteLock)
            .unwrap();
        locks.rollback(4).unwrap();
        assert_eq!(locks.find_locks(1, 100).unwrap()[0].expires_at, before);

        assert!(locks.unlock(5, 1, id).unwrap());
        assert!(!locks.is_locked(1, 100).unwrap());
        locks.rollback(5).unwrap();
        let held = locks.find_locks(1, 100).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].id, id);
    }
}
