use crate::loader::{LoadContext, MetadataLoader};
use infostore_lib::{DocumentId, DocumentMetadata, InfostoreResult, LockManager};
use std::collections::HashMap;
use std::sync::Arc;

/// Fills `locked_until` with now plus the longest remaining lock time.
pub struct LockExpiryLoader {
    locks: Arc<dyn LockManager>,
}

impl LockExpiryLoader {
    pub fn new(locks: Arc<dyn LockManager>) -> Self {
        Self { locks }
    }
}

impl MetadataLoader for LockExpiryLoader {
    type Value = i64;

    fn load(
        &self,
        ids: &[DocumentId],
        ctx: &LoadContext<'_>,
    ) -> InfostoreResult<HashMap<DocumentId, i64>> {
        let held = self.locks.find_locks_batch(ctx.session.context_id, ids)?;
        Ok(held
            .into_iter()
            .filter_map(|(id, locks)| {
                locks
                    .iter()
                    .map(|lock| lock.remaining(ctx.now))
                    .max()
                    .filter(|remaining| *remaining > 0)
                    .map(|remaining| (id, ctx.now + remaining))
            })
            .collect())
    }

    fn set(&self, doc: &mut DocumentMetadata, value: Option<i64>) {
        doc.locked_until = value;
    }
}
