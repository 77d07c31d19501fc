use crate::db;
use infostore_lib::{
    BlobStore, ContextId, InfostoreError, InfostoreResult, QuotaKind, QuotaLimits, QuotaOwner,
    QuotaProvider,
};
use log::warn;
use rusqlite::Connection;
use std::collections::HashMap;

/// Limits from configuration, optionally overridden per quota owner.
#[derive(Default)]
pub struct ConfiguredQuota {
    max_files_per_context: Option<u64>,
    max_storage_per_owner: Option<u64>,
    overrides: HashMap<QuotaOwner, QuotaLimits>,
}

impl ConfiguredQuota {
    pub fn new(max_files_per_context: Option<u64>, max_storage_per_owner: Option<u64>) -> Self {
        Self {
            max_files_per_context,
            max_storage_per_owner,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, owner: QuotaOwner, limits: QuotaLimits) -> Self {
        self.overrides.insert(owner, limits);
        self
    }
}

impl QuotaProvider for ConfiguredQuota {
    fn limits(&self, owner: &QuotaOwner) -> InfostoreResult<QuotaLimits> {
        if let Some(limits) = self.overrides.get(owner) {
            return Ok(*limits);
        }
        Ok(QuotaLimits {
            max_files: self.max_files_per_context,
            max_storage: self.max_storage_per_owner,
        })
    }
}

/// Fails when one more document would exceed the context's file limit.
pub(crate) fn check_file_count(
    conn: &Connection,
    provider: &dyn QuotaProvider,
    context_id: ContextId,
) -> InfostoreResult<()> {
    let Some(limit) = provider.limits(&QuotaOwner::context(context_id))?.max_files else {
        return Ok(());
    };
    let usage = db::count_documents(conn, context_id, None)?;
    if usage >= limit {
        warn!(
            "quota: file limit reached in context {}: {}/{}",
            context_id, usage, limit
        );
        return Err(InfostoreError::QuotaExceeded {
            kind: QuotaKind::FileCount,
            usage,
            limit,
        });
    }
    Ok(())
}

/// Fails when the owner already used up its storage, before any byte is written.
pub(crate) fn check_storage(
    blobs: &dyn BlobStore,
    provider: &dyn QuotaProvider,
    owner: &QuotaOwner,
) -> InfostoreResult<()> {
    let Some(limit) = provider.limits(owner)?.max_storage else {
        return Ok(());
    };
    let usage = blobs.usage(owner)?;
    if usage >= limit {
        return Err(InfostoreError::QuotaExceeded {
            kind: QuotaKind::Storage,
            usage,
            limit,
        });
    }
    Ok(())
}

/// Post-write check; the caller discards the blob it just wrote on failure.
pub(crate) fn recheck_storage(
    blobs: &dyn BlobStore,
    provider: &dyn QuotaProvider,
    owner: &QuotaOwner,
) -> InfostoreResult<()> {
    let Some(limit) = provider.limits(owner)?.max_storage else {
        return Ok(());
    };
    let usage = blobs.usage(owner)?;
    if usage > limit {
        return Err(InfostoreError::QuotaExceeded {
            kind: QuotaKind::Storage,
            usage,
            limit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_wins() {
        let quota = ConfiguredQuota::new(Some(10), Some(100)).with_override(
            QuotaOwner::new(1, 5),
            QuotaLimits {
                max_files: None,
                max_storage: Some(1),
            },
        );
        assert_eq!(
            quota.limits(&QuotaOwner::context(1)).unwrap().max_files,
            Some(10)
        );
        assert_eq!(
            quota.limits(&QuotaOwner::new(1, 5)).unwrap().max_storage,
            Some(1)
        );
    }
}
