use crate::loader::{query_by_ids, LoadContext, MetadataLoader};
use infostore_lib::{DocumentId, DocumentMetadata, InfostoreResult};
use std::collections::HashMap;

/// Fills `number_of_versions`, not counting the placeholder version.
#[derive(Default)]
pub struct VersionCountLoader;

impl MetadataLoader for VersionCountLoader {
    type Value = u32;

    fn load(
        &self,
        ids: &[DocumentId],
        ctx: &LoadContext<'_>,
    ) -> InfostoreResult<HashMap<DocumentId, u32>> {
        let mut counts = HashMap::with_capacity(ids.len());
        query_by_ids(
            ctx,
            "SELECT infostore_id, COUNT(*) FROM document_versions
             WHERE cid = ? AND infostore_id IN ({ids})
             GROUP BY infostore_id",
            ids,
            |row| {
                let count: i64 = row.get(1)?;
                counts.insert(row.get(0)?, (count - 1).max(0) as u32);
                Ok(())
            },
        )?;
        Ok(counts)
    }

    fn set(&self, doc: &mut DocumentMetadata, value: Option<u32>) {
        doc.number_of_versions = Some(value.unwrap_or(0));
    }
}
