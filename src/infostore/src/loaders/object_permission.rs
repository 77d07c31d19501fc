use crate::loader::{query_by_ids, LoadContext, MetadataLoader};
use infostore_lib::{DocumentId, DocumentMetadata, InfostoreResult, ObjectPermission};
use std::collections::HashMap;

/// Fills `object_permissions`; rows are grouped by document on this side.
#[derive(Default)]
pub struct ObjectPermissionLoader;

impl MetadataLoader for ObjectPermissionLoader {
    type Value = Vec<ObjectPermission>;

    fn load(
        &self,
        ids: &[DocumentId],
        ctx: &LoadContext<'_>,
    ) -> InfostoreResult<HashMap<DocumentId, Vec<ObjectPermission>>> {
        let mut grouped: HashMap<DocumentId, Vec<ObjectPermission>> = HashMap::new();
        query_by_ids(
            ctx,
            "SELECT document_id, permission_id, group_flag, bits FROM object_permissions
             WHERE cid = ? AND document_id IN ({ids})
             ORDER BY document_id, group_flag, permission_id",
            ids,
            |row| {
                grouped
                    .entry(row.get(0)?)
                    .or_default()
                    .push(ObjectPermission::new(
                        row.get(1)?,
                        row.get::<_, i64>(2)? != 0,
                        row.get::<_, i64>(3)? as u8,
                    ));
                Ok(())
            },
        )?;
        Ok(grouped)
    }

    fn set(&self, doc: &mut DocumentMetadata, value: Option<Vec<ObjectPermission>>) {
        doc.object_permissions = Some(value.unwrap_or_default());
    }
}
