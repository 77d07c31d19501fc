use crate::loader::{DocumentDecorator, LoadContext, MetadataLoader};
use infostore_lib::{
    DocumentId, DocumentMetadata, EntityId, EntityInfo, IdentityResolver, InfostoreResult,
};
use log::warn;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub type Identities = (Option<EntityInfo>, Option<EntityInfo>);

/// Resolves creator and last modifier of a known set of documents.
///
/// Best effort: when asked for ids that do not match its source documents, or
/// when the resolver fails, it loads nothing.
pub struct IdentityLoader {
    resolver: Arc<dyn IdentityResolver>,
    actors: HashMap<DocumentId, (EntityId, EntityId)>,
}

impl IdentityLoader {
    pub fn new(resolver: Arc<dyn IdentityResolver>, documents: &[DocumentMetadata]) -> Self {
        Self {
            resolver,
            actors: documents
                .iter()
                .map(|doc| (doc.id, (doc.created_by, doc.modified_by)))
                .collect(),
        }
    }
}

impl MetadataLoader for IdentityLoader {
    type Value = Identities;

    fn load(
        &self,
        ids: &[DocumentId],
        ctx: &LoadContext<'_>,
    ) -> InfostoreResult<HashMap<DocumentId, Identities>> {
        if ids.len() != self.actors.len() || ids.iter().any(|id| !self.actors.contains_key(id)) {
            warn!(
                "identity loader: asked for {} ids but knows {} documents, skipping",
                ids.len(),
                self.actors.len()
            );
            return Ok(HashMap::new());
        }

        let entities: Vec<EntityId> = self
            .actors
            .values()
            .flat_map(|(created_by, modified_by)| [*created_by, *modified_by])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let resolved = match self.resolver.resolve(ctx.session.context_id, &entities) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("identity loader: resolve failed! {}", e);
                return Ok(HashMap::new());
            }
        };

        Ok(ids
            .iter()
            .filter_map(|id| {
                let (created_by, modified_by) = self.actors.get(id)?;
                Some((
                    *id,
                    (
                        resolved.get(created_by).cloned(),
                        resolved.get(modified_by).cloned(),
                    ),
                ))
            })
            .collect())
    }

    fn set(&self, doc: &mut DocumentMetadata, value: Option<Identities>) {
        let (created_from, modified_from) = value.unwrap_or((None, None));
        doc.created_from = created_from;
        doc.modified_from = modified_from;
    }
}

/// Identity decoration for streams: one loader per pulled window.
pub struct IdentityDecorator {
    resolver: Arc<dyn IdentityResolver>,
}

impl IdentityDecorator {
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { resolver }
    }
}

impl DocumentDecorator for IdentityDecorator {
    fn decorate(&self, docs: &mut [DocumentMetadata], ctx: &LoadContext<'_>) -> InfostoreResult<()> {
        IdentityLoader::new(self.resolver.clone(), docs).add_to_list(docs, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infostore_lib::{EntityKind, Session};
    use rusqlite::Connection;

    struct Directory;

    impl IdentityResolver for Directory {
        fn resolve(
            &self,
            _context_id: i64,
            entities: &[EntityId],
        ) -> InfostoreResult<HashMap<EntityId, EntityInfo>> {
            Ok(entities
                .iter()
                .map(|id| {
                    (
                        *id,
                        EntityInfo {
                            entity: *id,
                            kind: EntityKind::User,
                            display_name: format!("user {}", id),
                            email: None,
                        },
                    )
                })
                .collect())
        }
    }

    fn doc(id: DocumentId, created_by: EntityId, modified_by: EntityId) -> DocumentMetadata {
        DocumentMetadata {
            id,
            created_by,
            modified_by,
            ..DocumentMetadata::default()
        }
    }

    #[test]
    fn test_resolves_creator_and_modifier() {
        let conn = Connection::open_in_memory().unwrap();
        let session = Session::new(1, 5);
        let ctx = LoadContext {
            conn: &conn,
            session: &session,
            now: 0,
        };
        let mut docs = vec![doc(1, 5, 6), doc(2, 7, 7)];
        IdentityLoader::new(Arc::new(Directory), &docs)
            .add_to_list(&mut docs, &ctx)
            .unwrap();
        assert_eq!(docs[0].created_from.as_ref().unwrap().display_name, "user 5");
        assert_eq!(docs[0].modified_from.as_ref().unwrap().entity, 6);
        assert_eq!(docs[1].modified_from.as_ref().unwrap().entity, 7);
    }

    #[test]
    fn test_mismatched_ids_load_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        let session = Session::new(1, 5);
        let ctx = LoadContext {
            conn: &conn,
            session: &session,
            now: 0,
        };
        let loader = IdentityLoader::new(Arc::new(Directory), &[doc(1, 5, 6)]);
        assert!(loader.load(&[1, 2], &ctx).unwrap().is_empty());
    }
}
