//! Batch loading of secondary per-document metadata.
//!
//! A loader fetches one kind of metadata for many documents in one go and
//! splices it onto a document, a list, or a lazily pulled result stream.
//! Decoration only fills fields; it never reorders or drops documents.

use infostore_lib::{DocumentId, DocumentMetadata, InfostoreResult, Session};
use log::debug;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use std::collections::{HashMap, VecDeque};

use crate::db::placeholders;

/// What a loader may consult while loading.
pub struct LoadContext<'a> {
    pub conn: &'a Connection,
    pub session: &'a Session,
    pub now: i64,
}

pub trait MetadataLoader {
    type Value: Clone;

    fn load(
        &self,
        ids: &[DocumentId],
        ctx: &LoadContext<'_>,
    ) -> InfostoreResult<HashMap<DocumentId, Self::Value>>;

    /// Splice a loaded value onto one document; `None` when nothing was found.
    fn set(&self, doc: &mut DocumentMetadata, value: Option<Self::Value>);

    fn add_to_document(
        &self,
        doc: &mut DocumentMetadata,
        ctx: &LoadContext<'_>,
    ) -> InfostoreResult<()> {
        let mut loaded = self.load(&[doc.id], ctx)?;
        let value = loaded.remove(&doc.id);
        self.set(doc, value);
        Ok(())
    }

    fn add_to_list(&self, docs: &mut [DocumentMetadata], ctx: &LoadContext<'_>) -> InfostoreResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut ids: Vec<DocumentId> = docs.iter().map(|d| d.id).collect();
        ids.sort_unstable();
        ids.dedup();
        let loaded = self.load(&ids, ctx)?;
        for doc in docs.iter_mut() {
            let value = loaded.get(&doc.id).cloned();
            self.set(doc, value);
        }
        Ok(())
    }
}

/// Object-safe view of a loader, used where loaders of different value
/// types are applied together.
pub trait DocumentDecorator: Send {
    fn decorate(&self, docs: &mut [DocumentMetadata], ctx: &LoadContext<'_>) -> InfostoreResult<()>;
}

impl<L> DocumentDecorator for L
where
    L: MetadataLoader + Send,
{
    fn decorate(&self, docs: &mut [DocumentMetadata], ctx: &LoadContext<'_>) -> InfostoreResult<()> {
        self.add_to_list(docs, ctx)
    }
}

/// Run `sql` once with `ids` bound to its single `{ids}` placeholder list and
/// hand every row to `process`.
///
/// The statement must take the context id as its first parameter.
pub(crate) fn query_by_ids<F>(
    ctx: &LoadContext<'_>,
    sql: &str,
    ids: &[DocumentId],
    mut process: F,
) -> InfostoreResult<()>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<()>,
{
    if ids.is_empty() {
        return Ok(());
    }
    let sql = sql.replace("{ids}", &placeholders(ids.len()));
    let mut values = Vec::with_capacity(ids.len() + 1);
    values.push(Value::Integer(ctx.session.context_id));
    values.extend(ids.iter().map(|id| Value::Integer(*id)));

    let mut stmt = ctx.conn.prepare(&sql).map_err(infostore_lib::map_db_err)?;
    let mut rows = stmt
        .query(params_from_iter(values.iter()))
        .map_err(infostore_lib::map_db_err)?;
    while let Some(row) = rows.next().map_err(infostore_lib::map_db_err)? {
        process(row).map_err(infostore_lib::map_db_err)?;
    }
    Ok(())
}

/// Lazily decorated stream of documents.
///
/// Pulls `batch_size` documents from the source at a time, runs every
/// decorator over that window, then hands the documents out one by one.
/// Owns its connection so it can outlive the call that created it.
pub struct DecoratedDocuments {
    conn: Connection,
    session: Session,
    source: Box<dyn Iterator<Item = InfostoreResult<DocumentMetadata>> + Send>,
    decorators: Vec<Box<dyn DocumentDecorator>>,
    batch_size: usize,
    window: VecDeque<InfostoreResult<DocumentMetadata>>,
    exhausted: bool,
}

impl DecoratedDocuments {
    pub(crate) fn new(
        conn: Connection,
        session: Session,
        source: Box<dyn Iterator<Item = InfostoreResult<DocumentMetadata>> + Send>,
        batch_size: usize,
    ) -> Self {
        Self {
            conn,
            session,
            source,
            decorators: Vec::new(),
            batch_size: batch_size.max(1),
            window: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_decorator(mut self, decorator: Box<dyn DocumentDecorator>) -> Self {
        self.decorators.push(decorator);
        self
    }

    fn fill_window(&mut self) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut failure = None;
        while batch.len() < self.batch_size {
            match self.source.next() {
                Some(Ok(doc)) => batch.push(doc),
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }

        if !batch.is_empty() {
            let ctx = LoadContext {
                conn: &self.conn,
                session: &self.session,
                now: infostore_lib::unix_timestamp_millis(),
            };
            for decorator in self.decorators.iter() {
                if let Err(e) = decorator.decorate(&mut batch, &ctx) {
                    self.window.push_back(Err(e));
                    self.exhausted = true;
                    return;
                }
            }
            debug!("decorated a window of {} documents", batch.len());
            self.window.extend(batch.into_iter().map(Ok));
        }
        if let Some(e) = failure {
            self.window.push_back(Err(e));
        }
    }
}

impl Iterator for DecoratedDocuments {
    type Item = InfostoreResult<DocumentMetadata>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.window.is_empty() && !self.exhausted {
            self.fill_window();
        }
        self.window.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct TitleLoader {
        calls: Arc<AtomicUsize>,
    }

    impl MetadataLoader for TitleLoader {
        type Value = String;

        fn load(
            &self,
            ids: &[DocumentId],
            _ctx: &LoadContext<'_>,
        ) -> InfostoreResult<HashMap<DocumentId, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ids
                .iter()
                .filter(|id| **id % 2 == 0)
                .map(|id| (*id, format!("doc-{}", id)))
                .collect())
        }

        fn set(&self, doc: &mut DocumentMetadata, value: Option<String>) {
            doc.title = value.unwrap_or_default();
        }
    }

    fn doc(id: DocumentId) -> DocumentMetadata {
        DocumentMetadata {
            id,
            ..DocumentMetadata::default()
        }
    }

    #[test]
    fn test_add_to_list_keeps_order() {
        let conn = Connection::open_in_memory().unwrap();
        let session = Session::new(1, 5);
        let ctx = LoadContext {
            conn: &conn,
            session: &session,
            now: 0,
        };
        let loader = TitleLoader {
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let mut docs = vec![doc(4), doc(1), doc(2)];
        loader.add_to_list(&mut docs, &ctx).unwrap();

        let ids: Vec<_> = docs.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![4, 1, 2]);
        assert_eq!(docs[0].title, "doc-4");
        assert_eq!(docs[1].title, "");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_is_decorated_per_window() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pulled = Arc::new(AtomicUsize::new(0));
        let pulled_in_source = pulled.clone();
        let source = (1..=5).map(move |id| {
            pulled_in_source.fetch_add(1, Ordering::SeqCst);
            Ok::<_, infostore_lib::InfostoreError>(doc(id))
        });
        let mut stream = DecoratedDocuments::new(
            Connection::open_in_memory().unwrap(),
            Session::new(1, 5),
            Box::new(source),
            2,
        )
        .with_decorator(Box::new(TitleLoader {
            calls: calls.clone(),
        }));

        let first = stream.next().unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(pulled.load(Ordering::SeqCst), 2);

        let rest: Vec<_> = stream.map(|d| d.unwrap()).collect();
        assert_eq!(rest.len(), 4);
        assert_eq!(rest[0].title, "doc-2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
