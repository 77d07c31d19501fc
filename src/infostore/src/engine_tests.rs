use crate::db;
use crate::{FolderDirectory, InfostoreConfig, InfostoreEngine, InfostoreServices, SaveOptions};
use infostore_lib::{
    AccessLevel, ContextId, DocumentMetadata, DocumentRef, EntityId, EventSink, Field, FolderId,
    FolderPermission, FolderType, GuestCleanupScheduler, InfostoreError, InfostoreEvent,
    InfostoreEventKind, InfostoreResult, LockScope, ObjectPermission, QuotaKind, Session,
    SortDirection, CURRENT_VERSION, NEW, PLACEHOLDER_VERSION, SHARED_FOLDER_ID,
};
use std::collections::BTreeSet;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const CTX: ContextId = 1;
const OWNER: EntityId = 5;
const COLLEAGUE: EntityId = 6;
const OUTSIDER: EntityId = 7;
/// May create and edit in F1 but not share.
const AUTHOR: EntityId = 8;
const F1: FolderId = 100;
const F2: FolderId = 200;

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<InfostoreEvent>>,
}

impl RecordingSink {
    fn kinds(&self) -> Vec<InfostoreEventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }
}

impl EventSink for RecordingSink {
    fn handle(&self, event: &InfostoreEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[derive(Default)]
struct RecordingCleanup {
    scheduled: Mutex<Vec<(ContextId, BTreeSet<EntityId>)>>,
}

impl RecordingCleanup {
    fn entities(&self) -> BTreeSet<EntityId> {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, entities)| entities.iter().copied())
            .collect()
    }
}

impl GuestCleanupScheduler for RecordingCleanup {
    fn schedule(&self, context_id: ContextId, entities: &BTreeSet<EntityId>) -> InfostoreResult<()> {
        self.scheduled
            .lock()
            .unwrap()
            .push((context_id, entities.clone()));
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    engine: Arc<InfostoreEngine>,
    folders: Arc<FolderDirectory>,
    sink: Arc<RecordingSink>,
    cleanups: Arc<RecordingCleanup>,
    owner: Session,
}

fn fixture_with(tweak: impl FnOnce(&mut InfostoreConfig)) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = InfostoreConfig::with_root(dir.path());
    tweak(&mut config);

    let folders = Arc::new(FolderDirectory::new());
    folders.add_folder(CTX, F1, FolderType::Public, OWNER).unwrap();
    folders.add_folder(CTX, F2, FolderType::Public, OWNER).unwrap();
    folders
        .grant(CTX, F1, COLLEAGUE, FolderPermission::owner())
        .unwrap();
    let author = FolderPermission {
        read: AccessLevel::All,
        write: AccessLevel::All,
        create_objects: true,
        ..FolderPermission::none()
    };
    folders.grant(CTX, F1, AUTHOR, author).unwrap();

    let sink = Arc::new(RecordingSink::default());
    let cleanups = Arc::new(RecordingCleanup::default());
    let services = InfostoreServices::local(&config, folders.clone())
        .unwrap()
        .with_event_sink(sink.clone())
        .with_guest_cleanup(cleanups.clone());
    let engine = InfostoreEngine::new(config, services).unwrap();
    Fixture {
        _dir: dir,
        engine: Arc::new(engine),
        folders,
        sink,
        cleanups,
        owner: Session::new(CTX, OWNER),
    }
}

fn fixture() -> Fixture {
    fixture_with(|_| {})
}

fn create_in(fx: &Fixture, folder_id: FolderId, filename: &str, content: &[u8]) -> DocumentMetadata {
    let mut doc = DocumentMetadata::new_in_folder(folder_id, filename);
    let mut data = Cursor::new(content.to_vec());
    fx.engine
        .with_transaction(|tx| {
            fx.engine
                .save_document(tx, &fx.owner, &mut doc, Some(&mut data), SaveOptions::default())
        })
        .unwrap();
    doc
}

fn read_all(fx: &Fixture, session: &Session, id: i64) -> Vec<u8> {
    let mut reader = fx
        .engine
        .get_document(session, id, CURRENT_VERSION, None)
        .unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).unwrap();
    buf
}

fn tombstones(fx: &Fixture, id: i64) -> (u64, Option<i64>) {
    let conn = fx.engine.read_conn().unwrap();
    (
        db::tombstone_count(&conn, CTX, id).unwrap(),
        db::latest_tombstone_time(&conn, CTX, id).unwrap(),
    )
}

#[test]
fn test_create_with_content() {
    let fx = fixture();
    let doc = create_in(&fx, F1, "notes.txt", b"hello");
    assert_eq!(doc.version, 1);
    assert!(doc.sequence_number > 0);

    let stored = fx
        .engine
        .get_document_metadata(&fx.owner, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(stored.filename.as_deref(), Some("notes.txt"));
    assert_eq!(stored.title, "notes.txt");
    assert_eq!(stored.version, 1);
    assert_eq!(stored.file_size, 5);
    assert_eq!(stored.sequence_number, doc.sequence_number);
    assert_eq!(stored.number_of_versions, Some(1));
    assert_eq!(read_all(&fx, &fx.owner, doc.id), b"hello");
    assert_eq!(fx.sink.kinds(), vec![InfostoreEventKind::Created, InfostoreEventKind::Accessed]);
}

#[test]
fn test_concurrent_same_name_creates() {
    let fx = fixture();
    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = fx.engine.clone();
        let session = fx.owner.clone();
        handles.push(thread::spawn(move || {
            let mut doc = DocumentMetadata::new_in_folder(F1, "report.txt");
            let mut data = Cursor::new(b"quarterly".to_vec());
            engine
                .with_transaction(|tx| {
                    engine.save_document(tx, &session, &mut doc, Some(&mut data), SaveOptions::default())
                })
                .map(|_| doc)
        }));
    }
    let mut names: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap().filename.unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["report (1).txt".to_string(), "report.txt".to_string()]);

    let listed: Vec<DocumentMetadata> = fx
        .engine
        .get_documents(&fx.owner, F1, &[], Some(Field::Filename), SortDirection::Ascending, None)
        .unwrap()
        .results
        .map(|d| d.unwrap())
        .collect();
    assert_eq!(listed.len(), 2);
}

#[test]
fn test_append_keeps_version_and_drops_checksum() {
    let fx = fixture();
    let mut doc = create_in(&fx, F1, "log.txt", b"hello");
    assert!(doc.checksum.is_some());

    let mut more = Cursor::new(b" world".to_vec());
    fx.engine
        .with_transaction(|tx| {
            fx.engine.save_document(
                tx,
                &fx.owner,
                &mut doc,
                Some(&mut more),
                SaveOptions::default().append_at(5),
            )
        })
        .unwrap();

    let stored = fx
        .engine
        .get_document_metadata(&fx.owner, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.checksum, None);
    assert_eq!(stored.file_size, 11);
    assert_eq!(read_all(&fx, &fx.owner, doc.id), b"hello world");
}

#[test]
fn test_version_numbers_are_never_reused() {
    let fx = fixture();
    let mut doc = create_in(&fx, F1, "plan.txt", b"v1");
    let mut second = Cursor::new(b"v2".to_vec());
    fx.engine
        .with_transaction(|tx| {
            fx.engine
                .save_document(tx, &fx.owner, &mut doc, Some(&mut second), SaveOptions::default())
        })
        .unwrap();
    assert_eq!(doc.version, 2);

    let not_removed = fx
        .engine
        .with_transaction(|tx| fx.engine.remove_versions(tx, &fx.owner, doc.id, &[0, 1, 2, 9]))
        .unwrap();
    assert_eq!(not_removed, vec![0, 9]);
    let pruned = fx
        .engine
        .get_document_metadata(&fx.owner, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(pruned.version, 0);
    assert_eq!(pruned.file_size, 0);
    assert_eq!(pruned.filename.as_deref(), Some("plan.txt"));

    let mut doc = pruned;
    let mut third = Cursor::new(b"v3".to_vec());
    fx.engine
        .with_transaction(|tx| {
            fx.engine
                .save_document(tx, &fx.owner, &mut doc, Some(&mut third), SaveOptions::default())
        })
        .unwrap();
    assert_eq!(doc.version, 3);
    let versions = fx.engine.get_versions(&fx.owner, doc.id).unwrap();
    assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![3]);
}

#[test]
fn test_pruning_current_version_falls_back() {
    let fx = fixture();
    let mut doc = create_in(&fx, F1, "draft.txt", b"first");
    let mut second = Cursor::new(b"second!".to_vec());
    fx.engine
        .with_transaction(|tx| {
            fx.engine
                .save_document(tx, &fx.owner, &mut doc, Some(&mut second), SaveOptions::default())
        })
        .unwrap();

    fx.engine
        .with_transaction(|tx| fx.engine.remove_versions(tx, &fx.owner, doc.id, &[2]))
        .unwrap();
    let current = fx
        .engine
        .get_document_metadata(&fx.owner, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(current.version, 1);
    assert_eq!(current.file_size, 5);
    assert!(current.sequence_number > doc.sequence_number);
    assert_eq!(read_all(&fx, &fx.owner, doc.id), b"first");
}

#[test]
fn test_tolerant_delete_rejects_stale_horizon() {
    let fx = fixture();
    let doc = create_in(&fx, F1, "keep.txt", b"data");
    let item = DocumentRef::new(doc.id, F1);

    let mut rejected = Vec::new();
    let removed = fx
        .engine
        .with_transaction(|tx| {
            fx.engine.remove_documents(
                tx,
                &fx.owner,
                &[item],
                doc.sequence_number - 1,
                Some(&mut rejected),
            )
        })
        .unwrap();
    assert!(removed.is_empty());
    assert_eq!(rejected, vec![item]);
    assert!(fx.engine.exists(&fx.owner, doc.id).unwrap());
    let delta = fx.engine.get_delta(&fx.owner, F1, 0).unwrap();
    assert!(delta.deleted.is_empty());
    assert_eq!(tombstones(&fx, doc.id), (0, None));

    let strict = fx.engine.with_transaction(|tx| {
        fx.engine
            .remove_documents(tx, &fx.owner, &[item], doc.sequence_number - 1, None)
    });
    assert!(matches!(strict, Err(InfostoreError::ConcurrentModification(id)) if id == doc.id));
}

#[test]
fn test_delete_writes_tombstone_seen_by_delta() {
    let fx = fixture();
    let gone = create_in(&fx, F1, "gone.txt", b"bye");
    let stays = create_in(&fx, F1, "stays.txt", b"hi");
    let since = stays.sequence_number.max(gone.sequence_number);
    thread::sleep(Duration::from_millis(5));
    let removed_at = infostore_lib::unix_timestamp_millis();

    fx.engine
        .with_transaction(|tx| {
            fx.engine.remove_documents(
                tx,
                &fx.owner,
                &[DocumentRef::new(gone.id, F1)],
                i64::MAX,
                None,
            )
        })
        .unwrap();
    assert!(!fx.engine.exists(&fx.owner, gone.id).unwrap());

    let delta = fx.engine.get_delta(&fx.owner, F1, since).unwrap();
    assert!(delta.new.is_empty());
    assert!(delta.modified.is_empty());
    assert_eq!(delta.deleted.len(), 1);
    assert_eq!(delta.deleted[0].id, gone.id);
    assert!(delta.sequence_number > since);
    let (count, deleted_at) = tombstones(&fx, gone.id);
    assert_eq!(count, 1);
    assert!(deleted_at.unwrap() >= removed_at);

    // re-polling with the watermark sees nothing new
    let again = fx.engine.get_delta(&fx.owner, F1, delta.sequence_number).unwrap();
    assert!(again.deleted.is_empty());
    assert!(fx.sink.kinds().contains(&InfostoreEventKind::Deleted));
}

#[test]
fn test_move_conflict_without_auto_rename() {
    let fx = fixture_with(|config| config.auto_rename = false);
    let moving = create_in(&fx, F1, "same.txt", b"one");
    let blocking = create_in(&fx, F2, "same.txt", b"two");

    let result = fx.engine.with_transaction(|tx| {
        fx.engine.move_documents(
            tx,
            &fx.owner,
            &[DocumentRef::new(moving.id, F1)],
            F2,
            i64::MAX,
            None,
        )
    });
    match result {
        Err(InfostoreError::FilenameNotUnique {
            conflicting_id,
            suggested,
            ..
        }) => {
            assert_eq!(conflicting_id, blocking.id);
            assert_eq!(suggested, "same (1).txt");
        }
        other => panic!("unexpected result: {:?}", other),
    }

    let stored = fx
        .engine
        .get_document_metadata(&fx.owner, moving.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(stored.folder_id, F1);
    assert!(fx.engine.get_delta(&fx.owner, F1, 0).unwrap().deleted.is_empty());
    assert_eq!(tombstones(&fx, moving.id).0, 0);
}

#[test]
fn test_move_adjusts_name_and_tombstones_source() {
    let fx = fixture();
    let moving = create_in(&fx, F1, "same.txt", b"one");
    create_in(&fx, F2, "same.txt", b"two");

    let moved = fx
        .engine
        .with_transaction(|tx| {
            fx.engine.move_documents(
                tx,
                &fx.owner,
                &[DocumentRef::new(moving.id, F1)],
                F2,
                i64::MAX,
                None,
            )
        })
        .unwrap();
    assert_eq!(moved, vec![moving.id]);

    let stored = fx
        .engine
        .get_document_metadata(&fx.owner, moving.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(stored.folder_id, F2);
    assert_eq!(stored.filename.as_deref(), Some("same (1).txt"));
    assert_eq!(read_all(&fx, &fx.owner, moving.id), b"one");

    let delta = fx.engine.get_delta(&fx.owner, F1, 0).unwrap();
    assert_eq!(delta.deleted.len(), 1);
    assert_eq!(delta.deleted[0].id, moving.id);
}

#[test]
fn test_file_quota_boundary() {
    let fx = fixture_with(|config| config.max_files_per_context = Some(2));
    create_in(&fx, F1, "a.txt", b"a");
    create_in(&fx, F1, "b.txt", b"b");

    let mut doc = DocumentMetadata::new_in_folder(F1, "c.txt");
    let result = fx.engine.with_transaction(|tx| {
        fx.engine
            .save_document(tx, &fx.owner, &mut doc, None, SaveOptions::default())
    });
    assert!(matches!(
        result,
        Err(InfostoreError::QuotaExceeded {
            kind: QuotaKind::FileCount,
            usage: 2,
            limit: 2,
        })
    ));
    assert_eq!(fx.engine.count_documents(&fx.owner, F1).unwrap(), 2);
}

#[test]
fn test_storage_quota_allows_filling_up_to_limit() {
    let fx = fixture_with(|config| config.max_storage_per_owner = Some(5));
    create_in(&fx, F1, "full.txt", b"12345");

    let mut doc = DocumentMetadata::new_in_folder(F1, "more.txt");
    let mut data = Cursor::new(b"6".to_vec());
    let result = fx.engine.with_transaction(|tx| {
        fx.engine
            .save_document(tx, &fx.owner, &mut doc, Some(&mut data), SaveOptions::default())
    });
    assert!(matches!(
        result,
        Err(InfostoreError::QuotaExceeded {
            kind: QuotaKind::Storage,
            ..
        })
    ));
}

#[test]
fn test_stale_sequence_number_conflicts() {
    let fx = fixture();
    let doc = create_in(&fx, F1, "shared.txt", b"x");

    let mut stale = doc.clone();
    stale.title = "stale".to_string();
    let result = fx.engine.with_transaction(|tx| {
        fx.engine.save_document(
            tx,
            &fx.owner,
            &mut stale,
            None,
            SaveOptions::default()
                .columns([Field::Title])
                .sequence(doc.sequence_number - 1),
        )
    });
    assert!(matches!(result, Err(InfostoreError::ConcurrentModification(id)) if id == doc.id));

    let mut fresh = doc.clone();
    fresh.title = "fresh".to_string();
    fx.engine
        .with_transaction(|tx| {
            fx.engine.save_document(
                tx,
                &fx.owner,
                &mut fresh,
                None,
                SaveOptions::default()
                    .columns([Field::Title])
                    .sequence(doc.sequence_number),
            )
        })
        .unwrap();
    assert_eq!(fresh.title, "fresh");
    assert!(fresh.sequence_number > doc.sequence_number);
}

#[test]
fn test_etag_short_circuits_content() {
    let fx = fixture();
    let mut doc = create_in(&fx, F1, "cached.txt", b"abc");

    let (first, reader) = fx
        .engine
        .get_document_and_metadata(&fx.owner, doc.id, CURRENT_VERSION, None, None)
        .unwrap();
    assert!(reader.is_some());
    let etag = first.etag();

    let (_, reader) = fx
        .engine
        .get_document_and_metadata(&fx.owner, doc.id, CURRENT_VERSION, None, Some(&etag))
        .unwrap();
    assert!(reader.is_none());

    doc.description = "changed".to_string();
    fx.engine
        .with_transaction(|tx| {
            fx.engine.save_document(
                tx,
                &fx.owner,
                &mut doc,
                None,
                SaveOptions::default().columns([Field::Description]),
            )
        })
        .unwrap();
    let (after, reader) = fx
        .engine
        .get_document_and_metadata(&fx.owner, doc.id, CURRENT_VERSION, None, Some(&etag))
        .unwrap();
    assert_ne!(after.etag(), etag);
    assert!(reader.is_some());
}

#[test]
fn test_rollback_keeps_scheduled_blob() {
    let fx = fixture();
    let doc = create_in(&fx, F1, "precious.txt", b"keep me");

    let mut tx = fx.engine.begin().unwrap();
    fx.engine
        .remove_documents(&mut tx, &fx.owner, &[DocumentRef::new(doc.id, F1)], i64::MAX, None)
        .unwrap();
    assert_eq!(tx.pending_blob_deletions(), 1);
    tx.rollback().unwrap();

    assert!(fx.engine.exists(&fx.owner, doc.id).unwrap());
    assert_eq!(read_all(&fx, &fx.owner, doc.id), b"keep me");
    assert!(!fx.sink.kinds().contains(&InfostoreEventKind::Deleted));
}

#[test]
fn test_lock_blocks_other_writers() {
    let fx = fixture();
    let doc = create_in(&fx, F1, "locked.txt", b"l");
    let colleague = Session::new(CTX, COLLEAGUE);

    fx.engine
        .with_transaction(|tx| {
            fx.engine
                .lock(tx, &fx.owner, doc.id, Some(Duration::from_secs(60)), LockScope::Exclusive)
        })
        .unwrap();
    let locked = fx
        .engine
        .get_document_metadata(&fx.owner, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert!(locked.locked_until.is_some());
    assert!(locked.sequence_number > doc.sequence_number);
    assert_eq!(fx.engine.get_locks(&colleague, doc.id).unwrap().len(), 1);

    let mut update = locked.clone();
    update.title = "mine now".to_string();
    let result = fx.engine.with_transaction(|tx| {
        fx.engine.save_document(
            tx,
            &colleague,
            &mut update,
            None,
            SaveOptions::default().columns([Field::Title]),
        )
    });
    assert!(matches!(result, Err(InfostoreError::Locked(id)) if id == doc.id));

    let result = fx
        .engine
        .with_transaction(|tx| fx.engine.unlock(tx, &colleague, doc.id));
    assert!(matches!(result, Err(InfostoreError::LockedByAnother(_))));

    let released = fx
        .engine
        .with_transaction(|tx| fx.engine.unlock(tx, &fx.owner, doc.id))
        .unwrap();
    assert!(released);
    assert!(fx.engine.get_locks(&fx.owner, doc.id).unwrap().is_empty());
}

#[test]
fn test_shared_document_appears_in_shared_folder() {
    let fx = fixture();
    let outsider = Session::new(CTX, OUTSIDER);
    let mut doc = DocumentMetadata::new_in_folder(F1, "for-you.txt");
    doc.object_permissions = Some(vec![ObjectPermission::reader(OUTSIDER)]);
    fx.engine
        .with_transaction(|tx| {
            fx.engine
                .save_document(tx, &fx.owner, &mut doc, None, SaveOptions::default())
        })
        .unwrap();

    assert!(matches!(
        fx.engine
            .get_documents(&outsider, F1, &[], None, SortDirection::Ascending, None),
        Err(InfostoreError::FolderReadDenied(F1))
    ));

    let shared: Vec<DocumentMetadata> = fx
        .engine
        .get_documents(&outsider, SHARED_FOLDER_ID, &[], None, SortDirection::Ascending, None)
        .unwrap()
        .results
        .map(|d| d.unwrap())
        .collect();
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].folder_id, SHARED_FOLDER_ID);
    assert_eq!(shared[0].original_folder_id, Some(F1));
    assert!(!shared[0].shareable);

    let single = fx
        .engine
        .get_document_metadata(&outsider, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(single.folder_id, SHARED_FOLDER_ID);
    assert_eq!(fx.engine.remaining_shares(CTX, OUTSIDER).unwrap(), 1);

    let mut update = single.clone();
    update.title = "no".to_string();
    let result = fx.engine.with_transaction(|tx| {
        fx.engine.save_document(
            tx,
            &outsider,
            &mut update,
            None,
            SaveOptions::default().columns([Field::Title]),
        )
    });
    assert!(matches!(result, Err(InfostoreError::WriteDenied(_))));
}

#[test]
fn test_listing_decorates_requested_fields() {
    let fx = fixture_with(|config| config.loader_batch_size = 2);
    for name in ["a.txt", "b.txt", "c.txt"] {
        create_in(&fx, F1, name, b"x");
    }
    let listed = fx
        .engine
        .get_documents(
            &fx.owner,
            F1,
            &[Field::NumberOfVersions, Field::ObjectPermissions],
            Some(Field::Filename),
            SortDirection::Descending,
            None,
        )
        .unwrap();
    let docs: Vec<DocumentMetadata> = listed.results.map(|d| d.unwrap()).collect();
    assert_eq!(
        docs.iter().map(|d| d.filename.clone().unwrap()).collect::<Vec<_>>(),
        vec!["c.txt", "b.txt", "a.txt"]
    );
    assert!(docs.iter().all(|d| d.number_of_versions == Some(1)));
    assert!(docs.iter().all(|d| d.object_permissions == Some(Vec::new())));
    assert_eq!(
        listed.sequence_number,
        docs.iter().map(|d| d.sequence_number).max().unwrap()
    );
}

#[test]
fn test_clear_folder_and_bulk_removal() {
    let fx = fixture();
    let locked = create_in(&fx, F1, "locked.txt", b"1");
    create_in(&fx, F1, "free.txt", b"2");
    fx.engine
        .with_transaction(|tx| {
            fx.engine
                .lock(tx, &fx.owner, locked.id, None, LockScope::Exclusive)
        })
        .unwrap();

    let colleague = Session::new(CTX, COLLEAGUE);
    let kept = fx
        .engine
        .with_transaction(|tx| fx.engine.clear_folder(tx, &colleague, F1, i64::MAX))
        .unwrap();
    assert_eq!(kept, vec![DocumentRef::new(locked.id, F1)]);
    assert_eq!(fx.engine.count_documents(&fx.owner, F1).unwrap(), 1);

    let removed = fx
        .engine
        .with_transaction(|tx| fx.engine.remove_folder_contents(tx, CTX, F1, 0))
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(fx.engine.count_documents(&fx.owner, F1).unwrap(), 0);
    assert!(fx.engine.get_locks(&fx.owner, locked.id).is_err());
}

#[test]
fn test_touch_after_lock_expiry() {
    let fx = fixture();
    let doc = create_in(&fx, F1, "touched.txt", b"t");
    assert!(fx.engine.touch_after_lock_expiry(CTX, doc.id).unwrap());
    let touched = fx
        .engine
        .get_document_metadata(&fx.owner, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert!(touched.sequence_number > doc.sequence_number);
    assert_eq!(touched.modified_by, OWNER);
    assert!(!fx.engine.touch_after_lock_expiry(CTX, 424242).unwrap());
}

fn share_with(fx: &Fixture, filename: &str, grant: ObjectPermission) -> DocumentMetadata {
    let mut doc = DocumentMetadata::new_in_folder(F1, filename);
    doc.object_permissions = Some(vec![grant]);
    let mut data = Cursor::new(b"shared".to_vec());
    fx.engine
        .with_transaction(|tx| {
            fx.engine
                .save_document(tx, &fx.owner, &mut doc, Some(&mut data), SaveOptions::default())
        })
        .unwrap();
    doc
}

#[test]
fn test_append_over_quota_restores_blob() {
    let fx = fixture_with(|config| config.max_storage_per_owner = Some(8));
    let doc = create_in(&fx, F1, "grow.txt", b"hello");

    let mut update = doc.clone();
    let mut too_much = Cursor::new(b" world!!!!".to_vec());
    let result = fx.engine.with_transaction(|tx| {
        fx.engine.save_document(
            tx,
            &fx.owner,
            &mut update,
            Some(&mut too_much),
            SaveOptions::default().append_at(5),
        )
    });
    assert!(matches!(
        result,
        Err(InfostoreError::QuotaExceeded {
            kind: QuotaKind::Storage,
            ..
        })
    ));

    let stored = fx
        .engine
        .get_document_metadata(&fx.owner, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(stored.file_size, 5);
    assert_eq!(read_all(&fx, &fx.owner, doc.id), b"hello");

    // the owner is back under its limit, so a fitting append goes through
    let mut update = stored.clone();
    let mut fits = Cursor::new(b"!!!".to_vec());
    fx.engine
        .with_transaction(|tx| {
            fx.engine.save_document(
                tx,
                &fx.owner,
                &mut update,
                Some(&mut fits),
                SaveOptions::default().append_at(5),
            )
        })
        .unwrap();
    assert_eq!(update.file_size, 8);
    assert_eq!(read_all(&fx, &fx.owner, doc.id), b"hello!!!");
}

#[test]
fn test_append_needs_existing_content() {
    let fx = fixture();
    let mut doc = DocumentMetadata::new_in_folder(F1, "empty.txt");
    fx.engine
        .with_transaction(|tx| {
            fx.engine
                .save_document(tx, &fx.owner, &mut doc, None, SaveOptions::default())
        })
        .unwrap();
    assert_eq!(doc.version, PLACEHOLDER_VERSION);

    let mut update = doc.clone();
    let mut data = Cursor::new(b"abc".to_vec());
    let result = fx.engine.with_transaction(|tx| {
        fx.engine.save_document(
            tx,
            &fx.owner,
            &mut update,
            Some(&mut data),
            SaveOptions::default().append_at(7),
        )
    });
    assert!(matches!(result, Err(InfostoreError::InvalidParam(_))));

    let stored = fx
        .engine
        .get_document_metadata(&fx.owner, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(stored.version, PLACEHOLDER_VERSION);
    assert_eq!(stored.file_size, 0);
}

#[test]
fn test_rolled_back_lock_is_released() {
    let fx = fixture();
    let doc = create_in(&fx, F1, "maybe.txt", b"m");

    let mut tx = fx.engine.begin().unwrap();
    fx.engine
        .lock(&mut tx, &fx.owner, doc.id, None, LockScope::Exclusive)
        .unwrap();
    tx.rollback().unwrap();

    assert!(fx.engine.get_locks(&fx.owner, doc.id).unwrap().is_empty());
    let stored = fx
        .engine
        .get_document_metadata(&fx.owner, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(stored.sequence_number, doc.sequence_number);

    // a rolled-back unlock leaves the lock in place
    fx.engine
        .with_transaction(|tx| fx.engine.lock(tx, &fx.owner, doc.id, None, LockScope::Exclusive))
        .unwrap();
    let mut tx = fx.engine.begin().unwrap();
    assert!(fx.engine.unlock(&mut tx, &fx.owner, doc.id).unwrap());
    tx.rollback().unwrap();
    assert_eq!(fx.engine.get_locks(&fx.owner, doc.id).unwrap().len(), 1);
}

#[test]
fn test_save_with_new_folder_moves_document() {
    let fx = fixture();
    let doc = share_with(&fx, "travels.txt", ObjectPermission::reader(OUTSIDER));
    assert_eq!(fx.engine.remaining_shares(CTX, OUTSIDER).unwrap(), 1);

    let mut update = doc.clone();
    update.folder_id = F2;
    fx.engine
        .with_transaction(|tx| {
            fx.engine.save_document(
                tx,
                &fx.owner,
                &mut update,
                None,
                SaveOptions::default().columns([Field::FolderId]),
            )
        })
        .unwrap();
    assert_eq!(update.folder_id, F2);
    assert_eq!(update.object_permissions, Some(Vec::new()));

    let stored = fx
        .engine
        .get_document_metadata(&fx.owner, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(stored.folder_id, F2);
    assert_eq!(read_all(&fx, &fx.owner, doc.id), b"shared");

    assert_eq!(tombstones(&fx, doc.id).0, 1);
    let delta = fx.engine.get_delta(&fx.owner, F1, 0).unwrap();
    assert_eq!(delta.deleted.len(), 1);
    assert_eq!(delta.deleted[0].id, doc.id);

    assert_eq!(fx.engine.remaining_shares(CTX, OUTSIDER).unwrap(), 0);
    assert!(fx.cleanups.entities().contains(&OUTSIDER));
}

#[test]
fn test_save_through_shared_folder_stays_in_place() {
    let fx = fixture();
    let doc = share_with(&fx, "edit-me.txt", ObjectPermission::writer(OUTSIDER));
    let outsider = Session::new(CTX, OUTSIDER);

    let mut update = fx
        .engine
        .get_document_metadata(&outsider, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(update.folder_id, SHARED_FOLDER_ID);
    update.title = "edited".to_string();
    fx.engine
        .with_transaction(|tx| {
            fx.engine.save_document(
                tx,
                &outsider,
                &mut update,
                None,
                SaveOptions::default().columns([Field::FolderId, Field::Title]),
            )
        })
        .unwrap();
    assert_eq!(update.folder_id, SHARED_FOLDER_ID);
    assert_eq!(update.original_folder_id, Some(F1));

    let stored = fx
        .engine
        .get_document_metadata(&fx.owner, doc.id, CURRENT_VERSION, None)
        .unwrap();
    assert_eq!(stored.folder_id, F1);
    assert_eq!(stored.title, "edited");
    assert_eq!(tombstones(&fx, doc.id).0, 0);
    assert_eq!(fx.engine.remaining_shares(CTX, OUTSIDER).unwrap(), 1);
}

#[test]
fn test_sharing_needs_share_permission() {
    let fx = fixture();
    let author = Session::new(CTX, AUTHOR);

    let mut doc = DocumentMetadata::new_in_folder(F1, "private.txt");
    doc.object_permissions = Some(vec![ObjectPermission::reader(OUTSIDER)]);
    let result = fx.engine.with_transaction(|tx| {
        fx.engine
            .save_document(tx, &author, &mut doc, None, SaveOptions::default())
    });
    assert!(matches!(result, Err(InfostoreError::ShareDenied(id)) if id == NEW));
    assert_eq!(fx.engine.count_documents(&fx.owner, F1).unwrap(), 0);

    let created = create_in(&fx, F1, "team.txt", b"t");
    let mut update = created.clone();
    update.object_permissions = Some(vec![ObjectPermission::reader(OUTSIDER)]);
    let result = fx.engine.with_transaction(|tx| {
        fx.engine.save_document(
            tx,
            &author,
            &mut update,
            None,
            SaveOptions::default().columns([Field::ObjectPermissions]),
        )
    });
    assert!(matches!(result, Err(InfostoreError::ShareDenied(id)) if id == created.id));
    assert_eq!(fx.engine.remaining_shares(CTX, OUTSIDER).unwrap(), 0);

    // plain edits stay allowed
    let mut update = created.clone();
    update.title = "renamed by author".to_string();
    fx.engine
        .with_transaction(|tx| {
            fx.engine.save_document(
                tx,
                &author,
                &mut update,
                None,
                SaveOptions::default().columns([Field::Title]),
            )
        })
        .unwrap();
}

#[test]
fn test_batch_move_adjusts_names_colliding_in_batch() {
    let fx = fixture();
    const F3: FolderId = 300;
    fx.folders
        .add_folder(CTX, F3, FolderType::Public, OWNER)
        .unwrap();
    let first = create_in(&fx, F1, "dup.txt", b"1");
    let second = create_in(&fx, F3, "dup.txt", b"3");

    let moved = fx
        .engine
        .with_transaction(|tx| {
            fx.engine.move_documents(
                tx,
                &fx.owner,
                &[DocumentRef::new(first.id, F1), DocumentRef::new(second.id, F3)],
                F2,
                i64::MAX,
                None,
            )
        })
        .unwrap();
    assert_eq!(moved.len(), 2);

    let mut names: Vec<String> = fx
        .engine
        .get_documents(&fx.owner, F2, &[], Some(Field::Filename), SortDirection::Ascending, None)
        .unwrap()
        .results
        .map(|d| d.unwrap().filename.unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["dup (1).txt".to_string(), "dup.txt".to_string()]);
}

#[test]
fn test_batch_move_rejects_names_colliding_in_batch_without_auto_rename() {
    let fx = fixture_with(|config| config.auto_rename = false);
    const F3: FolderId = 300;
    fx.folders
        .add_folder(CTX, F3, FolderType::Public, OWNER)
        .unwrap();
    let first = create_in(&fx, F1, "dup.txt", b"1");
    let second = create_in(&fx, F3, "dup.txt", b"3");

    let result = fx.engine.with_transaction(|tx| {
        fx.engine.move_documents(
            tx,
            &fx.owner,
            &[DocumentRef::new(first.id, F1), DocumentRef::new(second.id, F3)],
            F2,
            i64::MAX,
            None,
        )
    });
    assert!(matches!(result, Err(InfostoreError::FilenameNotUnique { .. })));
    assert_eq!(fx.engine.count_documents(&fx.owner, F2).unwrap(), 0);
    assert_eq!(tombstones(&fx, first.id).0, 0);
}

fn list_names(fx: &Fixture, session: &Session, range: Option<std::ops::Range<usize>>) -> (i64, Vec<String>) {
    let listing = fx
        .engine
        .get_documents(session, F1, &[], Some(Field::Filename), SortDirection::Ascending, range)
        .unwrap();
    let names = listing
        .results
        .map(|d| d.unwrap().filename.unwrap_or_default())
        .collect();
    (listing.sequence_number, names)
}

#[test]
fn test_listing_pages_through_folder() {
    let fx = fixture_with(|config| config.loader_batch_size = 2);
    let docs: Vec<DocumentMetadata> = ["e.txt", "c.txt", "a.txt", "d.txt", "b.txt"]
        .iter()
        .map(|name| create_in(&fx, F1, name, b"x"))
        .collect();
    let newest = docs.iter().map(|d| d.sequence_number).max().unwrap();

    let (sequence_number, names) = list_names(&fx, &fx.owner, None);
    assert_eq!(names, vec!["a.txt", "b.txt", "c.txt", "d.txt", "e.txt"]);
    assert_eq!(sequence_number, newest);

    let (sequence_number, names) = list_names(&fx, &fx.owner, Some(1..4));
    assert_eq!(names, vec!["b.txt", "c.txt", "d.txt"]);
    let window_newest = docs
        .iter()
        .filter(|d| names.contains(d.filename.as_ref().unwrap()))
        .map(|d| d.sequence_number)
        .max()
        .unwrap();
    assert_eq!(sequence_number, window_newest);

    let (sequence_number, names) = list_names(&fx, &fx.owner, Some(5..9));
    assert!(names.is_empty());
    assert_eq!(sequence_number, 0);
}

#[test]
fn test_listing_own_reader_ranges_over_own_documents() {
    let fx = fixture_with(|config| config.loader_batch_size = 1);
    let reader: EntityId = 9;
    fx.folders
        .grant(
            CTX,
            F1,
            reader,
            FolderPermission {
                read: AccessLevel::Own,
                write: AccessLevel::Own,
                create_objects: true,
                ..FolderPermission::none()
            },
        )
        .unwrap();
    let reader_session = Session::new(CTX, reader);

    create_in(&fx, F1, "a.txt", b"x");
    for name in ["b.txt", "c.txt", "d.txt"] {
        let mut doc = DocumentMetadata::new_in_folder(F1, name);
        let mut data = Cursor::new(b"x".to_vec());
        fx.engine
            .with_transaction(|tx| {
                fx.engine.save_document(
                    tx,
                    &reader_session,
                    &mut doc,
                    Some(&mut data),
                    SaveOptions::default(),
                )
            })
            .unwrap();
    }
    create_in(&fx, F1, "e.txt", b"x");

    let (_, names) = list_names(&fx, &reader_session, None);
    assert_eq!(names, vec!["b.txt", "c.txt", "d.txt"]);
    let (_, names) = list_names(&fx, &reader_session, Some(1..3));
    assert_eq!(names, vec!["c.txt", "d.txt"]);
}
