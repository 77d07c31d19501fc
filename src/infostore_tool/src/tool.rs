use infostore::{
    BackgroundMgr, BackgroundTaskKind, BackgroundTaskPolicy, EngineTaskExecutor, FolderDirectory,
    InfostoreConfig, InfostoreEngine, InfostoreServices, MemoryLockManager, QueuedGuestCleanup,
    SaveOptions, TouchOnLockExpiry, DEFAULT_INFOSTORE_CONFIG_PATH,
};
use infostore_lib::{
    ContextId, DocumentId, DocumentMetadata, DocumentRef, EntityId, FolderId, FolderType,
    InfostoreError, InfostoreResult, LockScope, Session, SortDirection, CURRENT_VERSION,
};
use log::{info, warn};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Runtime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCommand {
    Put {
        folder_id: FolderId,
        source: PathBuf,
        filename: Option<String>,
        update: Option<DocumentId>,
    },
    Get {
        id: DocumentId,
        version: i32,
        out: Option<PathBuf>,
    },
    Stat {
        id: DocumentId,
    },
    List {
        folder_id: FolderId,
    },
    Versions {
        id: DocumentId,
    },
    Remove {
        folder_id: FolderId,
        ids: Vec<DocumentId>,
    },
    Prune {
        id: DocumentId,
        versions: Vec<i32>,
    },
    Move {
        from: FolderId,
        to: FolderId,
        ids: Vec<DocumentId>,
    },
    Lock {
        id: DocumentId,
        timeout: Option<Duration>,
    },
    Unlock {
        id: DocumentId,
    },
    Delta {
        folder_id: FolderId,
        since: i64,
    },
}

impl ToolCommand {
    /// Folders the command addresses; the tool registers them before running.
    fn folders(&self) -> Vec<FolderId> {
        match self {
            ToolCommand::Put { folder_id, .. }
            | ToolCommand::List { folder_id }
            | ToolCommand::Remove { folder_id, .. }
            | ToolCommand::Delta { folder_id, .. } => vec![*folder_id],
            ToolCommand::Move { from, to, .. } => vec![*from, *to],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolOptions {
    pub config_path: PathBuf,
    /// Keep every database and blob under this directory instead of the configured paths.
    pub root: Option<PathBuf>,
    pub context_id: ContextId,
    pub user_id: EntityId,
    pub folders: Vec<FolderId>,
    pub command: ToolCommand,
}

impl ToolOptions {
    pub fn new(command: ToolCommand) -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_INFOSTORE_CONFIG_PATH),
            root: None,
            context_id: 1,
            user_id: 1,
            folders: Vec::new(),
            command,
        }
    }
}

fn load_config(options: &ToolOptions) -> InfostoreResult<InfostoreConfig> {
    if let Some(root) = options.root.as_ref() {
        return Ok(InfostoreConfig::with_root(root));
    }
    if options.config_path.exists() {
        return InfostoreConfig::load(&options.config_path);
    }
    warn!(
        "config {} not found, using defaults",
        options.config_path.display()
    );
    Ok(InfostoreConfig::default())
}

struct ToolEngine {
    engine: Arc<InfostoreEngine>,
    background: Arc<Mutex<BackgroundMgr>>,
}

fn open_engine(options: &ToolOptions) -> InfostoreResult<ToolEngine> {
    let config = load_config(options)?;
    let folders = Arc::new(FolderDirectory::new());
    let mut folder_ids = options.folders.clone();
    folder_ids.extend(options.command.folders());
    for folder_id in folder_ids {
        folders.add_folder(options.context_id, folder_id, FolderType::Public, options.user_id)?;
    }

    let background = Arc::new(Mutex::new(BackgroundMgr::from_config(&config)));
    let locks = MemoryLockManager::new()
        .with_listener(Arc::new(TouchOnLockExpiry::new(background.clone())));
    let services = InfostoreServices::local(&config, folders)?
        .with_locks(Arc::new(locks))
        .with_guest_cleanup(Arc::new(QueuedGuestCleanup::new(background.clone())));
    Ok(ToolEngine {
        engine: Arc::new(InfostoreEngine::new(config, services)?),
        background,
    })
}

fn print_document(doc: &DocumentMetadata) {
    println!(
        "{}\t{}\tv{}\t{}\t{}",
        doc.id,
        doc.folder_id,
        doc.version,
        doc.file_size,
        doc.filename.as_deref().unwrap_or(&doc.title)
    );
}

fn io_err(context: &str, e: io::Error) -> InfostoreError {
    InfostoreError::storage(context.to_string(), e)
}

fn refs(folder_id: FolderId, ids: &[DocumentId]) -> Vec<DocumentRef> {
    ids.iter().map(|id| DocumentRef::new(*id, folder_id)).collect()
}

fn put(
    engine: &InfostoreEngine,
    session: &Session,
    folder_id: FolderId,
    source: &Path,
    filename: Option<String>,
    update: Option<DocumentId>,
) -> InfostoreResult<DocumentMetadata> {
    let mut file = File::open(source).map_err(|e| io_err("open source file", e))?;
    let mut doc = match update {
        Some(id) => engine.get_document_metadata(session, id, CURRENT_VERSION, None)?,
        None => {
            let name = filename.clone().unwrap_or_else(|| {
                source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            });
            DocumentMetadata::new_in_folder(folder_id, name)
        }
    };
    if let (Some(_), Some(name)) = (update, filename) {
        doc.filename = Some(name);
    }
    engine.with_transaction(|tx| {
        engine.save_document(tx, session, &mut doc, Some(&mut file), SaveOptions::default())
    })?;
    Ok(doc)
}

/// Run one command; returns what the tool prints on success.
pub fn run_tool(options: ToolOptions) -> InfostoreResult<()> {
    let tool = open_engine(&options)?;
    let engine = tool.engine.as_ref();
    let session = Session::new(options.context_id, options.user_id);

    match options.command.clone() {
        ToolCommand::Put {
            folder_id,
            source,
            filename,
            update,
        } => {
            let doc = put(engine, &session, folder_id, &source, filename, update)?;
            print_document(&doc);
        }
        ToolCommand::Get { id, version, out } => {
            let mut reader = engine.get_document(&session, id, version, None)?;
            let copied = match out {
                Some(path) => {
                    let mut file = File::create(&path).map_err(|e| io_err("create output", e))?;
                    io::copy(&mut reader, &mut file).map_err(|e| io_err("write output", e))?
                }
                None => {
                    let stdout = io::stdout();
                    let mut lock = stdout.lock();
                    let n = io::copy(&mut reader, &mut lock).map_err(|e| io_err("write stdout", e))?;
                    lock.flush().map_err(|e| io_err("flush stdout", e))?;
                    n
                }
            };
            info!("document {} version {}: {} bytes", id, version, copied);
        }
        ToolCommand::Stat { id } => {
            let doc = engine.get_document_metadata(&session, id, CURRENT_VERSION, None)?;
            let text = serde_json::to_string_pretty(&doc)
                .map_err(|e| InfostoreError::Internal(format!("encode metadata: {}", e)))?;
            println!("{}", text);
        }
        ToolCommand::List { folder_id } => {
            let listed = engine.get_documents(
                &session,
                folder_id,
                &[],
                None,
                SortDirection::Ascending,
                None,
            )?;
            for doc in listed.results {
                print_document(&doc?);
            }
            println!("sequence {}", listed.sequence_number);
        }
        ToolCommand::Versions { id } => {
            for doc in engine.get_versions(&session, id)? {
                print_document(&doc);
            }
        }
        ToolCommand::Remove { folder_id, ids } => {
            let mut rejected = Vec::new();
            let removed = engine.with_transaction(|tx| {
                engine.remove_documents(
                    tx,
                    &session,
                    &refs(folder_id, &ids),
                    i64::MAX,
                    Some(&mut rejected),
                )
            })?;
            println!("removed {:?}", removed);
            if !rejected.is_empty() {
                println!("kept {:?}", rejected.iter().map(|r| r.id).collect::<Vec<_>>());
            }
        }
        ToolCommand::Prune { id, versions } => {
            let not_removed =
                engine.with_transaction(|tx| engine.remove_versions(tx, &session, id, &versions))?;
            println!("not removed {:?}", not_removed);
        }
        ToolCommand::Move { from, to, ids } => {
            let moved = engine.with_transaction(|tx| {
                engine.move_documents(tx, &session, &refs(from, &ids), to, i64::MAX, None)
            })?;
            println!("moved {:?}", moved);
        }
        ToolCommand::Lock { id, timeout } => {
            let lock_id = engine.with_transaction(|tx| {
                engine.lock(tx, &session, id, timeout, LockScope::Exclusive)
            })?;
            println!("lock {}", lock_id);
        }
        ToolCommand::Unlock { id } => {
            let released = engine.with_transaction(|tx| engine.unlock(tx, &session, id))?;
            println!("{}", if released { "unlocked" } else { "not locked" });
        }
        ToolCommand::Delta { folder_id, since } => {
            let delta = engine.get_delta(&session, folder_id, since)?;
            for doc in delta.new.iter() {
                print!("new\t");
                print_document(doc);
            }
            for doc in delta.modified.iter() {
                print!("modified\t");
                print_document(doc);
            }
            for doc in delta.deleted.iter() {
                print!("deleted\t");
                print_document(doc);
            }
            println!("sequence {}", delta.sequence_number);
        }
    }

    drain_background(&tool)
}

/// Run whatever follow-up work the command queued before the process exits.
fn drain_background(tool: &ToolEngine) -> InfostoreResult<()> {
    let pending = tool
        .background
        .lock()
        .map(|mgr| mgr.has_pending_tasks())
        .unwrap_or(false);
    if !pending {
        return Ok(());
    }
    if let Ok(mut mgr) = tool.background.lock() {
        for kind in [BackgroundTaskKind::GuestCleanup, BackgroundTaskKind::TouchDocument] {
            mgr.set_policy(
                kind,
                BackgroundTaskPolicy::new(Duration::ZERO, Duration::from_secs(10)),
            );
        }
    }
    let runtime = Runtime::new().map_err(|e| InfostoreError::Internal(e.to_string()))?;
    let executor = EngineTaskExecutor::new(tool.engine.clone());
    let stats = runtime.block_on(BackgroundMgr::run_once(&tool.background, &executor));
    info!(
        "background drained: executed={}, failed={}",
        stats.executed, stats.failed
    );
    Ok(())
}
