use crate::limit_reader::LimitReader;
use crate::store_db::{BlobItem, BlobState, BlobStoreDB};
use fs2::FileExt;
use infostore_lib::{
    unix_timestamp_millis, BlobReader, BlobStore, InfostoreError, InfostoreResult, QuotaOwner,
    StoredBlob,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

const CONFIG_FILE_NAME: &str = "blob_store.json";
const DEFAULT_DB_FILE: &str = "blob_store.db";
const BLOB_DIR_NAME: &str = "blobs";
const BLOB_FINAL_EXT: &str = "final";
const BLOB_TMP_EXT: &str = "tmp";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBlobConfig {
    pub read_only: bool,
    pub db_path: Option<PathBuf>,
    pub blob_dir: Option<PathBuf>,
}

/// File-system blob store: one file per blob, indexed in a sqlite db.
#[derive(Clone)]
pub struct LocalBlobStore {
    base_dir: PathBuf,
    read_only: bool,
    db: Arc<BlobStoreDB>,
    blob_dir: PathBuf,
}

fn io_err(op: &str, e: std::io::Error) -> InfostoreError {
    warn!("LocalBlobStore: {} failed! {}", op, e);
    InfostoreError::storage(op.to_string(), e)
}

impl LocalBlobStore {
    /// Open the store rooted at `root_path`, creating it and its config on first use.
    pub fn open(root_path: PathBuf) -> InfostoreResult<Self> {
        if !root_path.exists() {
            debug!(
                "LocalBlobStore: create base dir:{}",
                root_path.to_string_lossy()
            );
            fs::create_dir_all(&root_path).map_err(|e| io_err("create base dir", e))?;
        }

        let config_file = root_path.join(CONFIG_FILE_NAME);
        let config = if !config_file.exists() {
            let config = LocalBlobConfig::default();
            let config_str = serde_json::to_string(&config)
                .map_err(|e| InfostoreError::Internal(e.to_string()))?;
            fs::write(&config_file, config_str).map_err(|e| io_err("write config", e))?;
            config
        } else {
            let config_str =
                fs::read_to_string(&config_file).map_err(|e| io_err("read config", e))?;
            serde_json::from_str::<LocalBlobConfig>(&config_str).map_err(|e| {
                warn!("LocalBlobStore: parse config failed! {}", e);
                InfostoreError::InvalidParam(format!("blob store config invalid: {}", e))
            })?
        };

        Self::from_config(root_path, config)
    }

    pub fn from_config(root_path: PathBuf, config: LocalBlobConfig) -> InfostoreResult<Self> {
        let db_path = config
            .db_path
            .clone()
            .unwrap_or_else(|| root_path.join(DEFAULT_DB_FILE));
        let blob_dir = config
            .blob_dir
            .clone()
            .unwrap_or_else(|| root_path.join(BLOB_DIR_NAME));

        if !config.read_only {
            fs::create_dir_all(&blob_dir).map_err(|e| io_err("create blob dir", e))?;
        }

        let db = Arc::new(BlobStoreDB::new(db_path.to_string_lossy().to_string())?);
        Ok(Self {
            base_dir: root_path,
            read_only: config.read_only,
            db,
            blob_dir,
        })
    }

    pub fn get_base_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// Drop blobs whose write never completed and that are older than `max_age_ms`.
    pub fn remove_stale_writes(&self, max_age_ms: i64) -> InfostoreResult<usize> {
        self.ensure_writable()?;
        let before = unix_timestamp_millis() - max_age_ms;
        let stale = self.db.list_stale_writing(before)?;
        for item in stale.iter() {
            let tmp_path = self.blob_tmp_path(&item.owner, &item.location);
            if let Err(e) = fs::remove_file(&tmp_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("LocalBlobStore: remove stale tmp {} failed! {}", item.location, e);
                    continue;
                }
            }
            self.db.remove_blob_item(&item.owner, &item.location)?;
        }
        if !stale.is_empty() {
            info!("LocalBlobStore: removed {} stale writes", stale.len());
        }
        Ok(stale.len())
    }

    fn ensure_writable(&self) -> InfostoreResult<()> {
        if self.read_only {
            Err(InfostoreError::InvalidState(
                "blob store is read-only".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn completed_item(&self, owner: &QuotaOwner, location: &str) -> InfostoreResult<BlobItem> {
        match self.db.get_blob_item(owner, location)? {
            Some(item) if item.state == BlobState::Completed => Ok(item),
            _ => Err(InfostoreError::storage(
                format!("blob {} not found", location),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )),
        }
    }

    fn blob_dir_of(&self, owner: &QuotaOwner, location: &str) -> PathBuf {
        let prefix = &location[0..2.min(location.len())];
        self.blob_dir
            .join(owner.context_id.to_string())
            .join(owner.owner_id.to_string())
            .join(prefix)
    }

    fn blob_final_path(&self, owner: &QuotaOwner, location: &str) -> PathBuf {
        self.blob_dir_of(owner, location)
            .join(format!("{}.{}", location, BLOB_FINAL_EXT))
    }

    fn blob_tmp_path(&self, owner: &QuotaOwner, location: &str) -> PathBuf {
        self.blob_dir_of(owner, location)
            .join(format!("{}.{}", location, BLOB_TMP_EXT))
    }
}

fn new_location() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Copy `data` into `file`, feeding every chunk to `hasher` when given.
fn copy_into(
    data: &mut dyn Read,
    file: &mut File,
    mut hasher: Option<&mut Sha256>,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = data.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        if let Some(h) = hasher.as_deref_mut() {
            h.update(&buf[..n]);
        }
        total += n as u64;
    }
    file.flush()?;
    file.sync_all()?;
    Ok(total)
}

impl BlobStore for LocalBlobStore {
    fn write(&self, owner: &QuotaOwner, data: &mut dyn Read) -> InfostoreResult<StoredBlob> {
        self.ensure_writable()?;
        let location = new_location();
        let tmp_path = self.blob_tmp_path(owner, &location);
        if let Some(parent) = tmp_path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("create blob dir", e))?;
        }

        self.db
            .set_blob_item(&BlobItem::new_writing(&location, *owner))?;

        let mut file = File::create(&tmp_path).map_err(|e| io_err("create blob file", e))?;
        file.try_lock_exclusive()
            .map_err(|e| io_err("lock blob file", e))?;

        let mut hasher = Sha256::new();
        let size = match copy_into(data, &mut file, Some(&mut hasher)) {
            Ok(size) => size,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&tmp_path);
                let _ = self.db.remove_blob_item(owner, &location);
                return Err(io_err("write blob", e));
            }
        };
        let _ = FileExt::unlock(&file);
        drop(file);

        let final_path = self.blob_final_path(owner, &location);
        fs::rename(&tmp_path, &final_path).map_err(|e| io_err("rename blob file", e))?;

        let checksum = hex::encode(hasher.finalize());
        let mut item = BlobItem::new_writing(&location, *owner);
        item.size = size;
        item.checksum = Some(checksum.clone());
        item.state = BlobState::Completed;
        self.db.set_blob_item(&item)?;

        debug!(
            "LocalBlobStore: wrote blob {} ({} bytes) for {:?}",
            location, size, owner
        );
        Ok(StoredBlob {
            location,
            size,
            checksum: Some(checksum),
        })
    }

    fn append(
        &self,
        owner: &QuotaOwner,
        location: &str,
        data: &mut dyn Read,
        offset: u64,
    ) -> InfostoreResult<StoredBlob> {
        self.ensure_writable()?;
        let item = self.completed_item(owner, location)?;
        if offset != item.size {
            warn!(
                "LocalBlobStore: append offset {} does not match size {} of {}",
                offset, item.size, location
            );
            return Err(InfostoreError::InvalidParam(format!(
                "append offset {} does not match blob size {}",
                offset, item.size
            )));
        }

        let final_path = self.blob_final_path(owner, location);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&final_path)
            .map_err(|e| io_err("open blob file", e))?;
        file.try_lock_exclusive()
            .map_err(|e| io_err("lock blob file", e))?;
        let appended = copy_into(data, &mut file, None).map_err(|e| io_err("append blob", e))?;
        let _ = FileExt::unlock(&file);

        let size = item.size + appended;
        // the digest of the whole blob is unknown after an append
        self.db.update_blob_size(owner, location, size, None)?;
        Ok(StoredBlob {
            location: location.to_string(),
            size,
            checksum: None,
        })
    }

    fn truncate(
        &self,
        owner: &QuotaOwner,
        location: &str,
        size: u64,
        checksum: Option<&str>,
    ) -> InfostoreResult<()> {
        self.ensure_writable()?;
        let item = self.completed_item(owner, location)?;
        if size > item.size {
            return Err(InfostoreError::InvalidParam(format!(
                "cannot truncate blob {} of {} bytes to {}",
                location, item.size, size
            )));
        }

        let final_path = self.blob_final_path(owner, location);
        let file = OpenOptions::new()
            .write(true)
            .open(&final_path)
            .map_err(|e| io_err("open blob file", e))?;
        file.try_lock_exclusive()
            .map_err(|e| io_err("lock blob file", e))?;
        let result = file.set_len(size).and_then(|_| file.sync_all());
        let _ = FileExt::unlock(&file);
        result.map_err(|e| io_err("truncate blob", e))?;

        self.db.update_blob_size(owner, location, size, checksum)?;
        debug!(
            "LocalBlobStore: truncated blob {} from {} to {} bytes",
            location, item.size, size
        );
        Ok(())
    }

    fn read(
        &self,
        owner: &QuotaOwner,
        location: &str,
        range: Option<Range<u64>>,
    ) -> InfostoreResult<BlobReader> {
        let item = self.completed_item(owner, location)?;
        let final_path = self.blob_final_path(owner, location);
        match range {
            None => {
                let file = File::open(&final_path).map_err(|e| io_err("open blob file", e))?;
                Ok(Box::new(file))
            }
            Some(range) => {
                if range.start > range.end || range.start > item.size {
                    return Err(InfostoreError::InvalidParam(format!(
                        "range {}..{} outside of blob size {}",
                        range.start, range.end, item.size
                    )));
                }
                let end = range.end.min(item.size);
                let reader = LimitReader::from_file(&final_path, range.start, end - range.start)
                    .map_err(|e| io_err("open blob segment", e))?;
                Ok(Box::new(reader))
            }
        }
    }

    fn size(&self, owner: &QuotaOwner, location: &str) -> InfostoreResult<u64> {
        Ok(self.completed_item(owner, location)?.size)
    }

    fn delete(&self, owner: &QuotaOwner, location: &str) -> InfostoreResult<bool> {
        self.ensure_writable()?;
        let final_path = self.blob_final_path(owner, location);
        let existed = match fs::remove_file(&final_path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(io_err("remove blob file", e)),
        };
        let indexed = self.db.remove_blob_item(owner, location)?;
        Ok(existed || indexed)
    }

    fn delete_all(&self, owner: &QuotaOwner, locations: &[String]) -> InfostoreResult<Vec<String>> {
        self.ensure_writable()?;
        let mut failed = Vec::new();
        let mut removed = Vec::with_capacity(locations.len());
        for location in locations {
            let final_path = self.blob_final_path(owner, location);
            match fs::remove_file(&final_path) {
                Ok(()) => removed.push(location.clone()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    removed.push(location.clone());
                    failed.push(location.clone());
                }
                Err(e) => {
                    warn!("LocalBlobStore: remove blob {} failed! {}", location, e);
                    failed.push(location.clone());
                }
            }
        }
        self.db.remove_blob_items(owner, &removed)?;
        Ok(failed)
    }

    fn usage(&self, owner: &QuotaOwner) -> InfostoreResult<u64> {
        self.db.usage(owner)
    }
}
