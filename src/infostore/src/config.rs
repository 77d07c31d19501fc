use infostore_lib::{InfostoreError, InfostoreResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_INFOSTORE_CONFIG_PATH: &str = "/opt/infostore/etc/infostore.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfostoreConfig {
    #[serde(alias = "database", alias = "db")]
    pub db_path: PathBuf,
    /// Defaults to `<db_path>.seq` when unset.
    #[serde(alias = "sequence_db", alias = "id_db_path")]
    pub sequence_db_path: Option<PathBuf>,
    #[serde(alias = "filestore", alias = "blob_path", alias = "filestore_path")]
    pub blob_dir: PathBuf,
    #[serde(alias = "quota_files", alias = "max_files")]
    pub max_files_per_context: Option<u64>,
    #[serde(alias = "quota_storage", alias = "max_storage")]
    pub max_storage_per_owner: Option<u64>,
    pub default_lock_timeout_secs: u64,
    pub max_lock_timeout_secs: u64,
    #[serde(alias = "batch_size")]
    pub loader_batch_size: usize,
    pub background_interval_ms: u64,
    pub background_budget_ms: u64,
    #[serde(alias = "auto_adjust_filenames")]
    pub auto_rename: bool,
}

impl Default for InfostoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/opt/infostore/var/infostore.db"),
            sequence_db_path: None,
            blob_dir: PathBuf::from("/opt/infostore/var/filestore"),
            max_files_per_context: None,
            max_storage_per_owner: None,
            default_lock_timeout_secs: 3600,
            max_lock_timeout_secs: 7 * 24 * 3600,
            loader_batch_size: 100,
            background_interval_ms: 30_000,
            background_budget_ms: 5_000,
            auto_rename: true,
        }
    }
}

impl InfostoreConfig {
    /// A config whose databases and blobs all live under `root`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            db_path: root.join("infostore.db"),
            blob_dir: root.join("filestore"),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> InfostoreResult<Self> {
        read_json_config(path)
    }

    pub fn sequence_db_path(&self) -> PathBuf {
        match &self.sequence_db_path {
            Some(path) => path.clone(),
            None => {
                let mut name = self.db_path.as_os_str().to_owned();
                name.push(".seq");
                PathBuf::from(name)
            }
        }
    }

    pub fn default_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.default_lock_timeout_secs)
    }

    /// Clamp a requested lock timeout into `(0, max_lock_timeout]`.
    pub fn lock_timeout(&self, requested: Option<Duration>) -> Duration {
        let max = Duration::from_secs(self.max_lock_timeout_secs.max(1));
        match requested {
            Some(t) if t.is_zero() => self.default_lock_timeout().min(max),
            Some(t) => t.min(max),
            None => self.default_lock_timeout().min(max),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.loader_batch_size.max(1)
    }
}

pub fn read_json_config<T: DeserializeOwned>(path: &Path) -> InfostoreResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| InfostoreError::storage(format!("read {} failed", path.display()), e))?;
    serde_json::from_str::<T>(&content).map_err(|e| {
        InfostoreError::InvalidParam(format!("parse {} failed: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_aliases_and_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("infostore.json");
        std::fs::write(
            &path,
            r#"{ "database": "/tmp/x.db", "filestore": "/tmp/fs", "quota_files": 12 }"#,
        )
        .unwrap();

        let config = InfostoreConfig::load(&path).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.blob_dir, PathBuf::from("/tmp/fs"));
        assert_eq!(config.max_files_per_context, Some(12));
        assert_eq!(config.loader_batch_size, 100);
        assert!(config.auto_rename);
        assert_eq!(config.sequence_db_path(), PathBuf::from("/tmp/x.db.seq"));
    }

    #[test]
    fn test_lock_timeout_is_clamped() {
        let config = InfostoreConfig {
            default_lock_timeout_secs: 60,
            max_lock_timeout_secs: 120,
            ..InfostoreConfig::default()
        };
        assert_eq!(config.lock_timeout(None), Duration::from_secs(60));
        assert_eq!(config.lock_timeout(Some(Duration::ZERO)), Duration::from_secs(60));
        assert_eq!(
            config.lock_timeout(Some(Duration::from_secs(500))),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(InfostoreConfig::load(&tmp.path().join("nope.json")).is_err());
    }
}
