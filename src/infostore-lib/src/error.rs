use crate::{DocumentId, FolderId};
use std::fmt;
use thiserror::Error;

type BoxedCause = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Permission,
    NotFound,
    Conflict,
    Locked,
    Naming,
    Quota,
    Validation,
    Storage,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Permission => "permission",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Locked => "locked",
            ErrorCategory::Naming => "naming",
            ErrorCategory::Quota => "quota",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    FileCount,
    Storage,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::FileCount => write!(f, "files"),
            QuotaKind::Storage => write!(f, "bytes"),
        }
    }
}

#[derive(Error, Debug)]
pub enum InfostoreError {
    #[error("no read permission for document {0}")]
    ReadDenied(DocumentId),
    #[error("no write permission for document {0}")]
    WriteDenied(DocumentId),
    #[error("no permission to read folder {0}")]
    FolderReadDenied(FolderId),
    #[error("no permission to create documents in folder {0}")]
    CreateDenied(FolderId),
    #[error("no delete permission for document {0}")]
    DeleteDenied(DocumentId),
    #[error("no permission to share document {0}")]
    ShareDenied(DocumentId),

    #[error("document {0} not found")]
    DocumentNotFound(DocumentId),
    #[error("version {1} of document {0} not found")]
    VersionNotFound(DocumentId, i32),
    #[error("folder {0} not found")]
    FolderNotFound(FolderId),
    #[error("folder {0} is not an infostore folder")]
    NotInfostoreFolder(FolderId),

    #[error("document {0} is currently locked")]
    Locked(DocumentId),
    #[error("document {0} is locked by another user")]
    LockedByAnother(DocumentId),

    #[error("filename {filename} already in use in folder {folder_id}")]
    FilenameNotUnique {
        filename: String,
        folder_id: FolderId,
        conflicting_id: DocumentId,
        suggested: String,
    },

    #[error("quota exceeded: {usage} of {limit} {kind} used")]
    QuotaExceeded {
        kind: QuotaKind,
        usage: u64,
        limit: u64,
    },

    #[error("document {0} was modified by someone else")]
    ConcurrentModification(DocumentId),

    #[error("invalid filename {0}: {1}")]
    InvalidFilename(String, String),
    #[error("invalid object permission: {0}")]
    InvalidPermission(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("database access failed: {context}")]
    Db {
        context: String,
        #[source]
        source: BoxedCause,
    },
    #[error("storage I/O failed: {context}")]
    Storage {
        context: String,
        #[source]
        source: BoxedCause,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type InfostoreResult<T> = std::result::Result<T, InfostoreError>;

impl InfostoreError {
    pub fn db(context: impl Into<String>, source: impl Into<BoxedCause>) -> Self {
        InfostoreError::Db {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn storage(context: impl Into<String>, source: impl Into<BoxedCause>) -> Self {
        InfostoreError::Storage {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Stable code, suitable for clients and translation tables.
    pub fn code(&self) -> &'static str {
        match self {
            InfostoreError::ReadDenied(_) => "IFO-0400",
            InfostoreError::WriteDenied(_) => "IFO-0401",
            InfostoreError::CreateDenied(_) => "IFO-0402",
            InfostoreError::FolderReadDenied(_) => "IFO-0405",
            InfostoreError::DeleteDenied(_) => "IFO-0403",
            InfostoreError::ShareDenied(_) => "IFO-0404",
            InfostoreError::DocumentNotFound(_) => "IFO-0300",
            InfostoreError::VersionNotFound(_, _) => "IFO-0301",
            InfostoreError::FolderNotFound(_) => "IFO-0302",
            InfostoreError::NotInfostoreFolder(_) => "IFO-0303",
            InfostoreError::Locked(_) => "IFO-0500",
            InfostoreError::LockedByAnother(_) => "IFO-0501",
            InfostoreError::FilenameNotUnique { .. } => "IFO-0600",
            InfostoreError::QuotaExceeded { .. } => "IFO-0700",
            InfostoreError::ConcurrentModification(_) => "IFO-0800",
            InfostoreError::InvalidFilename(_, _) => "IFO-0900",
            InfostoreError::InvalidPermission(_) => "IFO-0901",
            InfostoreError::InvalidParam(_) => "IFO-0902",
            InfostoreError::InvalidState(_) => "IFO-0903",
            InfostoreError::Db { .. } => "IFO-0200",
            InfostoreError::Storage { .. } => "IFO-0201",
            InfostoreError::Internal(_) => "IFO-0100",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            InfostoreError::ReadDenied(_)
            | InfostoreError::WriteDenied(_)
            | InfostoreError::CreateDenied(_)
            | InfostoreError::FolderReadDenied(_)
            | InfostoreError::DeleteDenied(_)
            | InfostoreError::ShareDenied(_) => ErrorCategory::Permission,
            InfostoreError::DocumentNotFound(_)
            | InfostoreError::VersionNotFound(_, _)
            | InfostoreError::FolderNotFound(_) => ErrorCategory::NotFound,
            InfostoreError::NotInfostoreFolder(_) => ErrorCategory::Validation,
            InfostoreError::Locked(_) | InfostoreError::LockedByAnother(_) => {
                ErrorCategory::Locked
            }
            InfostoreError::FilenameNotUnique { .. } => ErrorCategory::Naming,
            InfostoreError::QuotaExceeded { .. } => ErrorCategory::Quota,
            InfostoreError::ConcurrentModification(_) => ErrorCategory::Conflict,
            InfostoreError::InvalidFilename(_, _)
            | InfostoreError::InvalidPermission(_)
            | InfostoreError::InvalidParam(_)
            | InfostoreError::InvalidState(_) => ErrorCategory::Validation,
            InfostoreError::Db { .. } | InfostoreError::Storage { .. } => ErrorCategory::Storage,
            InfostoreError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Positional arguments for the localized message of this error.
    pub fn args(&self) -> Vec<String> {
        match self {
            InfostoreError::ReadDenied(id)
            | InfostoreError::WriteDenied(id)
            | InfostoreError::DeleteDenied(id)
            | InfostoreError::ShareDenied(id)
            | InfostoreError::DocumentNotFound(id)
            | InfostoreError::Locked(id)
            | InfostoreError::LockedByAnother(id)
            | InfostoreError::ConcurrentModification(id) => vec![id.to_string()],
            InfostoreError::CreateDenied(folder_id)
            | InfostoreError::FolderReadDenied(folder_id)
            | InfostoreError::FolderNotFound(folder_id)
            | InfostoreError::NotInfostoreFolder(folder_id) => vec![folder_id.to_string()],
            InfostoreError::VersionNotFound(id, version) => {
                vec![id.to_string(), version.to_string()]
            }
            InfostoreError::FilenameNotUnique {
                filename,
                folder_id,
                conflicting_id,
                suggested,
            } => vec![
                filename.clone(),
                folder_id.to_string(),
                conflicting_id.to_string(),
                suggested.clone(),
            ],
            InfostoreError::QuotaExceeded { kind, usage, limit } => {
                vec![usage.to_string(), limit.to_string(), kind.to_string()]
            }
            InfostoreError::InvalidFilename(name, reason) => vec![name.clone(), reason.clone()],
            InfostoreError::InvalidPermission(msg)
            | InfostoreError::InvalidParam(msg)
            | InfostoreError::InvalidState(msg)
            | InfostoreError::Internal(msg) => vec![msg.clone()],
            InfostoreError::Db { context, .. } | InfostoreError::Storage { context, .. } => {
                vec![context.clone()]
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, InfostoreError::ConcurrentModification(_))
    }
}

impl From<std::io::Error> for InfostoreError {
    fn from(err: std::io::Error) -> Self {
        InfostoreError::storage("io", err)
    }
}

pub fn map_db_err(err: rusqlite::Error) -> InfostoreError {
    InfostoreError::db("sql", err)
}
