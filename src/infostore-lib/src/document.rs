use crate::{ObjectPermission, DocumentId, EntityId, FolderId};
use serde::{Deserialize, Serialize};

/// Id of a document that has not been persisted yet.
pub const NEW: DocumentId = -1;
/// Version selector meaning "whatever the head points to".
pub const CURRENT_VERSION: i32 = -1;
/// Content-less version every document carries.
pub const PLACEHOLDER_VERSION: i32 = 0;
/// Virtual folder listing documents shared with the actor.
pub const SHARED_FOLDER_ID: FolderId = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    Id,
    FolderId,
    Version,
    Title,
    Filename,
    Description,
    Url,
    FileMimeType,
    FileSize,
    Checksum,
    VersionComment,
    FilestoreLocation,
    CreatedBy,
    CreationDate,
    ModifiedBy,
    LastModified,
    SequenceNumber,
    ObjectPermissions,
    Shareable,
    OriginalFolderId,
    LockedUntil,
    NumberOfVersions,
    CreatedFrom,
    ModifiedFrom,
}

impl Field {
    /// Columns a caller may set through a save.
    pub fn writable() -> &'static [Field] {
        &[
            Field::FolderId,
            Field::Title,
            Field::Filename,
            Field::Description,
            Field::Url,
            Field::FileMimeType,
            Field::VersionComment,
            Field::ObjectPermissions,
        ]
    }

    /// Columns stored on the version row rather than the head.
    pub fn is_version_column(&self) -> bool {
        matches!(
            self,
            Field::Title
                | Field::Filename
                | Field::Description
                | Field::Url
                | Field::FileMimeType
                | Field::FileSize
                | Field::Checksum
                | Field::VersionComment
                | Field::FilestoreLocation
        )
    }

    /// Columns that are not persisted but filled by a metadata loader.
    pub fn is_loaded(&self) -> bool {
        matches!(
            self,
            Field::ObjectPermissions
                | Field::LockedUntil
                | Field::NumberOfVersions
                | Field::CreatedFrom
                | Field::ModifiedFrom
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    User,
    Group,
    Guest,
}

/// Display information of an actor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub entity: EntityId,
    pub kind: EntityKind,
    pub display_name: String,
    pub email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: DocumentId,
    pub folder_id: FolderId,
    pub version: i32,
    pub title: String,
    pub filename: Option<String>,
    pub description: String,
    pub url: String,
    pub file_mime_type: Option<String>,
    pub file_size: u64,
    /// `None` after an append: the digest is unknown until content is rewritten.
    pub checksum: Option<String>,
    pub version_comment: String,
    pub filestore_location: Option<String>,
    pub created_by: EntityId,
    pub creation_date: i64,
    pub modified_by: EntityId,
    pub last_modified: i64,
    pub sequence_number: i64,
    pub original_folder_id: Option<FolderId>,
    pub shareable: bool,
    pub object_permissions: Option<Vec<ObjectPermission>>,
    pub locked_until: Option<i64>,
    pub number_of_versions: Option<u32>,
    pub created_from: Option<EntityInfo>,
    pub modified_from: Option<EntityInfo>,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            id: NEW,
            folder_id: 0,
            version: PLACEHOLDER_VERSION,
            title: String::new(),
            filename: None,
            description: String::new(),
            url: String::new(),
            file_mime_type: None,
            file_size: 0,
            checksum: None,
            version_comment: String::new(),
            filestore_location: None,
            created_by: 0,
            creation_date: 0,
            modified_by: 0,
            last_modified: 0,
            sequence_number: 0,
            original_folder_id: None,
            shareable: false,
            object_permissions: None,
            locked_until: None,
            number_of_versions: None,
            created_from: None,
            modified_from: None,
        }
    }
}

impl DocumentMetadata {
    pub fn new_in_folder(folder_id: FolderId, filename: impl Into<String>) -> Self {
        Self {
            folder_id,
            filename: Some(filename.into()),
            ..Self::default()
        }
    }

    pub fn is_new(&self) -> bool {
        self.id == NEW
    }

    pub fn has_content(&self) -> bool {
        self.version > PLACEHOLDER_VERSION && self.filestore_location.is_some()
    }

    /// The folder the document physically lives in.
    pub fn physical_folder_id(&self) -> FolderId {
        self.original_folder_id.unwrap_or(self.folder_id)
    }

    pub fn id_version(&self) -> IdVersionPair {
        IdVersionPair {
            id: self.id,
            folder_id: self.folder_id,
            version: self.version,
        }
    }

    pub fn etag(&self) -> String {
        crate::etag(self.id, self.version, self.last_modified)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdVersionPair {
    pub id: DocumentId,
    pub folder_id: FolderId,
    pub version: i32,
}

/// A (document, folder) pair addressed by the bulk entry points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: DocumentId,
    pub folder_id: FolderId,
}

impl DocumentRef {
    pub fn new(id: DocumentId, folder_id: FolderId) -> Self {
        Self { id, folder_id }
    }
}

/// A result together with the highest sequence number it observed.
#[derive(Debug)]
pub struct TimedResult<I> {
    pub sequence_number: i64,
    pub results: I,
}

/// Changes of one folder since a watermark.
#[derive(Clone, Debug, Default)]
pub struct Delta {
    pub new: Vec<DocumentMetadata>,
    pub modified: Vec<DocumentMetadata>,
    pub deleted: Vec<DocumentMetadata>,
    /// `max(sequence_number)` over everything the query observed.
    pub sequence_number: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}
