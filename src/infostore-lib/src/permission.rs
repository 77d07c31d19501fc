use crate::{DocumentId, EntityId, InfostoreError, InfostoreResult, Session};
use serde::{Deserialize, Serialize};

pub const PERMISSION_NONE: u8 = 0;
pub const PERMISSION_READ: u8 = 1;
pub const PERMISSION_WRITE: u8 = 2;
pub const PERMISSION_DELETE: u8 = 4;

const PERMISSION_MASK: u8 = PERMISSION_READ | PERMISSION_WRITE | PERMISSION_DELETE;

/// A per-document grant to a user or group, independent of folder ACLs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPermission {
    pub entity: EntityId,
    pub group: bool,
    pub bits: u8,
}

impl ObjectPermission {
    pub fn new(entity: EntityId, group: bool, bits: u8) -> Self {
        Self {
            entity,
            group,
            bits,
        }
    }

    pub fn reader(entity: EntityId) -> Self {
        Self::new(entity, false, PERMISSION_READ)
    }

    pub fn writer(entity: EntityId) -> Self {
        Self::new(entity, false, PERMISSION_READ | PERMISSION_WRITE)
    }

    pub fn can_read(&self) -> bool {
        self.bits & PERMISSION_READ != 0
    }

    pub fn can_write(&self) -> bool {
        self.bits & PERMISSION_WRITE != 0
    }

    pub fn can_delete(&self) -> bool {
        self.bits & PERMISSION_DELETE != 0
    }
}

/// Sanity check for a caller-supplied permission list.
pub fn validate_object_permissions(
    permissions: &[ObjectPermission],
    owner: EntityId,
) -> InfostoreResult<()> {
    let mut seen = std::collections::HashSet::new();
    for permission in permissions {
        if permission.entity <= 0 {
            return Err(InfostoreError::InvalidPermission(format!(
                "invalid entity {}",
                permission.entity
            )));
        }
        if permission.bits == PERMISSION_NONE || permission.bits & !PERMISSION_MASK != 0 {
            return Err(InfostoreError::InvalidPermission(format!(
                "invalid bits {} for entity {}",
                permission.bits, permission.entity
            )));
        }
        if !permission.group && permission.entity == owner {
            return Err(InfostoreError::InvalidPermission(format!(
                "entity {} already owns the document",
                owner
            )));
        }
        if !seen.insert((permission.entity, permission.group)) {
            return Err(InfostoreError::InvalidPermission(format!(
                "duplicate entry for entity {}",
                permission.entity
            )));
        }
    }
    Ok(())
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AccessLevel {
    #[default]
    None,
    Own,
    All,
}

impl AccessLevel {
    fn allows(&self, created_by: EntityId, user_id: EntityId) -> bool {
        match self {
            AccessLevel::None => false,
            AccessLevel::Own => created_by == user_id,
            AccessLevel::All => true,
        }
    }
}

/// Capabilities one actor has on one folder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderPermission {
    pub read: AccessLevel,
    pub write: AccessLevel,
    pub delete: AccessLevel,
    pub create_objects: bool,
    pub share: bool,
    pub folder_admin: bool,
}

impl FolderPermission {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn owner() -> Self {
        Self {
            read: AccessLevel::All,
            write: AccessLevel::All,
            delete: AccessLevel::All,
            create_objects: true,
            share: true,
            folder_admin: true,
        }
    }

    pub fn reader() -> Self {
        Self {
            read: AccessLevel::All,
            ..Self::default()
        }
    }

    pub fn can_read_folder(&self) -> bool {
        self.read != AccessLevel::None
    }
}

/// Folder permission merged with the object permissions that address the actor.
#[derive(Clone, Debug)]
pub struct EffectivePermission {
    pub document_id: DocumentId,
    pub created_by: EntityId,
    pub user_id: EntityId,
    pub folder: FolderPermission,
    pub object_bits: u8,
}

impl EffectivePermission {
    pub fn new(
        session: &Session,
        document_id: DocumentId,
        created_by: EntityId,
        folder: FolderPermission,
        object_permissions: &[ObjectPermission],
    ) -> Self {
        let object_bits = object_permissions
            .iter()
            .filter(|p| session.is_addressed_by(p))
            .fold(PERMISSION_NONE, |acc, p| acc | p.bits);
        Self {
            document_id,
            created_by,
            user_id: session.user_id,
            folder,
            object_bits,
        }
    }

    pub fn can_read_in_folder(&self) -> bool {
        self.folder.read.allows(self.created_by, self.user_id)
    }

    pub fn can_read(&self) -> bool {
        self.can_read_in_folder() || self.object_bits & PERMISSION_READ != 0
    }

    /// True when read access exists only through an object permission.
    pub fn is_shared_access_only(&self) -> bool {
        !self.can_read_in_folder() && self.object_bits & PERMISSION_READ != 0
    }

    pub fn can_write(&self) -> bool {
        self.folder.write.allows(self.created_by, self.user_id)
            || self.object_bits & PERMISSION_WRITE != 0
    }

    pub fn can_delete(&self) -> bool {
        self.folder.delete.allows(self.created_by, self.user_id)
            || self.object_bits & PERMISSION_DELETE != 0
    }

    pub fn can_share(&self) -> bool {
        self.folder.share && self.can_write_in_folder()
    }

    fn can_write_in_folder(&self) -> bool {
        self.folder.write.allows(self.created_by, self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_permission_grants_read_without_folder_access() {
        let session = Session::new(1, 5);
        let perms = vec![ObjectPermission::reader(5)];
        let effective = EffectivePermission::new(&session, 100, 3, FolderPermission::none(), &perms);
        assert!(effective.can_read());
        assert!(effective.is_shared_access_only());
        assert!(!effective.can_write());
        assert!(!effective.can_share());
    }

    #[test]
    fn test_group_permission_addresses_members() {
        let session = Session::new(1, 5).with_groups(vec![900]);
        let perms = vec![ObjectPermission::new(900, true, PERMISSION_READ | PERMISSION_WRITE)];
        let effective = EffectivePermission::new(&session, 100, 3, FolderPermission::none(), &perms);
        assert!(effective.can_write());
        assert!(!effective.can_delete());
    }

    #[test]
    fn test_own_level_only_covers_own_documents() {
        let session = Session::new(1, 5);
        let folder = FolderPermission {
            read: AccessLevel::Own,
            write: AccessLevel::Own,
            ..FolderPermission::default()
        };
        assert!(EffectivePermission::new(&session, 1, 5, folder, &[]).can_write());
        assert!(!EffectivePermission::new(&session, 1, 6, folder, &[]).can_read());
    }

    #[test]
    fn test_validate_object_permissions() {
        assert!(validate_object_permissions(&[ObjectPermission::reader(7)], 5).is_ok());
        assert!(validate_object_permissions(&[ObjectPermission::new(7, false, 0)], 5).is_err());
        assert!(validate_object_permissions(&[ObjectPermission::new(7, false, 8)], 5).is_err());
        assert!(validate_object_permissions(&[ObjectPermission::reader(5)], 5).is_err());
        assert!(validate_object_permissions(
            &[ObjectPermission::reader(7), ObjectPermission::writer(7)],
            5
        )
        .is_err());
    }
}
