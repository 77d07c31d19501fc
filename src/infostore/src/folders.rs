use infostore_lib::{
    ContextId, EntityId, FolderId, FolderInfo, FolderModule, FolderPermission,
    FolderResolver, FolderType, InfostoreError, InfostoreResult, PermissionEvaluator, Session,
    Transactional, SHARED_FOLDER_ID,
};
use std::collections::HashMap;
use std::sync::RwLock;

struct FolderEntry {
    info: FolderInfo,
    grants: HashMap<EntityId, FolderPermission>,
}

/// In-memory folder table answering both folder lookups and folder permissions.
pub struct FolderDirectory {
    folders: RwLock<HashMap<(ContextId, FolderId), FolderEntry>>,
}

fn merge(a: FolderPermission, b: FolderPermission) -> FolderPermission {
    FolderPermission {
        read: a.read.max(b.read),
        write: a.write.max(b.write),
        delete: a.delete.max(b.delete),
        create_objects: a.create_objects || b.create_objects,
        share: a.share || b.share,
        folder_admin: a.folder_admin || b.folder_admin,
    }
}

impl FolderDirectory {
    pub fn new() -> Self {
        Self {
            folders: RwLock::new(HashMap::new()),
        }
    }

    /// Register a folder; the virtual shared folder of the context comes with it.
    pub fn add_folder(
        &self,
        context_id: ContextId,
        folder_id: FolderId,
        folder_type: FolderType,
        owner: EntityId,
    ) -> InfostoreResult<()> {
        let mut folders = self.write()?;
        folders
            .entry((context_id, SHARED_FOLDER_ID))
            .or_insert_with(|| FolderEntry {
                info: FolderInfo {
                    id: SHARED_FOLDER_ID,
                    module: FolderModule::Infostore,
                    folder_type: FolderType::Virtual,
                    owner: 0,
                },
                grants: HashMap::new(),
            });
        folders.insert(
            (context_id, folder_id),
            FolderEntry {
                info: FolderInfo {
                    id: folder_id,
                    module: FolderModule::Infostore,
                    folder_type,
                    owner,
                },
                grants: HashMap::new(),
            },
        );
        Ok(())
    }

    pub fn add_foreign_folder(&self, context_id: ContextId, folder_id: FolderId) -> InfostoreResult<()> {
        self.write()?.insert(
            (context_id, folder_id),
            FolderEntry {
                info: FolderInfo {
                    id: folder_id,
                    module: FolderModule::Other,
                    folder_type: FolderType::Public,
                    owner: 0,
                },
                grants: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Grant `permission` on a folder to a user or group id.
    pub fn grant(
        &self,
        context_id: ContextId,
        folder_id: FolderId,
        entity: EntityId,
        permission: FolderPermission,
    ) -> InfostoreResult<()> {
        let mut folders = self.write()?;
        let entry = folders
            .get_mut(&(context_id, folder_id))
            .ok_or(InfostoreError::FolderNotFound(folder_id))?;
        entry.grants.insert(entity, permission);
        Ok(())
    }

    pub fn remove_folder(&self, context_id: ContextId, folder_id: FolderId) -> InfostoreResult<bool> {
        Ok(self.write()?.remove(&(context_id, folder_id)).is_some())
    }

    pub fn folder_ids(&self, context_id: ContextId) -> InfostoreResult<Vec<FolderId>> {
        let folders = self.read()?;
        let mut ids: Vec<FolderId> = folders
            .keys()
            .filter(|(cid, _)| *cid == context_id)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn read(
        &self,
    ) -> InfostoreResult<std::sync::RwLockReadGuard<'_, HashMap<(ContextId, FolderId), FolderEntry>>> {
        self.folders
            .read()
            .map_err(|e| InfostoreError::Internal(format!("folder table poisoned: {}", e)))
    }

    fn write(
        &self,
    ) -> InfostoreResult<std::sync::RwLockWriteGuard<'_, HashMap<(ContextId, FolderId), FolderEntry>>>
    {
        self.folders
            .write()
            .map_err(|e| InfostoreError::Internal(format!("folder table poisoned: {}", e)))
    }
}

impl Default for FolderDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderResolver for FolderDirectory {
    fn folder(&self, context_id: ContextId, folder_id: FolderId) -> InfostoreResult<FolderInfo> {
        self.read()?
            .get(&(context_id, folder_id))
            .map(|entry| entry.info.clone())
            .ok_or(InfostoreError::FolderNotFound(folder_id))
    }
}

/// Folder grants live outside the document transaction; nothing to stage.
impl Transactional for FolderDirectory {}

impl PermissionEvaluator for FolderDirectory {
    fn folder_permission(&self, session: &Session, folder_id: FolderId) -> InfostoreResult<FolderPermission> {
        let folders = self.read()?;
        let Some(entry) = folders.get(&(session.context_id, folder_id)) else {
            return Ok(FolderPermission::none());
        };

        let mut permission = FolderPermission::none();
        if entry.info.owner == session.user_id && entry.info.folder_type != FolderType::Virtual {
            permission = FolderPermission::owner();
        }
        if let Some(grant) = entry.grants.get(&session.user_id) {
            permission = merge(permission, *grant);
        }
        for group in session.groups.iter() {
            if let Some(grant) = entry.grants.get(group) {
                permission = merge(permission, *grant);
            }
        }
        if entry.info.folder_type == FolderType::Virtual {
            // nobody creates in or shares from the virtual folder
            permission.create_objects = false;
            permission.share = false;
        }
        Ok(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_and_group_grants() {
        let dir = FolderDirectory::new();
        dir.add_folder(1, 20, FolderType::Private, 5).unwrap();
        dir.add_folder(1, 30, FolderType::Public, 0).unwrap();
        dir.grant(1, 30, 900, FolderPermission::reader()).unwrap();

        let owner = Session::new(1, 5);
        assert!(dir.folder_permission(&owner, 20).unwrap().create_objects);
        assert!(!dir.folder_permission(&owner, 30).unwrap().can_read_folder());

        let member = Session::new(1, 6).with_groups(vec![900]);
        let perm = dir.folder_permission(&member, 30).unwrap();
        assert!(perm.can_read_folder());
        assert!(!perm.create_objects);
    }

    #[test]
    fn test_folder_lookup() {
        let dir = FolderDirectory::new();
        dir.add_folder(1, 20, FolderType::Private, 5).unwrap();
        dir.add_foreign_folder(1, 40).unwrap();

        let private = dir.folder(1, 20).unwrap();
        assert!(private.accepts_documents());
        assert_eq!(private.quota_owner(1).owner_id, 5);
        assert!(!dir.folder(1, 40).unwrap().accepts_documents());
        assert!(!dir.folder(1, SHARED_FOLDER_ID).unwrap().accepts_documents());
        assert!(matches!(
            dir.folder(1, 99),
            Err(InfostoreError::FolderNotFound(99))
        ));
    }
}
