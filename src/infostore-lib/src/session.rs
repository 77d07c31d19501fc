use crate::{ContextId, EntityId, ObjectPermission};
use serde::{Deserialize, Serialize};

/// The acting user of one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub context_id: ContextId,
    pub user_id: EntityId,
    #[serde(default)]
    pub groups: Vec<EntityId>,
}

impl Session {
    pub fn new(context_id: ContextId, user_id: EntityId) -> Self {
        Self {
            context_id,
            user_id,
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: Vec<EntityId>) -> Self {
        self.groups = groups;
        self
    }

    pub fn is_addressed_by(&self, permission: &ObjectPermission) -> bool {
        if permission.group {
            self.groups.contains(&permission.entity)
        } else {
            permission.entity == self.user_id
        }
    }
}
