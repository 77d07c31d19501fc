mod identity;
mod lock_expiry;
mod object_permission;
mod version_count;

pub use identity::*;
pub use lock_expiry::*;
pub use object_permission::*;
pub use version_count::*;
