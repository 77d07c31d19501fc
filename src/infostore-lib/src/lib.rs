mod document;
mod error;
mod permission;
mod services;
mod session;
mod tools;

pub use document::*;
pub use error::*;
pub use permission::*;
pub use services::*;
pub use session::*;
pub use tools::*;

pub type DocumentId = i64;
pub type FolderId = i64;
pub type EntityId = i64;
pub type ContextId = i64;
