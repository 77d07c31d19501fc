mod actions;
mod background;
mod config;
mod db;
mod engine;
mod folders;
mod id_generator;
mod loader;
pub mod loaders;
mod lock_manager;
mod locking;
mod move_docs;
mod quota;
mod remove;
mod reservation;
mod save;
mod save_params;
mod schema;
mod tx;

pub use background::*;
pub use config::*;
pub use engine::{InfostoreEngine, InfostoreServices};
pub use folders::FolderDirectory;
pub use id_generator::DbIdGenerator;
pub use loader::{DecoratedDocuments, DocumentDecorator, LoadContext, MetadataLoader};
pub use lock_manager::MemoryLockManager;
pub use quota::ConfiguredQuota;
pub use reservation::{MemoryFilenameReserver, ReservationGuard};
pub use save_params::{SaveOptions, SaveParameters, UNCHECKED_SEQUENCE};
pub use tx::{InfostoreTransaction, TxState};

#[cfg(test)]
mod engine_tests;
