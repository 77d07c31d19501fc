mod limit_reader;
mod local_store;
mod store_db;

pub use limit_reader::{open_file_segment, LimitReader};
pub use local_store::{LocalBlobConfig, LocalBlobStore};
pub use store_db::{BlobItem, BlobState, BlobStoreDB};
