mod file_storage;
mod models;
mod store;
pub mod tree;

pub use file_storage::{FileSnapshotStore, StorageError};
pub(crate) use file_storage::{read_json, write_json_atomic};
pub use models::*;
pub use store::{LocalStore, MemoryStore};
