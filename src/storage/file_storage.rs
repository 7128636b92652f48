use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;

use super::models::{NoteId, NoteSnapshot, TreeSnapshot};
use super::store::LocalStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Data directory not found")]
    DataDirNotFound,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Snapshot store backed by JSON files.
///
/// Layout under the base path:
/// - `tree.json`: the last known [`TreeSnapshot`]
/// - `notes/{id}.json`: one [`NoteSnapshot`] per cached note
pub struct FileSnapshotStore {
    base_path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Create the storage directories
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(self.notes_dir()).await?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn tree_path(&self) -> PathBuf {
        self.base_path.join("tree.json")
    }

    fn notes_dir(&self) -> PathBuf {
        self.base_path.join("notes")
    }

    fn note_path(&self, id: NoteId) -> PathBuf {
        self.notes_dir().join(format!("{}.json", id))
    }
}

#[async_trait]
impl LocalStore for FileSnapshotStore {
    async fn save_tree(&self, tree: &TreeSnapshot) -> Result<()> {
        write_json_atomic(&self.tree_path(), tree).await
    }

    async fn get_tree(&self) -> Result<Option<TreeSnapshot>> {
        read_json(&self.tree_path()).await
    }

    async fn save_note(&self, note: &NoteSnapshot) -> Result<()> {
        write_json_atomic(&self.note_path(note.id), note).await
    }

    async fn get_note(&self, id: NoteId) -> Result<Option<NoteSnapshot>> {
        read_json(&self.note_path(id)).await
    }

    async fn delete_note(&self, id: NoteId) -> Result<()> {
        match fs::remove_file(self.note_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read a JSON file, mapping a missing file to `None`
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Write JSON next to `path` and rename it into place.
///
/// Readers see either the old file or the new one, never a partial write.
pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
