use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::file_storage::Result;
use super::models::{NoteId, NoteSnapshot, TreeSnapshot};

/// Durable key/value persistence for the last-known tree and note bodies.
///
/// Reads return `Ok(None)` when nothing was ever saved; that is the normal
/// state of a client that has never been online. Errors only come from the
/// storage medium and must reach the caller.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn save_tree(&self, tree: &TreeSnapshot) -> Result<()>;

    async fn get_tree(&self) -> Result<Option<TreeSnapshot>>;

    async fn save_note(&self, note: &NoteSnapshot) -> Result<()>;

    async fn get_note(&self, id: NoteId) -> Result<Option<NoteSnapshot>>;

    /// Remove a cached note. Removing a note that is not cached is not an error.
    async fn delete_note(&self, id: NoteId) -> Result<()>;
}

/// In-process store that forgets everything on drop
#[derive(Default)]
pub struct MemoryStore {
    tree: Mutex<Option<TreeSnapshot>>,
    notes: Mutex<HashMap<NoteId, NoteSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn note_ids(&self) -> Vec<NoteId> {
        let mut ids: Vec<NoteId> = self.notes.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn save_tree(&self, tree: &TreeSnapshot) -> Result<()> {
        *self.tree.lock().await = Some(tree.clone());
        Ok(())
    }

    async fn get_tree(&self) -> Result<Option<TreeSnapshot>> {
        Ok(self.tree.lock().await.clone())
    }

    async fn save_note(&self, note: &NoteSnapshot) -> Result<()> {
        self.notes.lock().await.insert(note.id, note.clone());
        Ok(())
    }

    async fn get_note(&self, id: NoteId) -> Result<Option<NoteSnapshot>> {
        Ok(self.notes.lock().await.get(&id).cloned())
    }

    async fn delete_note(&self, id: NoteId) -> Result<()> {
        self.notes.lock().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get_tree().await.unwrap().is_none());
        assert!(store.get_note(NoteId(1)).await.unwrap().is_none());

        let note = NoteSnapshot::local(NoteId(1), None, "a".into(), "b".into());
        store.save_note(&note).await.unwrap();
        assert_eq!(store.get_note(NoteId(1)).await.unwrap(), Some(note));

        store.delete_note(NoteId(1)).await.unwrap();
        store.delete_note(NoteId(1)).await.unwrap();
        assert!(store.note_ids().await.is_empty());
    }
}
