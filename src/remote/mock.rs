//! In-memory notes API used by the tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{NoteCreate, NoteUpdate, NotesRemote, RemoteError};
use crate::storage::{tree, FolderNode, NoteId, NoteRef, NoteSnapshot, TreeSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Create(NoteCreate),
    Update(NoteId, NoteUpdate),
    Delete(NoteId),
    GetTree,
    GetNote(NoteId),
}

struct Server {
    next_id: i64,
    folders: Vec<FolderNode>,
    notes: BTreeMap<NoteId, NoteSnapshot>,
    calls: Vec<RemoteCall>,
    /// Titles the server refuses to accept
    rejected_titles: Vec<String>,
}

pub struct MockRemote {
    online: AtomicBool,
    server: Mutex<Server>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            server: Mutex::new(Server {
                next_id: 100,
                folders: Vec::new(),
                notes: BTreeMap::new(),
                calls: Vec::new(),
                rejected_titles: Vec::new(),
            }),
        }
    }

    pub fn with_folders(folders: Vec<FolderNode>) -> Self {
        let remote = Self::new();
        remote.server.lock().unwrap().folders = folders;
        remote
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn reject_title(&self, title: &str) {
        self.server
            .lock()
            .unwrap()
            .rejected_titles
            .push(title.to_string());
    }

    /// Seed a note directly on the server
    pub fn insert_note(&self, folder_id: Option<i64>, title: &str, content: &str) -> NoteSnapshot {
        let mut server = self.server.lock().unwrap();
        let id = NoteId(server.next_id);
        server.next_id += 1;
        let note = NoteSnapshot::local(id, folder_id, title.to_string(), content.to_string());
        server.notes.insert(id, note.clone());
        note
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.server.lock().unwrap().calls.clone()
    }

    /// Calls that change server state, in order
    pub fn writes(&self) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, RemoteCall::GetTree | RemoteCall::GetNote(_)))
            .collect()
    }

    pub fn note(&self, id: NoteId) -> Option<NoteSnapshot> {
        self.server.lock().unwrap().notes.get(&id).cloned()
    }

    pub fn note_count(&self) -> usize {
        self.server.lock().unwrap().notes.len()
    }

    fn enter(&self, call: RemoteCall) -> Result<std::sync::MutexGuard<'_, Server>, RemoteError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        let mut server = self.server.lock().unwrap();
        server.calls.push(call);
        Ok(server)
    }
}

fn folder_exists(folders: &[FolderNode], id: i64) -> bool {
    folders
        .iter()
        .any(|f| f.id == id || folder_exists(&f.children, id))
}

fn not_found() -> RemoteError {
    RemoteError::Server {
        status: 404,
        message: "Note not found".to_string(),
    }
}

#[async_trait]
impl NotesRemote for MockRemote {
    async fn create_note(&self, payload: &NoteCreate) -> Result<NoteSnapshot, RemoteError> {
        let mut server = self.enter(RemoteCall::Create(payload.clone()))?;
        if server.rejected_titles.contains(&payload.title) {
            return Err(RemoteError::Server {
                status: 422,
                message: "Title rejected".to_string(),
            });
        }
        if let Some(folder_id) = payload.folder_id {
            if !folder_exists(&server.folders, folder_id) {
                return Err(RemoteError::Server {
                    status: 400,
                    message: "Folder not found".to_string(),
                });
            }
        }
        let id = NoteId(server.next_id);
        server.next_id += 1;
        let note = NoteSnapshot::local(id, payload.folder_id, payload.title.clone(), payload.content.clone());
        server.notes.insert(id, note.clone());
        Ok(note)
    }

    async fn update_note(&self, id: NoteId, payload: &NoteUpdate) -> Result<NoteSnapshot, RemoteError> {
        let mut server = self.enter(RemoteCall::Update(id, payload.clone()))?;
        let note = server.notes.get_mut(&id).ok_or_else(not_found)?;
        payload.apply_to(note);
        note.updated_at = Utc::now();
        Ok(note.clone())
    }

    async fn delete_note(&self, id: NoteId) -> Result<(), RemoteError> {
        let mut server = self.enter(RemoteCall::Delete(id))?;
        server.notes.remove(&id).map(|_| ()).ok_or_else(not_found)
    }

    async fn get_tree(&self) -> Result<TreeSnapshot, RemoteError> {
        let server = self.enter(RemoteCall::GetTree)?;
        let mut snapshot = TreeSnapshot {
            roots: server.folders.clone(),
            root_notes: Vec::new(),
        };
        for note in server.notes.values() {
            snapshot = tree::add_note(&snapshot, NoteRef::from(note), note.folder_id);
        }
        Ok(snapshot)
    }

    async fn get_note(&self, id: NoteId) -> Result<NoteSnapshot, RemoteError> {
        let server = self.enter(RemoteCall::GetNote(id))?;
        server.notes.get(&id).cloned().ok_or_else(not_found)
    }
}
