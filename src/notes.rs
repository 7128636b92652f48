//! Entry point for the UI: reads with cache fallback, writes with queue
//! fallback, and the handles that keep both in sync.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::autosave::{AutosaveSession, SaveStatus, SessionDeps};
use crate::remote::{NoteCreate, NoteUpdate, NotesRemote, RemoteError};
use crate::state::{Connectivity, IdRemap, NotesState, NotesView};
use crate::storage::{
    tree, FileSnapshotStore, FolderId, LocalStore, NoteId, NoteRef, NoteSnapshot, StorageError,
    TreeSnapshot,
};
use crate::sync::{
    overlay_pending, start_sync_scheduler, temp_id, Mutation, MutationQueue, OfflineConfig,
    QueueKey, RejectedEntry, SyncEngine, SyncError, SyncReport, SyncScheduler, SyncStatus,
};

#[derive(Error, Debug)]
pub enum NotesError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("Note not found: {0}")]
    NotFound(NoteId),
}

pub type Result<T> = std::result::Result<T, NotesError>;

fn offline() -> RemoteError {
    RemoteError::Network("device is offline".to_string())
}

/// Offline-first notes data layer
pub struct OfflineNotes {
    config: OfflineConfig,
    remote: Arc<dyn NotesRemote>,
    store: Arc<dyn LocalStore>,
    queue: Arc<MutationQueue>,
    connectivity: Connectivity,
    state: NotesState,
    engine: Arc<SyncEngine>,
}

impl OfflineNotes {
    /// Open the on-disk cache and queue under `config.data_dir`
    pub async fn open(config: OfflineConfig, remote: Arc<dyn NotesRemote>, online: bool) -> Result<Self> {
        let store = FileSnapshotStore::new(config.snapshots_dir());
        store.init().await?;
        Self::with_store(config, remote, Arc::new(store), online).await
    }

    /// Like [`OfflineNotes::open`] with a caller-provided snapshot store
    pub async fn with_store(
        config: OfflineConfig,
        remote: Arc<dyn NotesRemote>,
        store: Arc<dyn LocalStore>,
        online: bool,
    ) -> Result<Self> {
        let queue = Arc::new(MutationQueue::open(config.queue_dir()).await?);
        let connectivity = Connectivity::new(online);
        let state = NotesState::new();
        let engine = Arc::new(SyncEngine::new(
            remote.clone(),
            store.clone(),
            queue.clone(),
            connectivity.clone(),
            state.clone(),
            &config,
        ));
        engine.refresh_pending().await?;

        if let Some(cached) = store.get_tree().await? {
            state.publish_tree(cached);
        }

        log::info!(
            "Notes: opened data layer at {:?} ({})",
            config.data_dir,
            if online { "online" } else { "offline" }
        );
        Ok(Self {
            config,
            remote,
            store,
            queue,
            connectivity,
            state,
            engine,
        })
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity.clone()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Report a connectivity change from the platform. A running scheduler
    /// drains the queue when the device comes back online.
    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NotesView> {
        self.state.subscribe()
    }

    pub fn subscribe_remaps(&self) -> broadcast::Receiver<IdRemap> {
        self.state.subscribe_remaps()
    }

    pub fn view(&self) -> NotesView {
        self.state.view()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn subscribe_sync(&self) -> watch::Receiver<SyncStatus> {
        self.engine.subscribe()
    }

    /// Fetch the folder tree, falling back to the cached one when the
    /// server cannot be reached.
    pub async fn load_tree(&self) -> Result<TreeSnapshot> {
        let fetched = if self.is_online() {
            self.remote.get_tree().await
        } else {
            Err(offline())
        };

        match fetched {
            Ok(fetched) => {
                let _tree = self.state.lock_tree().await;
                let pending = self.queue.list().await?;
                let merged = overlay_pending(&fetched, &pending);
                self.store.save_tree(&merged).await?;
                self.state.publish_tree(merged.clone());
                Ok(merged)
            }
            Err(RemoteError::Network(message)) => match self.store.get_tree().await? {
                Some(cached) => {
                    log::info!("Notes: using cached tree: {}", message);
                    self.state.publish_tree(cached.clone());
                    Ok(cached)
                }
                None => Err(RemoteError::Network(message).into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a note, falling back to the cached copy when the server cannot
    /// be reached. Notes with queued changes are served from the cache,
    /// which already has them applied.
    pub async fn get_note(&self, id: NoteId) -> Result<NoteSnapshot> {
        let id = self.queue.resolve(id).await;
        if id.is_temp() {
            return self.store.get_note(id).await?.ok_or(NotesError::NotFound(id));
        }

        let fetched = if self.is_online() {
            self.remote.get_note(id).await
        } else {
            Err(offline())
        };

        match fetched {
            Ok(note) => {
                if self.queue.has_pending(id).await? {
                    if let Some(cached) = self.store.get_note(id).await? {
                        return Ok(cached);
                    }
                }
                self.store.save_note(&note).await?;
                Ok(note)
            }
            Err(RemoteError::Network(message)) => match self.store.get_note(id).await? {
                Some(cached) => {
                    log::debug!("Notes: using cached note {}: {}", id, message);
                    Ok(cached)
                }
                None => Err(RemoteError::Network(message).into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a write for `id` may skip the queue
    async fn can_write_direct(&self, id: NoteId) -> Result<bool> {
        Ok(self.is_online() && !id.is_temp() && !self.queue.has_pending(id).await?)
    }

    /// Apply `edit` to the cached tree, persist it and publish it
    async fn edit_tree(&self, edit: impl FnOnce(&TreeSnapshot) -> TreeSnapshot) -> Result<TreeSnapshot> {
        let _tree = self.state.lock_tree().await;
        let current = match self.store.get_tree().await? {
            Some(tree) => tree,
            None => self.state.tree().unwrap_or_default(),
        };
        let next = edit(&current);
        self.store.save_tree(&next).await?;
        self.state.publish_tree(next.clone());
        Ok(next)
    }

    /// Create a note. Without a server the note gets a temp id and is
    /// uploaded by the next drain; it is usable right away either way.
    pub async fn create_note(
        &self,
        title: impl Into<String>,
        content: impl Into<String>,
        folder_id: Option<FolderId>,
    ) -> Result<NoteSnapshot> {
        let payload = NoteCreate {
            title: title.into(),
            content: content.into(),
            folder_id,
        };

        if self.is_online() {
            match self.remote.create_note(&payload).await {
                Ok(note) => {
                    self.store.save_note(&note).await?;
                    self.edit_tree(|t| tree::add_note(t, NoteRef::from(&note), note.folder_id))
                        .await?;
                    log::info!("Notes: created note {}", note.id);
                    return Ok(note);
                }
                Err(RemoteError::Network(message)) => {
                    log::info!("Notes: server unreachable, creating note offline: {}", message);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let id = temp_id::allocate();
        let note = NoteSnapshot::local(id, folder_id, payload.title.clone(), payload.content.clone());
        self.queue.enqueue(id, Mutation::Create { payload }).await?;
        self.store.save_note(&note).await?;
        self.edit_tree(|t| tree::add_note(t, NoteRef::from(&note), folder_id))
            .await?;
        self.engine.refresh_pending().await?;
        log::info!("Notes: created note {} offline", id);
        Ok(note)
    }

    /// Delete a note. A note that never reached the server is simply
    /// dropped along with its queued changes.
    pub async fn delete_note(&self, id: NoteId) -> Result<SaveStatus> {
        let id = self.queue.resolve(id).await;
        let mut status = SaveStatus::Saved;

        if id.is_temp() {
            let cancelled = self.queue.cancel_target(id).await?;
            log::info!("Notes: discarded offline note {} ({} queued changes)", id, cancelled.len());
        } else {
            let mut queue_it = !self.can_write_direct(id).await?;
            if !queue_it {
                match self.remote.delete_note(id).await {
                    Ok(()) | Err(RemoteError::Server { status: 404, .. }) => {}
                    Err(RemoteError::Network(message)) => {
                        log::info!("Notes: server unreachable, queueing delete of {}: {}", id, message);
                        queue_it = true;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if queue_it {
                self.queue.enqueue(id, Mutation::Delete).await?;
                status = SaveStatus::Pending;
            }
        }

        self.store.delete_note(id).await?;
        self.edit_tree(|t| tree::remove_note(t, id)).await?;
        self.state.deselect(id);
        self.engine.refresh_pending().await?;
        Ok(status)
    }

    /// Move a note to another folder, `None` being the root
    pub async fn move_note(&self, id: NoteId, folder_id: Option<FolderId>) -> Result<SaveStatus> {
        let status = self.update_note(id, NoteUpdate::move_to(folder_id)).await?;
        let id = self.queue.resolve(id).await;
        self.edit_tree(|t| match tree::find_note_ref(t, id).cloned() {
            Some(note_ref) => tree::move_note(t, id, note_ref, folder_id),
            None => t.clone(),
        })
        .await?;
        Ok(status)
    }

    pub async fn rename_note(&self, id: NoteId, title: impl Into<String>) -> Result<SaveStatus> {
        let title = title.into();
        let status = self.update_note(id, NoteUpdate::title(title.clone())).await?;
        let id = self.queue.resolve(id).await;
        self.edit_tree(|t| tree::rename_note(t, id, &title)).await?;
        Ok(status)
    }

    async fn update_note(&self, id: NoteId, update: NoteUpdate) -> Result<SaveStatus> {
        let id = self.queue.resolve(id).await;

        if self.can_write_direct(id).await? {
            match self.remote.update_note(id, &update).await {
                Ok(note) => {
                    self.store.save_note(&note).await?;
                    return Ok(SaveStatus::Saved);
                }
                Err(RemoteError::Network(message)) => {
                    log::info!("Notes: server unreachable, queueing update of {}: {}", id, message);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.queue
            .enqueue(id, Mutation::Update { payload: update.clone() })
            .await?;
        if let Some(mut note) = self.store.get_note(id).await? {
            update.apply_to(&mut note);
            self.store.save_note(&note).await?;
        }
        self.engine.refresh_pending().await?;
        Ok(SaveStatus::Pending)
    }

    /// Select the note shown in the editor
    pub async fn select_note(&self, id: Option<NoteId>) {
        let id = match id {
            Some(id) => Some(self.queue.resolve(id).await),
            None => None,
        };
        self.state.select(id);
    }

    /// Start an autosave session for a note, loading its current content
    pub async fn open_session(&self, id: NoteId) -> Result<AutosaveSession> {
        let note = self.get_note(id).await?;
        let deps = SessionDeps {
            remote: self.remote.clone(),
            store: self.store.clone(),
            queue: self.queue.clone(),
            connectivity: self.connectivity.clone(),
        };
        Ok(AutosaveSession::new(note.id, note.content, deps, &self.config))
    }

    /// Drain the mutation queue once
    pub async fn sync_now(&self) -> Result<SyncReport> {
        Ok(self.engine.sync().await?)
    }

    /// Start draining in the background on reconnect and on retry
    pub fn start_scheduler(&self) -> SyncScheduler {
        start_sync_scheduler(
            self.engine.clone(),
            self.connectivity.clone(),
            self.config.retry_interval(),
        )
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.queue.pending_count().await?)
    }

    /// Changes the server refused
    pub async fn rejected_entries(&self) -> Result<Vec<RejectedEntry>> {
        Ok(self.queue.rejected().await?)
    }

    pub async fn discard_rejected(&self, key: QueueKey) -> Result<()> {
        Ok(self.queue.discard_rejected(key).await?)
    }

    /// Give a refused change another try at the end of the queue
    pub async fn retry_rejected(&self, key: QueueKey) -> Result<Option<QueueKey>> {
        let requeued = self.queue.requeue_rejected(key).await?;
        self.engine.refresh_pending().await?;
        Ok(requeued)
    }
}
