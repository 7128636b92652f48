//! Debounced saving of the note open in the editor.
//!
//! An [`AutosaveSession`] belongs to one open note. Edits restart a trailing
//! debounce timer; when it fires the content goes straight to the server if
//! possible, otherwise into the mutation queue. The outcome is published as a
//! [`SaveStatus`] so the editor can show "saved" and "queued" differently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::notes::NotesError;
use crate::remote::{NoteUpdate, NotesRemote, RemoteError};
use crate::state::Connectivity;
use crate::storage::{LocalStore, NoteId, StorageError};
use crate::sync::{Mutation, MutationQueue, OfflineConfig};

/// Save state shown next to the editor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    Idle,
    Saving,
    /// The server has the content
    Saved,
    Error,
    /// Queued locally, not on the server yet
    Pending,
}

/// Everything a session needs to reach the server, the cache and the queue
#[derive(Clone)]
pub(crate) struct SessionDeps {
    pub remote: Arc<dyn NotesRemote>,
    pub store: Arc<dyn LocalStore>,
    pub queue: Arc<MutationQueue>,
    pub connectivity: Connectivity,
}

struct EditState {
    /// Latest content not yet handed to a save
    unsaved: Option<String>,
    /// Content last saved or queued by this session
    baseline: String,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every edit so a stale timer knows it lost
    generation: u64,
}

struct SessionInner {
    /// Id the session was opened with; may be a temp id
    opened_as: NoteId,
    deps: SessionDeps,
    debounce: Duration,
    status_display: Duration,
    status: watch::Sender<SaveStatus>,
    status_epoch: AtomicU64,
    edit: Mutex<EditState>,
    /// One save at a time
    save_lock: tokio::sync::Mutex<()>,
}

/// Autosave controller for a single note
pub struct AutosaveSession {
    inner: Arc<SessionInner>,
}

impl AutosaveSession {
    pub(crate) fn new(note_id: NoteId, content: String, deps: SessionDeps, config: &OfflineConfig) -> Self {
        let (status, _rx) = watch::channel(SaveStatus::Idle);
        Self {
            inner: Arc::new(SessionInner {
                opened_as: note_id,
                deps,
                debounce: config.debounce(),
                status_display: config.status_display(),
                status,
                status_epoch: AtomicU64::new(0),
                edit: Mutex::new(EditState {
                    unsaved: None,
                    baseline: content,
                    timer: None,
                    generation: 0,
                }),
                save_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Current id of the note, following a temp id to its server id once
    /// the create went through
    pub async fn note_id(&self) -> NoteId {
        self.inner.deps.queue.resolve(self.inner.opened_as).await
    }

    pub fn status(&self) -> SaveStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SaveStatus> {
        self.inner.status.subscribe()
    }

    /// Whether an edit is waiting to be saved
    pub fn has_unsaved(&self) -> bool {
        self.inner.edit().unsaved.is_some()
    }

    /// Report the editor's current content.
    ///
    /// Restarts the debounce timer. Content equal to what was last saved
    /// cancels the timer instead.
    pub fn set_content(&self, content: impl Into<String>) {
        let content = content.into();
        let mut edit = self.inner.edit();
        edit.generation += 1;
        if let Some(timer) = edit.timer.take() {
            timer.abort();
        }
        if content == edit.baseline {
            edit.unsaved = None;
            return;
        }
        edit.unsaved = Some(content);

        let generation = edit.generation;
        let debounce = self.inner.debounce;
        let weak = Arc::downgrade(&self.inner);
        edit.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(generation).await;
            }
        }));
    }

    /// Save the latest content now instead of waiting for the timer
    pub async fn save_now(&self) -> Result<SaveStatus, NotesError> {
        if let Some(timer) = self.inner.edit().timer.take() {
            timer.abort();
        }
        self.inner.flush().await
    }

    /// Save anything outstanding and stop the timer
    pub async fn close(self) -> Result<SaveStatus, NotesError> {
        self.save_now().await
    }
}

impl SessionInner {
    fn edit(&self) -> MutexGuard<'_, EditState> {
        self.edit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fire(self: Arc<Self>, generation: u64) {
        {
            let mut edit = self.edit();
            if edit.generation != generation {
                return;
            }
            // From here on the save must not be aborted by a new edit
            edit.timer = None;
        }
        if let Err(e) = self.flush().await {
            log::warn!("Autosave: save of note {} failed: {}", self.opened_as, e);
        }
    }

    async fn flush(self: &Arc<Self>) -> Result<SaveStatus, NotesError> {
        let _saving = self.save_lock.lock().await;
        let unsaved = self.edit().unsaved.take();
        let Some(content) = unsaved else {
            return Ok(*self.status.borrow());
        };
        self.save(content).await
    }

    async fn save(self: &Arc<Self>, content: String) -> Result<SaveStatus, NotesError> {
        self.status.send_replace(SaveStatus::Saving);
        let id = self.deps.queue.resolve(self.opened_as).await;

        match self.try_direct(id, &content).await {
            Ok(true) => {
                self.saved(content);
                self.finish(SaveStatus::Saved);
                return Ok(SaveStatus::Saved);
            }
            Ok(false) => {}
            Err(e) => {
                self.restore(content);
                self.finish(SaveStatus::Error);
                return Err(e);
            }
        }

        match self.enqueue(id, &content).await {
            Ok(()) => {
                log::debug!("Autosave: queued content of note {}", id);
                self.saved(content);
                self.finish(SaveStatus::Pending);
                Ok(SaveStatus::Pending)
            }
            Err(e) => {
                log::error!("Autosave: could not queue note {}: {}", id, e);
                self.restore(content);
                self.finish(SaveStatus::Error);
                Err(e.into())
            }
        }
    }

    /// Write straight to the server when that cannot overtake a queued
    /// change. Returns false when the content has to go through the queue.
    async fn try_direct(&self, id: NoteId, content: &str) -> Result<bool, NotesError> {
        if !self.deps.connectivity.is_online() || id.is_temp() {
            return Ok(false);
        }
        if self.deps.queue.has_pending(id).await? {
            return Ok(false);
        }
        match self.deps.remote.update_note(id, &NoteUpdate::content(content)).await {
            Ok(note) => {
                if let Err(e) = self.deps.store.save_note(&note).await {
                    log::error!("Autosave: saved note {} but could not cache it: {}", id, e);
                    return Err(e.into());
                }
                log::debug!("Autosave: saved note {}", id);
                Ok(true)
            }
            Err(RemoteError::Network(message)) => {
                log::info!("Autosave: server unreachable, queueing note {}: {}", id, message);
                Ok(false)
            }
            Err(e) => {
                log::warn!("Autosave: server refused note {}: {}", id, e);
                Err(e.into())
            }
        }
    }

    async fn enqueue(&self, id: NoteId, content: &str) -> Result<(), StorageError> {
        let update = NoteUpdate::content(content);
        self.deps
            .queue
            .enqueue(id, Mutation::Update { payload: update.clone() })
            .await?;
        if let Some(mut note) = self.deps.store.get_note(id).await? {
            update.apply_to(&mut note);
            self.deps.store.save_note(&note).await?;
        }
        Ok(())
    }

    fn saved(&self, content: String) {
        self.edit().baseline = content;
    }

    /// Put content back as unsaved unless a newer edit replaced it
    fn restore(&self, content: String) {
        let mut edit = self.edit();
        if edit.unsaved.is_none() {
            edit.unsaved = Some(content);
        }
    }

    /// Publish a final status and fall back to idle after the display window
    fn finish(self: &Arc<Self>, status: SaveStatus) {
        self.status.send_replace(status);
        let epoch = self.status_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let weak: Weak<Self> = Arc::downgrade(self);
        let display = self.status_display;
        tokio::spawn(async move {
            tokio::time::sleep(display).await;
            if let Some(inner) = weak.upgrade() {
                if inner.status_epoch.load(Ordering::SeqCst) == epoch {
                    inner.status.send_if_modified(|s| {
                        let changed = *s != SaveStatus::Idle;
                        *s = SaveStatus::Idle;
                        changed
                    });
                }
            }
        });
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let edit = self.edit.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = edit.timer.take() {
            timer.abort();
        }
    }
}
