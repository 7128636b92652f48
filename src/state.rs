//! Reactive state shared with the UI layer.
//!
//! The UI subscribes to watch channels; the data layer computes new values
//! and publishes them. Nothing here is mutated in place from the outside.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};

use crate::storage::{NoteId, TreeSnapshot};

/// Device connectivity as reported by the platform
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report a connectivity change. Returns true when the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!("Connectivity: device is now {}", if online { "online" } else { "offline" });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// A temp id was replaced by the id the server assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRemap {
    pub from: NoteId,
    pub to: NoteId,
}

/// What the UI renders from
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NotesView {
    /// Last known tree, `None` until one was loaded or cached
    pub tree: Option<TreeSnapshot>,
    /// Note currently open in the editor
    pub selected: Option<NoteId>,
}

/// State container for [`NotesView`] plus the remap event stream
#[derive(Clone)]
pub struct NotesState {
    view: Arc<watch::Sender<NotesView>>,
    remaps: broadcast::Sender<IdRemap>,
    /// Held across every read-modify-write of the cached tree
    tree_lock: Arc<Mutex<()>>,
}

impl Default for NotesState {
    fn default() -> Self {
        Self::new()
    }
}

impl NotesState {
    pub fn new() -> Self {
        let (view, _rx) = watch::channel(NotesView::default());
        let (remaps, _rx) = broadcast::channel(64);
        Self {
            view: Arc::new(view),
            remaps,
            tree_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Serialise edits of the cached tree. Never hold this across a remote call.
    pub async fn lock_tree(&self) -> OwnedMutexGuard<()> {
        self.tree_lock.clone().lock_owned().await
    }

    pub fn subscribe(&self) -> watch::Receiver<NotesView> {
        self.view.subscribe()
    }

    pub fn subscribe_remaps(&self) -> broadcast::Receiver<IdRemap> {
        self.remaps.subscribe()
    }

    pub fn view(&self) -> NotesView {
        self.view.borrow().clone()
    }

    pub fn tree(&self) -> Option<TreeSnapshot> {
        self.view.borrow().tree.clone()
    }

    pub fn selected(&self) -> Option<NoteId> {
        self.view.borrow().selected
    }

    /// Adopt a new tree snapshot. Equal snapshots do not wake subscribers.
    pub fn publish_tree(&self, tree: TreeSnapshot) {
        self.view.send_if_modified(|view| {
            if view.tree.as_ref() == Some(&tree) {
                false
            } else {
                view.tree = Some(tree);
                true
            }
        });
    }

    pub fn select(&self, id: Option<NoteId>) {
        self.view.send_if_modified(|view| {
            let changed = view.selected != id;
            view.selected = id;
            changed
        });
    }

    /// Clear the selection if it points at `id`
    pub fn deselect(&self, id: NoteId) {
        self.view.send_if_modified(|view| {
            if view.selected == Some(id) {
                view.selected = None;
                true
            } else {
                false
            }
        });
    }

    /// Rewrite references to a remapped note and announce the change.
    ///
    /// The tree itself is republished by whoever rewrote it; this covers the
    /// selection and any listener holding ids of its own.
    pub fn apply_remap(&self, remap: IdRemap) {
        self.view.send_if_modified(|view| {
            if view.selected == Some(remap.from) {
                view.selected = Some(remap.to);
                true
            } else {
                false
            }
        });
        // No receivers is fine
        let _ = self.remaps.send(remap);
    }
}
