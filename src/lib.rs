//! Offline-first data layer for the notes client.
//!
//! Keeps the last known folder tree and note bodies on disk, queues edits
//! made without a connection, and replays them in order once the server is
//! reachable again. [`OfflineNotes`] is the entry point.

pub mod autosave;
pub mod notes;
pub mod remote;
pub mod state;
pub mod storage;
pub mod sync;

pub use autosave::{AutosaveSession, SaveStatus};
pub use notes::{NotesError, OfflineNotes};
pub use remote::{HttpRemote, NoteCreate, NoteUpdate, NotesRemote, RemoteError};
pub use state::{Connectivity, IdRemap, NotesState, NotesView};
pub use storage::{
    FileSnapshotStore, FolderId, FolderNode, LocalStore, MemoryStore, NoteId, NoteRef,
    NoteSnapshot, StorageError, TreeSnapshot,
};
pub use sync::{
    OfflineConfig, RejectedEntry, ServerRejectionPolicy, SyncReport, SyncScheduler, SyncState,
    SyncStatus,
};
