use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::remote::{NotesRemote, RemoteError};
use crate::state::{Connectivity, IdRemap, NotesState};
use crate::storage::{tree, LocalStore, NoteId, NoteRef, NoteSnapshot, StorageError, TreeSnapshot};

use super::config::{OfflineConfig, ServerRejectionPolicy};
use super::queue::{Mutation, MutationQueue, QueueEntry, QueueKey, RejectedEntry};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// State of the drain cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

/// Sync status published to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub status: SyncState,
    /// Last drain that emptied the queue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_changes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            status: SyncState::Idle,
            last_sync: None,
            pending_changes: 0,
            error: None,
        }
    }
}

/// Why a sync request did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
}

/// Outcome of one drain cycle
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub skipped: Option<SkipReason>,
    /// Entries confirmed by the server and acknowledged
    pub applied: usize,
    /// Entries moved to the rejected area during this cycle
    pub rejected: Vec<RejectedEntry>,
    /// Failure that stopped the drain, if any
    pub halted: Option<RemoteError>,
    /// Entries still queued afterwards
    pub remaining: usize,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.skipped.is_none() && self.halted.is_none() && self.rejected.is_empty()
    }
}

/// Resets the in-flight flag however the drain ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Replays the mutation queue against the remote API
pub struct SyncEngine {
    remote: Arc<dyn NotesRemote>,
    store: Arc<dyn LocalStore>,
    queue: Arc<MutationQueue>,
    connectivity: Connectivity,
    state: NotesState,
    policy: ServerRejectionPolicy,
    refresh_after_sync: bool,
    in_flight: AtomicBool,
    status: watch::Sender<SyncStatus>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn NotesRemote>,
        store: Arc<dyn LocalStore>,
        queue: Arc<MutationQueue>,
        connectivity: Connectivity,
        state: NotesState,
        config: &OfflineConfig,
    ) -> Self {
        let (status, _rx) = watch::channel(SyncStatus::default());
        Self {
            remote,
            store,
            queue,
            connectivity,
            state,
            policy: config.rejection_policy,
            refresh_after_sync: config.refresh_after_sync,
            in_flight: AtomicBool::new(false),
            status,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Refresh the pending count shown to the UI
    pub async fn refresh_pending(&self) -> Result<usize, SyncError> {
        let pending = self.queue.pending_count().await?;
        self.status.send_if_modified(|s| {
            let changed = s.pending_changes != pending;
            s.pending_changes = pending;
            changed
        });
        Ok(pending)
    }

    fn set_state(&self, state: SyncState, error: Option<String>) {
        self.status.send_modify(|s| {
            s.status = state;
            s.error = error;
            if state == SyncState::Idle {
                s.last_sync = Some(Utc::now());
            }
        });
    }

    /// Drain the queue once.
    ///
    /// Returns immediately when offline or when another drain is running.
    /// Entries are replayed strictly in queue order, one at a time.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        if !self.connectivity.is_online() {
            log::debug!("Sync: skipped, device is offline");
            return Ok(SyncReport::skipped(SkipReason::Offline));
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Sync: skipped, a drain is already running");
            return Ok(SyncReport::skipped(SkipReason::AlreadySyncing));
        }
        let _in_flight = InFlight(&self.in_flight);

        self.set_state(SyncState::Syncing, None);
        let started = Instant::now();

        let result = self.drain().await;
        match &result {
            Ok(report) => {
                if let Some(err) = &report.halted {
                    self.set_state(SyncState::Error, Some(err.to_string()));
                } else if let Some(first) = report.rejected.first() {
                    let message = format!(
                        "{} change(s) rejected by the server: {}",
                        report.rejected.len(),
                        first.reason
                    );
                    self.set_state(SyncState::Error, Some(message));
                } else {
                    self.set_state(SyncState::Idle, None);
                }
            }
            Err(e) => {
                log::error!("Sync: drain failed: {}", e);
                self.set_state(SyncState::Error, Some(e.to_string()));
            }
        }
        if let Err(e) = self.refresh_pending().await {
            log::warn!("Sync: could not count pending entries: {}", e);
        }

        let mut report = result?;
        report.duration_ms = started.elapsed().as_millis() as u64;

        if self.refresh_after_sync && report.applied > 0 && report.halted.is_none() {
            if let Err(e) = self.refresh_tree().await {
                log::warn!("Sync: tree refresh after drain failed: {}", e);
            }
        }

        log::info!(
            "Sync: applied {}, rejected {}, remaining {} in {}ms",
            report.applied,
            report.rejected.len(),
            report.remaining,
            report.duration_ms
        );
        Ok(report)
    }

    async fn drain(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        while let Some(entry) = self.queue.head().await? {
            log::debug!(
                "Sync: replaying {} {} for note {}",
                entry.queue_key,
                entry.mutation.kind(),
                entry.target_id
            );
            match self.apply(&entry).await {
                Ok(()) => report.applied += 1,
                Err(SyncError::Remote(err))
                    if err.is_network() || self.policy == ServerRejectionPolicy::Block =>
                {
                    log::warn!(
                        "Sync: {} for note {} failed, stopping: {}",
                        entry.mutation.kind(),
                        entry.target_id,
                        err
                    );
                    self.queue
                        .record_failure(entry.queue_key, &err.to_string())
                        .await?;
                    report.halted = Some(err);
                    break;
                }
                Err(SyncError::Remote(err)) => {
                    let rejected = self.reject_chain(&entry, &err.to_string()).await?;
                    report.rejected.extend(rejected);
                }
                Err(e) => return Err(e),
            }
        }

        report.remaining = self.queue.pending_count().await?;
        Ok(report)
    }

    /// Send one entry to the server and fold the result into the cache.
    /// The entry is acknowledged last.
    async fn apply(&self, entry: &QueueEntry) -> Result<(), SyncError> {
        let target = entry.target_id;
        match &entry.mutation {
            Mutation::Create { payload } => {
                if !target.is_temp() || self.queue.resolve(target).await != target {
                    // Retargeted by an earlier drain that stopped before the ack
                    log::info!("Sync: create for note {} was already applied", target);
                } else {
                    let created = self.remote.create_note(payload).await?;
                    if !self.queue.claim_create(entry.queue_key, target, created.id).await? {
                        self.discard_created(target, created.id).await?;
                        return Ok(());
                    }
                    self.adopt_created(entry.queue_key, target, created).await?;
                }
            }
            Mutation::Update { payload } => {
                if target.is_temp() {
                    return Err(never_created(target).into());
                }
                let updated = self.remote.update_note(target, payload).await?;
                self.store.save_note(&updated).await?;
            }
            Mutation::Delete => {
                if !target.is_temp() {
                    match self.remote.delete_note(target).await {
                        Ok(()) => {}
                        // Already gone on the server
                        Err(RemoteError::Server { status: 404, .. }) => {
                            log::debug!("Sync: note {} was already deleted", target);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                self.store.delete_note(target).await?;
            }
        }
        self.queue.ack(entry.queue_key).await?;
        Ok(())
    }

    /// The note was deleted locally while its create was in flight.
    /// Remove the server copy too; if that fails, queue the delete.
    async fn discard_created(&self, temp: NoteId, real: NoteId) -> Result<(), SyncError> {
        log::info!("Sync: note {} was deleted while being created as {}", temp, real);
        match self.remote.delete_note(real).await {
            Ok(()) | Err(RemoteError::Server { status: 404, .. }) => {}
            Err(e) => {
                log::warn!("Sync: could not delete {} right away, queueing: {}", real, e);
                self.queue.enqueue(real, Mutation::Delete).await?;
            }
        }
        self.store.delete_note(temp).await?;
        Ok(())
    }

    /// Move everything known about `temp` over to the server-assigned note.
    /// The queue has already been retargeted.
    async fn adopt_created(&self, create_key: QueueKey, temp: NoteId, created: NoteSnapshot) -> Result<(), SyncError> {
        let real = created.id;
        let local = self.store.get_note(temp).await?;

        // Later queued edits will overwrite the server copy; until they land,
        // keep showing what the user typed.
        let mut cached = created.clone();
        if let Some(local) = &local {
            let later_edits = self
                .queue
                .list()
                .await?
                .iter()
                .any(|e| e.target_id == real && e.queue_key != create_key);
            if later_edits {
                cached.title = local.title.clone();
                cached.content = local.content.clone();
            }
        }
        self.store.save_note(&cached).await?;
        self.store.delete_note(temp).await?;

        let _tree = self.state.lock_tree().await;
        if let Some(current) = self.store.get_tree().await? {
            let pinned = tree::find_note_ref(&current, temp)
                .map(|r| r.pinned)
                .unwrap_or(false);
            let mut note_ref = NoteRef::from(&cached);
            note_ref.pinned = pinned;
            let next = tree::replace_note(&current, temp, note_ref, created.folder_id);
            self.store.save_tree(&next).await?;
            self.state.publish_tree(next);
        }

        self.state.apply_remap(IdRemap { from: temp, to: real });
        log::info!("Sync: note {} created on server as {}", temp, real);
        Ok(())
    }

    /// Reject `entry` and every later entry for the same note, so nothing is
    /// ever applied out of order for that note.
    async fn reject_chain(&self, entry: &QueueEntry, reason: &str) -> Result<Vec<RejectedEntry>, SyncError> {
        let mut rejected = Vec::new();
        if let Some(r) = self.queue.reject(entry.queue_key, reason).await? {
            rejected.push(r);
        }
        let follow_up = format!("earlier change to note {} was rejected", entry.target_id);
        for later in self.queue.list().await? {
            if later.target_id == entry.target_id {
                if let Some(r) = self.queue.reject(later.queue_key, &follow_up).await? {
                    rejected.push(r);
                }
            }
        }
        Ok(rejected)
    }

    /// Fetch the tree from the server, lay still-queued changes over it,
    /// cache it and publish it.
    pub async fn refresh_tree(&self) -> Result<TreeSnapshot, SyncError> {
        let fetched = self.remote.get_tree().await?;
        let _tree = self.state.lock_tree().await;
        let pending = self.queue.list().await?;
        let merged = overlay_pending(&fetched, &pending);
        self.store.save_tree(&merged).await?;
        self.state.publish_tree(merged.clone());
        Ok(merged)
    }
}

fn never_created(id: NoteId) -> RemoteError {
    RemoteError::Server {
        status: 404,
        message: format!("note {} was never created on the server", id),
    }
}

/// Apply queued but unconfirmed mutations to a server tree, so a refetch
/// does not hide notes created or deleted while offline.
pub fn overlay_pending(base: &TreeSnapshot, pending: &[QueueEntry]) -> TreeSnapshot {
    let mut next = base.clone();
    for entry in pending {
        let id = entry.target_id;
        next = match &entry.mutation {
            Mutation::Create { payload } => {
                if tree::contains_note(&next, id) {
                    continue;
                }
                tree::add_note(&next, NoteRef::new(id, payload.title.clone()), payload.folder_id)
            }
            Mutation::Update { payload } => {
                let mut updated = next;
                if let Some(title) = &payload.title {
                    updated = tree::rename_note(&updated, id, title);
                }
                if let Some(folder) = payload.target_folder() {
                    if let Some(note_ref) = tree::find_note_ref(&updated, id).cloned() {
                        updated = tree::move_note(&updated, id, note_ref, folder);
                    }
                }
                updated
            }
            Mutation::Delete => tree::remove_note(&next, id),
        };
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::{MockRemote, RemoteCall};
    use crate::remote::{NoteCreate, NoteUpdate};
    use crate::storage::{FolderNode, MemoryStore};
    use crate::sync::temp_id;
    use tempfile::TempDir;

    struct Harness {
        remote: Arc<MockRemote>,
        store: Arc<MemoryStore>,
        queue: Arc<MutationQueue>,
        connectivity: Connectivity,
        state: NotesState,
        engine: SyncEngine,
        _temp: TempDir,
    }

    async fn harness(policy: ServerRejectionPolicy) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let temp = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::with_folders(vec![FolderNode::new(7, "Home")]));
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MutationQueue::open(temp.path().join("queue")).await.unwrap());
        let connectivity = Connectivity::new(true);
        let state = NotesState::new();
        let mut config = OfflineConfig::with_data_dir(temp.path().to_path_buf());
        config.rejection_policy = policy;
        config.refresh_after_sync = false;
        let engine = SyncEngine::new(
            remote.clone(),
            store.clone(),
            queue.clone(),
            connectivity.clone(),
            state.clone(),
            &config,
        );
        Harness {
            remote,
            store,
            queue,
            connectivity,
            state,
            engine,
            _temp: temp,
        }
    }

    fn create(title: &str, folder_id: Option<i64>) -> Mutation {
        Mutation::Create {
            payload: NoteCreate {
                title: title.to_string(),
                content: String::new(),
                folder_id,
            },
        }
    }

    fn update(content: &str) -> Mutation {
        Mutation::Update {
            payload: NoteUpdate::content(content),
        }
    }

    #[tokio::test]
    async fn test_updates_reach_server_in_enqueue_order() {
        let h = harness(ServerRejectionPolicy::DeadLetter).await;
        let note = h.remote.insert_note(None, "A", "");
        h.queue.enqueue(note.id, update("x")).await.unwrap();
        h.queue.enqueue(note.id, update("y")).await.unwrap();

        let report = h.engine.sync().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.applied, 2);
        assert_eq!(
            h.remote.writes(),
            vec![
                RemoteCall::Update(note.id, NoteUpdate::content("x")),
                RemoteCall::Update(note.id, NoteUpdate::content("y")),
            ]
        );
        assert_eq!(h.remote.note(note.id).unwrap().content, "y");
        assert_eq!(h.store.get_note(note.id).await.unwrap().unwrap().content, "y");
        assert_eq!(h.engine.status().status, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_create_remaps_temp_id_everywhere() {
        let h = harness(ServerRejectionPolicy::DeadLetter).await;
        let temp = temp_id::allocate();
        let local = NoteSnapshot::local(temp, Some(7), "Groceries".into(), String::new());
        h.store.save_note(&local).await.unwrap();
        let mut cached_tree = TreeSnapshot {
            roots: vec![FolderNode::new(7, "Home")],
            root_notes: vec![],
        };
        cached_tree = tree::add_note(&cached_tree, NoteRef::new(temp, "Groceries"), Some(7));
        h.store.save_tree(&cached_tree).await.unwrap();
        h.state.select(Some(temp));
        let mut remaps = h.state.subscribe_remaps();

        h.queue.enqueue(temp, create("Groceries", Some(7))).await.unwrap();
        h.queue.enqueue(temp, update("milk, eggs")).await.unwrap();

        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.applied, 2);

        let remap = remaps.recv().await.unwrap();
        assert_eq!(remap.from, temp);
        let real = remap.to;
        assert!(!real.is_temp());

        assert!(h.store.get_note(temp).await.unwrap().is_none());
        assert_eq!(h.store.get_note(real).await.unwrap().unwrap().content, "milk, eggs");

        let cached = h.store.get_tree().await.unwrap().unwrap();
        assert_eq!(tree::note_location(&cached, real), Some(Some(7)));
        assert!(!tree::contains_note(&cached, temp));
        assert_eq!(h.state.tree(), Some(cached));
        assert_eq!(h.state.selected(), Some(real));

        assert_eq!(
            h.remote.writes(),
            vec![
                RemoteCall::Create(NoteCreate {
                    title: "Groceries".into(),
                    content: String::new(),
                    folder_id: Some(7),
                }),
                RemoteCall::Update(real, NoteUpdate::content("milk, eggs")),
            ]
        );
    }

    #[tokio::test]
    async fn test_create_retargeted_before_crash_is_not_sent_again() {
        let h = harness(ServerRejectionPolicy::DeadLetter).await;
        let temp = temp_id::allocate();
        h.queue.enqueue(temp, create("Once", None)).await.unwrap();

        // The server created the note and the queue was retargeted, then
        // the process died before the entry was acknowledged.
        let created = h.remote.insert_note(None, "Once", "");
        h.queue.retarget(temp, created.id).await.unwrap();

        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.remaining, 0);
        assert!(h.remote.writes().is_empty());
        assert_eq!(h.remote.note_count(), 1);
    }

    #[tokio::test]
    async fn test_created_note_caches_server_copy_without_later_edits() {
        let h = harness(ServerRejectionPolicy::DeadLetter).await;
        let temp = temp_id::allocate();
        let local = NoteSnapshot::local(temp, None, "Draft".into(), "typed".into());
        h.store.save_note(&local).await.unwrap();
        h.queue
            .enqueue(
                temp,
                Mutation::Create {
                    payload: NoteCreate {
                        title: "Draft".into(),
                        content: "typed".into(),
                        folder_id: None,
                    },
                },
            )
            .await
            .unwrap();

        h.engine.sync().await.unwrap();
        let real = h.queue.resolve(temp).await;
        let cached = h.store.get_note(real).await.unwrap().unwrap();
        assert_eq!(cached, h.remote.note(real).unwrap());
    }

    #[tokio::test]
    async fn test_network_failure_halts_and_keeps_order() {
        let h = harness(ServerRejectionPolicy::DeadLetter).await;
        let note = h.remote.insert_note(None, "A", "");
        let first = h.queue.enqueue(note.id, update("x")).await.unwrap();
        h.queue.enqueue(note.id, update("y")).await.unwrap();

        h.remote.set_online(false);
        let report = h.engine.sync().await.unwrap();
        assert!(report.halted.as_ref().unwrap().is_network());
        assert_eq!(report.applied, 0);
        assert_eq!(report.remaining, 2);
        assert_eq!(h.engine.status().status, SyncState::Error);
        assert_eq!(h.engine.status().pending_changes, 2);

        let head = h.queue.head().await.unwrap().unwrap();
        assert_eq!(head.queue_key, first);
        assert_eq!(head.attempts, 1);

        // Resumes from the same point
        h.remote.set_online(true);
        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(h.remote.note(note.id).unwrap().content, "y");
        assert_eq!(h.engine.status().status, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_server_rejection_dead_letters_that_note_only() {
        let h = harness(ServerRejectionPolicy::DeadLetter).await;
        let other = h.remote.insert_note(None, "Other", "");
        let temp = temp_id::allocate();
        // Folder 99 does not exist on the server
        h.queue.enqueue(temp, create("Lost", Some(99))).await.unwrap();
        h.queue.enqueue(other.id, update("fine")).await.unwrap();
        h.queue.enqueue(temp, update("never sent")).await.unwrap();

        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected.len(), 2);
        assert!(report.halted.is_none());
        assert_eq!(report.remaining, 0);
        assert_eq!(h.remote.note(other.id).unwrap().content, "fine");
        assert_eq!(h.queue.rejected().await.unwrap().len(), 2);

        let status = h.engine.status();
        assert_eq!(status.status, SyncState::Error);
        assert!(status.error.unwrap().contains("Folder not found"));
    }

    #[tokio::test]
    async fn test_block_policy_halts_on_rejection() {
        let h = harness(ServerRejectionPolicy::Block).await;
        let other = h.remote.insert_note(None, "Other", "");
        h.remote.reject_title("Bad");
        h.queue.enqueue(temp_id::allocate(), create("Bad", None)).await.unwrap();
        h.queue.enqueue(other.id, update("blocked")).await.unwrap();

        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.halted.as_ref().and_then(|e| e.status()), Some(422));
        assert_eq!(report.remaining, 2);
        assert_eq!(h.remote.note(other.id).unwrap().content, "");
    }

    #[tokio::test]
    async fn test_delete_of_missing_note_is_acknowledged() {
        let h = harness(ServerRejectionPolicy::Block).await;
        h.queue.enqueue(NoteId(555), Mutation::Delete).await.unwrap();
        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn test_skips_when_offline() {
        let h = harness(ServerRejectionPolicy::DeadLetter).await;
        h.queue.enqueue(NoteId(1), Mutation::Delete).await.unwrap();
        h.connectivity.set_online(false);

        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Offline));
        assert!(h.remote.calls().is_empty());
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sync_runs_once() {
        let h = harness(ServerRejectionPolicy::DeadLetter).await;
        let note = h.remote.insert_note(None, "A", "");
        for i in 0..5 {
            h.queue.enqueue(note.id, update(&format!("v{}", i))).await.unwrap();
        }

        let (a, b) = tokio::join!(h.engine.sync(), h.engine.sync());
        let (a, b) = (a.unwrap(), b.unwrap());
        let skipped = [&a, &b]
            .iter()
            .filter(|r| r.skipped == Some(SkipReason::AlreadySyncing))
            .count();
        assert_eq!(skipped, 1);
        assert_eq!(a.applied + b.applied, 5);
        assert_eq!(h.remote.writes().len(), 5);
        assert!(!h.engine.is_syncing());
    }

    #[tokio::test]
    async fn test_refresh_tree_keeps_pending_creates_visible() {
        let h = harness(ServerRejectionPolicy::DeadLetter).await;
        let server_note = h.remote.insert_note(Some(7), "On server", "");
        let doomed = h.remote.insert_note(None, "Doomed", "");
        let temp = temp_id::allocate();
        h.queue.enqueue(temp, create("Offline", None)).await.unwrap();
        h.queue.enqueue(doomed.id, Mutation::Delete).await.unwrap();

        let refreshed = h.engine.refresh_tree().await.unwrap();
        assert_eq!(tree::note_location(&refreshed, server_note.id), Some(Some(7)));
        assert_eq!(tree::note_location(&refreshed, temp), Some(None));
        assert!(!tree::contains_note(&refreshed, doomed.id));
        assert_eq!(h.store.get_tree().await.unwrap(), Some(refreshed));
    }

    #[test]
    fn test_overlay_applies_moves_and_renames() {
        let base = tree::add_note(
            &TreeSnapshot {
                roots: vec![FolderNode::new(7, "Home")],
                root_notes: vec![],
            },
            NoteRef::new(NoteId(1), "Old"),
            None,
        );
        let pending = vec![QueueEntry {
            queue_key: QueueKey(1),
            target_id: NoteId(1),
            mutation: Mutation::Update {
                payload: NoteUpdate {
                    title: Some("New".into()),
                    content: None,
                    folder_id: Some(7),
                },
            },
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }];
        let merged = overlay_pending(&base, &pending);
        assert_eq!(tree::note_location(&merged, NoteId(1)), Some(Some(7)));
        assert_eq!(tree::find_note_ref(&merged, NoteId(1)).unwrap().title, "New");
    }
}
