//! Durable, ordered log of note mutations not yet confirmed by the server.
//!
//! Each entry is its own JSON file named after its zero-padded queue key, so
//! enqueue is a single atomic rename and ack is a single unlink. A crash
//! never leaves half an entry behind.
//!
//! Layout under the queue directory:
//! - `entries/{key}.json`: pending entries, oldest key first
//! - `rejected/{key}.json`: entries the server refused
//! - `remaps.json`: temp id to server id mappings learned while draining

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::remote::{NoteCreate, NoteUpdate};
use crate::storage::{read_json, write_json_atomic, NoteId, StorageError};

type Result<T> = std::result::Result<T, StorageError>;

/// Handle used to acknowledge a queued entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueKey(pub u64);

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020}", self.0)
    }
}

/// A queued mutation, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Mutation {
    Create { payload: NoteCreate },
    Update { payload: NoteUpdate },
    Delete,
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Create { .. } => "create",
            Mutation::Update { .. } => "update",
            Mutation::Delete => "delete",
        }
    }
}

/// A single pending mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub queue_key: QueueKey,
    /// Note the mutation applies to. For a create this is the temp id.
    pub target_id: NoteId,
    pub mutation: Mutation,
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed drain attempts
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// An entry the server refused, kept so the user can see what was lost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedEntry {
    pub entry: QueueEntry,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}

struct QueueState {
    next_key: u64,
    remaps: HashMap<NoteId, NoteId>,
}

/// File-backed mutation queue
pub struct MutationQueue {
    root: PathBuf,
    /// Serialises every file operation on the queue
    state: Mutex<QueueState>,
}

impl MutationQueue {
    /// Open (or create) the queue stored in `root`
    pub async fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join("entries")).await?;
        fs::create_dir_all(root.join("rejected")).await?;

        let mut max_key = 0;
        for dir in [root.join("entries"), root.join("rejected")] {
            for key in list_keys(&dir).await? {
                max_key = max_key.max(key.0);
            }
        }

        let remaps: HashMap<NoteId, NoteId> = read_json::<Vec<(NoteId, NoteId)>>(&root.join("remaps.json"))
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect();

        let queue = Self {
            root,
            state: Mutex::new(QueueState {
                next_key: max_key + 1,
                remaps,
            }),
        };
        queue.compact_remaps().await?;
        log::info!(
            "Queue: opened {:?} with {} pending entries",
            queue.root,
            queue.pending_count().await?
        );
        Ok(queue)
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    fn rejected_dir(&self) -> PathBuf {
        self.root.join("rejected")
    }

    fn entry_path(&self, key: QueueKey) -> PathBuf {
        self.entries_dir().join(format!("{}.json", key))
    }

    fn rejected_path(&self, key: QueueKey) -> PathBuf {
        self.rejected_dir().join(format!("{}.json", key))
    }

    fn remaps_path(&self) -> PathBuf {
        self.root.join("remaps.json")
    }

    /// Durably append a mutation and return its key.
    ///
    /// A target that was already remapped to a server id is rewritten on
    /// the way in.
    pub async fn enqueue(&self, target_id: NoteId, mutation: Mutation) -> Result<QueueKey> {
        let mut state = self.state.lock().await;
        let target_id = follow(&state.remaps, target_id);
        let queue_key = QueueKey(state.next_key);

        let entry = QueueEntry {
            queue_key,
            target_id,
            mutation,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        };
        write_json_atomic(&self.entry_path(queue_key), &entry).await?;
        state.next_key += 1;

        log::debug!(
            "Queue: enqueued {} for note {} as {}",
            entry.mutation.kind(),
            target_id,
            queue_key
        );
        Ok(queue_key)
    }

    /// All pending entries, oldest first
    pub async fn list(&self) -> Result<Vec<QueueEntry>> {
        let _state = self.state.lock().await;
        self.read_dir_entries(&self.entries_dir()).await
    }

    /// The oldest pending entry
    pub async fn head(&self) -> Result<Option<QueueEntry>> {
        Ok(self.list().await?.into_iter().next())
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let _state = self.state.lock().await;
        Ok(list_keys(&self.entries_dir()).await?.len())
    }

    /// Whether anything is still queued for `id`
    pub async fn has_pending(&self, id: NoteId) -> Result<bool> {
        Ok(self.list().await?.iter().any(|e| e.target_id == id))
    }

    /// Remove an entry after the server confirmed it.
    /// Acknowledging an unknown key is a no-op.
    pub async fn ack(&self, key: QueueKey) -> Result<()> {
        let _state = self.state.lock().await;
        remove_if_exists(&self.entry_path(key)).await?;
        log::debug!("Queue: acknowledged {}", key);
        Ok(())
    }

    /// Record a failed attempt without changing the entry's position
    pub async fn record_failure(&self, key: QueueKey, error: &str) -> Result<()> {
        let _state = self.state.lock().await;
        let path = self.entry_path(key);
        if let Some(mut entry) = read_json::<QueueEntry>(&path).await? {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
            write_json_atomic(&path, &entry).await?;
        }
        Ok(())
    }

    /// Point every pending entry for `from` at `to` and remember the mapping.
    ///
    /// Returns how many entries were rewritten.
    pub async fn retarget(&self, from: NoteId, to: NoteId) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.retarget_locked(&mut state, from, to).await
    }

    /// Retarget `from` to `to` on behalf of the create entry `key`.
    ///
    /// Returns false and changes nothing when that entry is no longer
    /// queued, i.e. the note was deleted while its create was in flight.
    pub async fn claim_create(&self, key: QueueKey, from: NoteId, to: NoteId) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !fs::try_exists(self.entry_path(key)).await? {
            return Ok(false);
        }
        self.retarget_locked(&mut state, from, to).await?;
        Ok(true)
    }

    async fn retarget_locked(&self, state: &mut QueueState, from: NoteId, to: NoteId) -> Result<usize> {
        state.remaps.insert(from, to);
        self.save_remaps(&state.remaps).await?;

        let mut rewritten = 0;
        for mut entry in self.read_dir_entries(&self.entries_dir()).await? {
            if entry.target_id == from {
                entry.target_id = to;
                write_json_atomic(&self.entry_path(entry.queue_key), &entry).await?;
                rewritten += 1;
            }
        }
        log::info!(
            "Queue: remapped note {} -> {} ({} pending entries rewritten)",
            from,
            to,
            rewritten
        );
        Ok(rewritten)
    }

    async fn save_remaps(&self, remaps: &HashMap<NoteId, NoteId>) -> Result<()> {
        let pairs: Vec<(NoteId, NoteId)> = remaps.iter().map(|(k, v)| (*k, *v)).collect();
        write_json_atomic(&self.remaps_path(), &pairs).await
    }

    /// Finish a retarget cut short by a crash, then forget mappings nothing
    /// can ask for any more.
    ///
    /// Sessions holding a temp id end with the process, so after a restart
    /// only rejected entries (which may be requeued) still need a mapping.
    async fn compact_remaps(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.remaps.is_empty() {
            return Ok(());
        }

        for mut entry in self.read_dir_entries(&self.entries_dir()).await? {
            let target = follow(&state.remaps, entry.target_id);
            if target != entry.target_id {
                entry.target_id = target;
                write_json_atomic(&self.entry_path(entry.queue_key), &entry).await?;
            }
        }

        let mut referenced = HashSet::new();
        for key in list_keys(&self.rejected_dir()).await? {
            if let Some(rejected) = read_json::<RejectedEntry>(&self.rejected_path(key)).await? {
                referenced.insert(rejected.entry.target_id);
            }
        }
        let before = state.remaps.len();
        state.remaps.retain(|from, _| referenced.contains(from));
        if state.remaps.len() != before {
            self.save_remaps(&state.remaps).await?;
            log::debug!("Queue: dropped {} stale remaps", before - state.remaps.len());
        }
        Ok(())
    }

    /// Follow recorded remaps to the id the server knows a note by
    pub async fn resolve(&self, id: NoteId) -> NoteId {
        let state = self.state.lock().await;
        follow(&state.remaps, id)
    }

    /// Drop every pending entry for `id`. Returns the removed entries.
    pub async fn cancel_target(&self, id: NoteId) -> Result<Vec<QueueEntry>> {
        let _state = self.state.lock().await;
        let mut removed = Vec::new();
        for entry in self.read_dir_entries(&self.entries_dir()).await? {
            if entry.target_id == id {
                remove_if_exists(&self.entry_path(entry.queue_key)).await?;
                removed.push(entry);
            }
        }
        if !removed.is_empty() {
            log::info!("Queue: cancelled {} entries for note {}", removed.len(), id);
        }
        Ok(removed)
    }

    /// Move an entry to the rejected area.
    ///
    /// The rejected copy is written before the pending one is removed, so a
    /// crash in between leaves the entry in both places rather than neither.
    pub async fn reject(&self, key: QueueKey, reason: &str) -> Result<Option<RejectedEntry>> {
        let _state = self.state.lock().await;
        let path = self.entry_path(key);
        let Some(entry) = read_json::<QueueEntry>(&path).await? else {
            return Ok(None);
        };
        let rejected = RejectedEntry {
            entry,
            reason: reason.to_string(),
            rejected_at: Utc::now(),
        };
        write_json_atomic(&self.rejected_path(key), &rejected).await?;
        remove_if_exists(&path).await?;
        log::warn!(
            "Queue: rejected {} for note {}: {}",
            rejected.entry.mutation.kind(),
            rejected.entry.target_id,
            reason
        );
        Ok(Some(rejected))
    }

    /// Entries the server refused, oldest first
    pub async fn rejected(&self) -> Result<Vec<RejectedEntry>> {
        let _state = self.state.lock().await;
        let mut out = Vec::new();
        for key in list_keys(&self.rejected_dir()).await? {
            if let Some(entry) = read_json::<RejectedEntry>(&self.rejected_path(key)).await? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Forget a rejected entry for good
    pub async fn discard_rejected(&self, key: QueueKey) -> Result<()> {
        let _state = self.state.lock().await;
        remove_if_exists(&self.rejected_path(key)).await
    }

    /// Put a rejected entry back at the tail of the queue under a new key
    pub async fn requeue_rejected(&self, key: QueueKey) -> Result<Option<QueueKey>> {
        let path = self.rejected_path(key);
        let rejected = {
            let _state = self.state.lock().await;
            read_json::<RejectedEntry>(&path).await?
        };
        let Some(rejected) = rejected else {
            return Ok(None);
        };
        let new_key = self
            .enqueue(rejected.entry.target_id, rejected.entry.mutation)
            .await?;
        let _state = self.state.lock().await;
        remove_if_exists(&path).await?;
        Ok(Some(new_key))
    }

    async fn read_dir_entries(&self, dir: &Path) -> Result<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        for key in list_keys(dir).await? {
            if let Some(entry) = read_json::<QueueEntry>(&dir.join(format!("{}.json", key))).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

fn follow(remaps: &HashMap<NoteId, NoteId>, mut id: NoteId) -> NoteId {
    // Chains are at most one hop in practice; the bound guards against cycles
    for _ in 0..8 {
        match remaps.get(&id) {
            Some(next) => id = *next,
            None => break,
        }
    }
    id
}

/// Keys of the entry files in `dir`, ascending. Leftover temp files are ignored.
async fn list_keys(dir: &Path) -> Result<Vec<QueueKey>> {
    let mut keys = Vec::new();
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(stem) = name.strip_suffix(".json") {
            if let Ok(key) = stem.parse::<u64>() {
                keys.push(QueueKey(key));
            }
        }
    }
    keys.sort();
    Ok(keys)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
