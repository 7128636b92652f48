//! Pure transforms over a [`TreeSnapshot`].
//!
//! Every function takes the snapshot by reference and returns a fresh value,
//! so callers can compare old and new snapshots and publish the new one
//! without coordinating with whoever still holds the old one.
//!
//! A note id lives in exactly one place: the root sequence or a single
//! folder's note list. Searches stop at the first match.

use super::models::{FolderId, FolderNode, NoteId, NoteRef, TreeSnapshot};

/// Return a copy of `tree` without `note_id`. Absent ids are a no-op.
pub fn remove_note(tree: &TreeSnapshot, note_id: NoteId) -> TreeSnapshot {
    let mut next = tree.clone();
    if let Some(pos) = next.root_notes.iter().position(|n| n.id == note_id) {
        next.root_notes.remove(pos);
        return next;
    }
    remove_from_folders(&mut next.roots, note_id);
    next
}

/// Return a copy of `tree` with `note` appended to `folder_id`.
///
/// `None` means the root sequence. A folder that no longer exists (deleted
/// on another device, say) puts the note at root instead of dropping it.
pub fn add_note(tree: &TreeSnapshot, note: NoteRef, folder_id: Option<FolderId>) -> TreeSnapshot {
    let mut next = tree.clone();
    insert(&mut next, note, folder_id);
    next
}

/// Replace the ref for `from` with `note`, keeping its position.
///
/// Falls back to [`add_note`] under `folder_id` when `from` is not in the
/// tree (the snapshot may have been refetched in the meantime).
pub fn replace_note(
    tree: &TreeSnapshot,
    from: NoteId,
    note: NoteRef,
    folder_id: Option<FolderId>,
) -> TreeSnapshot {
    let mut next = tree.clone();
    // The new id may already be present if a fresh server tree was cached.
    if note.id != from && contains_note(&next, note.id) {
        next = remove_note(&next, from);
        return next;
    }
    if let Some(slot) = next.root_notes.iter_mut().find(|n| n.id == from) {
        *slot = note;
        return next;
    }
    match find_in_folders_mut(&mut next.roots, from) {
        Some(slot) => *slot = note,
        None => insert(&mut next, note, folder_id),
    }
    next
}

/// Move a note to `folder_id`, refreshing its ref on the way.
pub fn move_note(
    tree: &TreeSnapshot,
    note_id: NoteId,
    note: NoteRef,
    folder_id: Option<FolderId>,
) -> TreeSnapshot {
    add_note(&remove_note(tree, note_id), note, folder_id)
}

/// Update the title of a note's ref wherever it lives.
pub fn rename_note(tree: &TreeSnapshot, note_id: NoteId, title: &str) -> TreeSnapshot {
    let mut next = tree.clone();
    let slot = match next.root_notes.iter_mut().find(|n| n.id == note_id) {
        Some(slot) => Some(slot),
        None => find_in_folders_mut(&mut next.roots, note_id),
    };
    if let Some(slot) = slot {
        slot.title = title.to_string();
    }
    next
}

pub fn contains_note(tree: &TreeSnapshot, note_id: NoteId) -> bool {
    note_location(tree, note_id).is_some()
}

/// Where a note lives: `Some(None)` for root, `Some(Some(folder))` inside a folder.
pub fn note_location(tree: &TreeSnapshot, note_id: NoteId) -> Option<Option<FolderId>> {
    if tree.root_notes.iter().any(|n| n.id == note_id) {
        return Some(None);
    }
    folder_containing(&tree.roots, note_id).map(Some)
}

pub fn find_note_ref(tree: &TreeSnapshot, note_id: NoteId) -> Option<&NoteRef> {
    tree.root_notes
        .iter()
        .find(|n| n.id == note_id)
        .or_else(|| find_in_folders(&tree.roots, note_id))
}

/// Every note id in the tree, roots first, then folders depth-first.
pub fn note_ids(tree: &TreeSnapshot) -> Vec<NoteId> {
    let mut ids: Vec<NoteId> = tree.root_notes.iter().map(|n| n.id).collect();
    collect_ids(&tree.roots, &mut ids);
    ids
}

fn insert(tree: &mut TreeSnapshot, note: NoteRef, folder_id: Option<FolderId>) {
    let Some(folder_id) = folder_id else {
        tree.root_notes.push(note);
        return;
    };
    match find_folder_mut(&mut tree.roots, folder_id) {
        Some(folder) => folder.notes.push(note),
        None => {
            log::debug!(
                "Tree: folder {} not found for note {}, placing at root",
                folder_id,
                note.id
            );
            tree.root_notes.push(note);
        }
    }
}

fn remove_from_folders(folders: &mut [FolderNode], note_id: NoteId) -> bool {
    for folder in folders.iter_mut() {
        if let Some(pos) = folder.notes.iter().position(|n| n.id == note_id) {
            folder.notes.remove(pos);
            return true;
        }
        if remove_from_folders(&mut folder.children, note_id) {
            return true;
        }
    }
    false
}

fn find_folder_mut(folders: &mut [FolderNode], folder_id: FolderId) -> Option<&mut FolderNode> {
    for folder in folders.iter_mut() {
        if folder.id == folder_id {
            return Some(folder);
        }
        if let Some(found) = find_folder_mut(&mut folder.children, folder_id) {
            return Some(found);
        }
    }
    None
}

fn find_in_folders_mut(folders: &mut [FolderNode], note_id: NoteId) -> Option<&mut NoteRef> {
    for folder in folders.iter_mut() {
        if let Some(pos) = folder.notes.iter().position(|n| n.id == note_id) {
            return folder.notes.get_mut(pos);
        }
        if let Some(found) = find_in_folders_mut(&mut folder.children, note_id) {
            return Some(found);
        }
    }
    None
}

fn find_in_folders(folders: &[FolderNode], note_id: NoteId) -> Option<&NoteRef> {
    folders.iter().find_map(|folder| {
        folder
            .notes
            .iter()
            .find(|n| n.id == note_id)
            .or_else(|| find_in_folders(&folder.children, note_id))
    })
}

fn folder_containing(folders: &[FolderNode], note_id: NoteId) -> Option<FolderId> {
    folders.iter().find_map(|folder| {
        if folder.notes.iter().any(|n| n.id == note_id) {
            Some(folder.id)
        } else {
            folder_containing(&folder.children, note_id)
        }
    })
}

fn collect_ids(folders: &[FolderNode], out: &mut Vec<NoteId>) {
    for folder in folders {
        out.extend(folder.notes.iter().map(|n| n.id));
        collect_ids(&folder.children, out);
    }
}
