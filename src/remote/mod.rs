//! Seam to the remote notes API.

mod http;
#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{FolderId, NoteId, NoteSnapshot, TreeSnapshot};

pub use http::HttpRemote;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// The server could not be reached. Reads fall back to the cache,
    /// writes fall back to the mutation queue.
    #[error("Network error: {0}")]
    Network(String),
    /// The server answered and refused the request
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },
}

impl RemoteError {
    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Network(_) => None,
            RemoteError::Server { status, .. } => Some(*status),
        }
    }

    /// Classify a free-form transport error message.
    ///
    /// Anything that reads like a connectivity failure becomes `Network`;
    /// the rest is treated as a server-side rejection with status 0.
    pub fn classify_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        const CONNECTIVITY_HINTS: &[&str] = &[
            "network",
            "connection",
            "connect",
            "timed out",
            "timeout",
            "dns",
            "unreachable",
            "offline",
            "failed to fetch",
        ];
        if CONNECTIVITY_HINTS.iter().any(|hint| lower.contains(hint)) {
            RemoteError::Network(message)
        } else {
            RemoteError::Server { status: 0, message }
        }
    }
}

/// Body of `POST /notes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteCreate {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub folder_id: Option<FolderId>,
}

/// Body of `PATCH /notes/{id}`. Absent fields are left unchanged.
///
/// The API moves a note to the root when `folder_id` is `0`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NoteUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<FolderId>,
}

/// Folder id the API uses to mean "no folder"
pub const ROOT_FOLDER_ID: FolderId = 0;

impl NoteUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn move_to(folder_id: Option<FolderId>) -> Self {
        Self {
            folder_id: Some(folder_id.unwrap_or(ROOT_FOLDER_ID)),
            ..Default::default()
        }
    }

    /// Target folder of a move, with the root sentinel mapped back to `None`.
    /// Outer `None` means the update does not move the note.
    pub fn target_folder(&self) -> Option<Option<FolderId>> {
        self.folder_id
            .map(|id| if id == ROOT_FOLDER_ID { None } else { Some(id) })
    }

    /// Apply this update to a cached note, as the server would
    pub fn apply_to(&self, note: &mut NoteSnapshot) {
        if let Some(title) = &self.title {
            note.title = title.clone();
        }
        if let Some(content) = &self.content {
            note.content = content.clone();
        }
        if let Some(folder) = self.target_folder() {
            note.folder_id = folder;
        }
        note.updated_at = chrono::Utc::now();
    }
}

/// The remote notes API
#[async_trait]
pub trait NotesRemote: Send + Sync {
    async fn create_note(&self, payload: &NoteCreate) -> Result<NoteSnapshot, RemoteError>;

    async fn update_note(&self, id: NoteId, payload: &NoteUpdate) -> Result<NoteSnapshot, RemoteError>;

    async fn delete_note(&self, id: NoteId) -> Result<(), RemoteError>;

    async fn get_tree(&self) -> Result<TreeSnapshot, RemoteError>;

    async fn get_note(&self, id: NoteId) -> Result<NoteSnapshot, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_message() {
        assert!(RemoteError::classify_message("Connection refused (os error 111)").is_network());
        assert!(RemoteError::classify_message("TypeError: Failed to fetch").is_network());
        assert_eq!(
            RemoteError::classify_message("Folder not found"),
            RemoteError::Server {
                status: 0,
                message: "Folder not found".to_string()
            }
        );
    }

    #[test]
    fn test_update_payload_omits_absent_fields() {
        let json = serde_json::to_value(NoteUpdate::content("milk")).unwrap();
        assert_eq!(json, serde_json::json!({ "content": "milk" }));
    }

    #[test]
    fn test_move_to_root_uses_sentinel() {
        let update = NoteUpdate::move_to(None);
        assert_eq!(update.folder_id, Some(ROOT_FOLDER_ID));
        assert_eq!(update.target_folder(), Some(None));
        assert_eq!(NoteUpdate::move_to(Some(7)).target_folder(), Some(Some(7)));
        assert_eq!(NoteUpdate::content("x").target_folder(), None);
    }
}
