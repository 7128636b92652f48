use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a note.
///
/// Server-assigned ids are positive. Notes created while offline carry a
/// negative placeholder id until the sync engine remaps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(pub i64);

impl NoteId {
    /// Whether this id is a local placeholder not yet confirmed by the server
    pub fn is_temp(self) -> bool {
        self.0 < 0
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for NoteId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Server folder identity. Folders are never created offline, so these are
/// always positive.
pub type FolderId = i64;

/// Lightweight projection of a note used for tree display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRef {
    pub id: NoteId,
    pub title: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "flexible_datetime::option"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NoteRef {
    pub fn new(id: NoteId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            pinned: false,
            updated_at: None,
        }
    }
}

impl From<&NoteSnapshot> for NoteRef {
    fn from(note: &NoteSnapshot) -> Self {
        Self {
            id: note.id,
            title: note.title.clone(),
            pinned: false,
            updated_at: Some(note.updated_at),
        }
    }
}

/// A folder and everything nested beneath it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderNode {
    pub id: FolderId,
    pub name: String,
    #[serde(default)]
    pub parent_folder_id: Option<FolderId>,
    #[serde(default)]
    pub order_index: i32,
    #[serde(default)]
    pub children: Vec<FolderNode>,
    #[serde(default)]
    pub notes: Vec<NoteRef>,
}

impl FolderNode {
    pub fn new(id: FolderId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            parent_folder_id: None,
            order_index: 0,
            children: Vec::new(),
            notes: Vec::new(),
        }
    }
}

/// The full folder/note hierarchy as last known locally.
///
/// Field names follow the `/folders` response of the notes API so a fetched
/// tree can be cached as-is.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TreeSnapshot {
    #[serde(default)]
    pub roots: Vec<FolderNode>,
    #[serde(default)]
    pub root_notes: Vec<NoteRef>,
}

/// Full note body, cached independently of the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteSnapshot {
    pub id: NoteId,
    #[serde(default)]
    pub folder_id: Option<FolderId>,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(with = "flexible_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "flexible_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl NoteSnapshot {
    /// Build a note that exists only locally so far
    pub fn local(id: NoteId, folder_id: Option<FolderId>, title: String, content: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            folder_id,
            title,
            content,
            created_at: now,
            updated_at: now,
        }
    }
}

/// (De)serialization for timestamps that may or may not carry an offset.
///
/// The notes API stores `updated_at` without timezone information, so
/// values like `2026-01-04T10:15:00.123456` are read as UTC.
mod flexible_datetime {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid timestamp {:?}: {}", raw, e))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => super::serialize(dt, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw: Option<String> = Option::deserialize(deserializer)?;
            raw.map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
