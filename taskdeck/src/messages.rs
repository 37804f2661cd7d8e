//! Records mirrored from the remote store and the events describing their changes.
//!
//! [`Task`] and [`Profile`] are the two record collections the store exposes for a
//! principal. [`RealtimeEvent`] is the row-level change delivered out-of-band by a
//! store subscription, and [`ChangeNotification`] is the payload-free signal the
//! [`ChangeNotifier`](crate::ChangeNotifier) fans out after the mirror changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Store-assigned, globally unique task identifier.
pub type TaskId = Uuid;

/// Identifier of the authenticated principal owning a record set.
pub type OwnerId = Uuid;

/// A task as persisted by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "user_id")]
    pub owner: OwnerId,
}

/// Fields submitted when creating a task. Identifier and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, description: Option<&str>) -> Self {
        Self {
            title: title.into(),
            description: normalize_text(description),
        }
    }
}

/// Partial update of a task. `None` leaves the field untouched.
///
/// `description` is doubly optional: `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub completed: Option<bool>,
}

impl TaskPatch {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set or clear the description. Blank text clears it.
    pub fn with_description(mut self, description: Option<&str>) -> Self {
        self.description = Some(normalize_text(description));
        self
    }

    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.completed.is_none()
    }

    /// Copy every present field onto `task`.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(completed) = self.completed {
            task.completed = completed;
        }
    }
}

/// The principal's profile. Its identifier equals the owner identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: OwnerId,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Partial update of a profile. `Some(None)` clears a field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePatch {
    pub full_name: Option<Option<String>>,
    pub avatar_url: Option<Option<String>>,
}

impl ProfilePatch {
    pub fn full_name(name: Option<&str>) -> Self {
        Self {
            full_name: Some(normalize_text(name)),
            ..Self::default()
        }
    }

    pub fn avatar_url(reference: impl Into<String>) -> Self {
        Self {
            avatar_url: Some(Some(reference.into())),
            ..Self::default()
        }
    }
}

/// Record collections a store subscription can be opened against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Tasks,
    Profiles,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Tasks => "tasks",
            Table::Profiles => "profiles",
        }
    }
}

/// The type of write a realtime event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change pushed by the store, filtered to one owner.
///
/// `Deleted` carries the record as it was before removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    Inserted(Task),
    Updated(Task),
    Deleted(Task),
}

impl RealtimeEvent {
    pub fn kind(&self) -> WriteKind {
        match self {
            RealtimeEvent::Inserted(_) => WriteKind::Insert,
            RealtimeEvent::Updated(_) => WriteKind::Update,
            RealtimeEvent::Deleted(_) => WriteKind::Delete,
        }
    }

    pub fn task(&self) -> &Task {
        match self {
            RealtimeEvent::Inserted(task)
            | RealtimeEvent::Updated(task)
            | RealtimeEvent::Deleted(task) => task,
        }
    }

    /// Decode a hosted-backend row change:
    /// `{"eventType": "INSERT" | "UPDATE" | "DELETE", "new": {..}, "old": {..}}`.
    ///
    /// Inserts and updates read `new`; deletes read `old`, which must hold the full
    /// row so that the owner is known.
    pub fn from_json(raw: &str) -> Result<Self, PayloadError> {
        let change: RowChange = serde_json::from_str(raw)?;
        let (record, side) = match change.event_type {
            WriteKind::Insert | WriteKind::Update => (change.new, "new"),
            WriteKind::Delete => (change.old, "old"),
        };
        if record.as_object().is_none_or(|fields| fields.is_empty()) {
            return Err(PayloadError::MissingRecord(side));
        }
        let task: Task = serde_json::from_value(record)?;
        Ok(match change.event_type {
            WriteKind::Insert => RealtimeEvent::Inserted(task),
            WriteKind::Update => RealtimeEvent::Updated(task),
            WriteKind::Delete => RealtimeEvent::Deleted(task),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RowChange {
    #[serde(rename = "eventType")]
    event_type: WriteKind,
    #[serde(default)]
    new: serde_json::Value,
    #[serde(default)]
    old: serde_json::Value,
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Malformed realtime payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Realtime payload has no `{0}` record")]
    MissingRecord(&'static str),
}

/// Lightweight signal emitted after every visible change of the task mirror.
///
/// Carries no diff: observers re-read the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Monotonically increasing per notifier.
    pub sequence: u64,
}

/// Trim optional text; blank input becomes `None`.
pub(crate) fn normalize_text(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
