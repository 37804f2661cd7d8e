//! The remote store collaborator: CRUD over tasks and profiles, avatar storage,
//! and owner-filtered realtime subscriptions.
//!
//! [`RemoteStore`] is the seam the mirror, profile editor and session are written
//! against. [`SeaOrmStore`] implements it on top of a SeaORM connection and
//! publishes realtime events for its own writes.

pub mod entity;
mod sea;

use std::fmt;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::messages::{
    NewTask, OwnerId, Profile, ProfilePatch, RealtimeEvent, Table, Task, TaskId, TaskPatch,
};

pub use sea::{SeaOrmStore, SeaOrmStoreBuilder};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Record with ID {0} not found")]
    NotFound(String),

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Contract of the hosted backend, scoped by owner.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// All tasks of `owner`, newest first.
    async fn fetch_tasks(&self, owner: &OwnerId) -> Result<Vec<Task>, StoreError>;

    /// Insert a task; the store assigns identifier and timestamps.
    async fn insert_task(&self, owner: &OwnerId, task: NewTask) -> Result<Task, StoreError>;

    async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<(), StoreError>;

    async fn delete_task(&self, id: &TaskId) -> Result<(), StoreError>;

    async fn fetch_profile(&self, owner: &OwnerId) -> Result<Option<Profile>, StoreError>;

    /// Create the profile of `owner`. Returns the existing one if it is already there.
    async fn insert_profile(
        &self,
        owner: &OwnerId,
        initial_name: Option<String>,
    ) -> Result<Profile, StoreError>;

    async fn update_profile(&self, owner: &OwnerId, patch: ProfilePatch)
    -> Result<(), StoreError>;

    /// Store `bytes` as the avatar of `owner`, replacing any previous one, and
    /// return its public reference.
    async fn upload_avatar(
        &self,
        owner: &OwnerId,
        bytes: Vec<u8>,
        extension: &str,
    ) -> Result<String, StoreError>;

    /// Open a realtime subscription on `table`, filtered to `owner`.
    async fn subscribe(&self, owner: &OwnerId, table: Table) -> Result<Subscription, StoreError>;
}

/// The receiver fell behind and events were dropped; the subscriber has to
/// reload to catch up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGap {
    pub missed: u64,
}

pub type EventStream = BoxStream<'static, Result<RealtimeEvent, StreamGap>>;

/// A live realtime subscription. The end of the stream means the connection was
/// lost. Dropping the subscription releases it on the store side.
pub struct Subscription {
    owner: OwnerId,
    table: Table,
    events: EventStream,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(owner: OwnerId, table: Table, events: EventStream) -> Self {
        Self {
            owner,
            table,
            events,
            release: None,
        }
    }

    /// Run `release` when the subscription is dropped.
    pub fn on_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Next event, a gap marker, or `None` once the connection is closed.
    pub async fn next(&mut self) -> Option<Result<RealtimeEvent, StreamGap>> {
        self.events.next().await
    }

    pub fn unsubscribe(self) {
        log::debug!(
            "Unsubscribing from {} for owner {}",
            self.table.as_str(),
            self.owner
        );
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("owner", &self.owner)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}
