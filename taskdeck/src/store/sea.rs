use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    DbErr, EntityTrait, QueryFilter, QueryOrder, Schema, Set, sea_query::SqliteQueryBuilder,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::entity::{avatar, profile, task};
use super::{RemoteStore, StoreError, StreamGap, Subscription};
use crate::messages::{
    NewTask, OwnerId, Profile, ProfilePatch, RealtimeEvent, Table, Task, TaskId, TaskPatch,
};

const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_AVATAR_BASE_URL: &str = "/storage/avatars";

/// A [`RemoteStore`] over a SeaORM connection.
///
/// Every successful task write is published as a [`RealtimeEvent`] to the
/// subscriptions of the owning principal, so several sessions on the same
/// store observe each other's changes.
pub struct SeaOrmStore {
    db: DatabaseConnection,
    events: Mutex<broadcast::Sender<RealtimeEvent>>,
    event_capacity: usize,
    clock: Mutex<i64>,
    avatar_base_url: String,
    active_subscriptions: Arc<AtomicUsize>,
}

impl SeaOrmStore {
    /// Get a reference to the underlying SeaORM connection.
    pub fn inner(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Number of realtime subscriptions that have not been released yet.
    pub fn active_subscriptions(&self) -> usize {
        self.active_subscriptions.load(Ordering::SeqCst)
    }

    /// Close every open realtime stream. Later subscriptions work normally.
    pub fn reset_realtime(&self) {
        let (fresh, _) = broadcast::channel(self.event_capacity);
        let old = std::mem::replace(
            &mut *self.events.lock().unwrap_or_else(PoisonError::into_inner),
            fresh,
        );
        log::info!(
            "Closing realtime streams ({} receiver(s))",
            old.receiver_count()
        );
    }

    /// The stored avatar of `owner` as `(path, bytes)`.
    pub async fn fetch_avatar(
        &self,
        owner: &OwnerId,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        let row = avatar::Entity::find_by_id(owner.to_string())
            .one(&self.db)
            .await?;
        Ok(row.map(|model| (model.path, model.content)))
    }

    /// Strictly increasing store timestamp in Unix milliseconds, so that
    /// creation order is total even for writes within the same millisecond.
    fn tick(&self) -> i64 {
        let mut last = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now().timestamp_millis().max(*last + 1);
        *last = now;
        now
    }

    fn publish(&self, event: RealtimeEvent) {
        let tx = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        log::debug!(
            "Publishing {:?} for task {} to {} receiver(s)",
            event.kind(),
            event.task().id,
            tx.receiver_count()
        );
        let _ = tx.send(event);
    }

    async fn find_task(&self, id: &TaskId) -> Result<task::Model, StoreError> {
        task::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn create_table<E>(db: &DatabaseConnection) -> Result<(), DbErr>
    where
        E: EntityTrait,
    {
        let schema = Schema::new(db.get_database_backend());
        let create_stmt = schema
            .create_table_from_entity(E::default())
            .if_not_exists()
            .to_owned();
        db.execute_unprepared(&create_stmt.to_string(SqliteQueryBuilder))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for SeaOrmStore {
    async fn fetch_tasks(&self, owner: &OwnerId) -> Result<Vec<Task>, StoreError> {
        let rows = task::Entity::find()
            .filter(task::Column::UserId.eq(owner.to_string()))
            .order_by_desc(task::Column::CreatedAt)
            .order_by_desc(task::Column::Id)
            .all(&self.db)
            .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn insert_task(&self, owner: &OwnerId, new_task: NewTask) -> Result<Task, StoreError> {
        let now = self.tick();
        let model = task::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            title: Set(new_task.title),
            description: Set(new_task.description),
            completed: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            user_id: Set(owner.to_string()),
        }
        .insert(&self.db)
        .await?;
        let task = Task::try_from(model)?;
        self.publish(RealtimeEvent::Inserted(task.clone()));
        Ok(task)
    }

    async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<(), StoreError> {
        let mut active: task::ActiveModel = self.find_task(id).await?.into();
        if let Some(title) = patch.title {
            active.title = Set(title);
        }
        if let Some(description) = patch.description {
            active.description = Set(description);
        }
        if let Some(completed) = patch.completed {
            active.completed = Set(completed);
        }
        active.updated_at = Set(self.tick());
        let updated = active.update(&self.db).await?;
        self.publish(RealtimeEvent::Updated(Task::try_from(updated)?));
        Ok(())
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), StoreError> {
        let task = Task::try_from(self.find_task(id).await?)?;
        task::Entity::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        self.publish(RealtimeEvent::Deleted(task));
        Ok(())
    }

    async fn fetch_profile(&self, owner: &OwnerId) -> Result<Option<Profile>, StoreError> {
        profile::Entity::find_by_id(owner.to_string())
            .one(&self.db)
            .await?
            .map(Profile::try_from)
            .transpose()
    }

    async fn insert_profile(
        &self,
        owner: &OwnerId,
        initial_name: Option<String>,
    ) -> Result<Profile, StoreError> {
        if let Some(existing) = self.fetch_profile(owner).await? {
            return Ok(existing);
        }
        let model = profile::ActiveModel {
            id: Set(owner.to_string()),
            full_name: Set(initial_name),
            avatar_url: Set(None),
            updated_at: Set(Some(self.tick())),
        }
        .insert(&self.db)
        .await?;
        Profile::try_from(model)
    }

    async fn update_profile(
        &self,
        owner: &OwnerId,
        patch: ProfilePatch,
    ) -> Result<(), StoreError> {
        let model = profile::Entity::find_by_id(owner.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(owner.to_string()))?;
        let mut active: profile::ActiveModel = model.into();
        if let Some(full_name) = patch.full_name {
            active.full_name = Set(full_name);
        }
        if let Some(avatar_url) = patch.avatar_url {
            active.avatar_url = Set(avatar_url);
        }
        active.updated_at = Set(Some(self.tick()));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn upload_avatar(
        &self,
        owner: &OwnerId,
        bytes: Vec<u8>,
        extension: &str,
    ) -> Result<String, StoreError> {
        let path = format!("{owner}/avatar.{}", extension.to_ascii_lowercase());
        let content_hash = blake3::hash(&bytes).to_hex().to_string();
        let now = self.tick();

        match avatar::Entity::find_by_id(owner.to_string())
            .one(&self.db)
            .await?
        {
            Some(model) => {
                let mut active: avatar::ActiveModel = model.into();
                active.path = Set(path.clone());
                active.content = Set(bytes);
                active.content_hash = Set(content_hash.clone());
                active.updated_at = Set(now);
                active.update(&self.db).await?;
            }
            None => {
                avatar::ActiveModel {
                    owner_id: Set(owner.to_string()),
                    path: Set(path.clone()),
                    content: Set(bytes),
                    content_hash: Set(content_hash.clone()),
                    updated_at: Set(now),
                }
                .insert(&self.db)
                .await?;
            }
        }

        // The version suffix changes with the content, so an overwritten avatar
        // never resolves to a cached image.
        Ok(format!(
            "{}/{}?v={}",
            self.avatar_base_url.trim_end_matches('/'),
            path,
            &content_hash[..16]
        ))
    }

    async fn subscribe(&self, owner: &OwnerId, table: Table) -> Result<Subscription, StoreError> {
        if table != Table::Tasks {
            return Err(StoreError::Unavailable(format!(
                "realtime is not published for `{}`",
                table.as_str()
            )));
        }
        let owner = *owner;
        let rx = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe();

        let events = futures::stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.task().owner == owner => return Some((Ok(event), rx)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        return Some((Err(StreamGap { missed }), rx));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed();

        self.active_subscriptions.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active_subscriptions);
        log::debug!("Opened realtime subscription on {} for {owner}", table.as_str());
        Ok(Subscription::new(owner, table, events).on_release(move || {
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

/// Builder for [`SeaOrmStore`].
pub struct SeaOrmStoreBuilder {
    database_url: String,
    avatar_base_url: String,
    event_capacity: usize,
}

impl SeaOrmStoreBuilder {
    pub fn new(url: &str) -> Self {
        Self {
            database_url: url.to_string(),
            avatar_base_url: DEFAULT_AVATAR_BASE_URL.to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Read `TASKDECK_DATABASE_URL` (default `sqlite::memory:`) and
    /// `TASKDECK_AVATAR_BASE_URL`.
    pub fn from_env() -> Self {
        let url = std::env::var("TASKDECK_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite::memory:".to_string());
        let mut builder = Self::new(&url);
        if let Ok(base) = std::env::var("TASKDECK_AVATAR_BASE_URL") {
            builder = builder.with_avatar_base_url(&base);
        }
        builder
    }

    /// Prefix of the public avatar references returned by uploads.
    pub fn with_avatar_base_url(mut self, url: &str) -> Self {
        self.avatar_base_url = url.to_string();
        self
    }

    /// Per-subscriber buffer; a subscriber falling further behind sees a [`StreamGap`].
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub async fn build(self) -> Result<SeaOrmStore, DbErr> {
        let mut opts = ConnectOptions::new(&self.database_url);
        // Every pooled connection would open its own in-memory database.
        if self.database_url.contains(":memory:") {
            opts.max_connections(1);
        }
        let db = Database::connect(opts).await?;

        SeaOrmStore::create_table::<task::Entity>(&db).await?;
        SeaOrmStore::create_table::<profile::Entity>(&db).await?;
        SeaOrmStore::create_table::<avatar::Entity>(&db).await?;

        let (events, _) = broadcast::channel(self.event_capacity);
        log::info!("Connected task store at {}", self.database_url);

        Ok(SeaOrmStore {
            db,
            events: Mutex::new(events),
            event_capacity: self.event_capacity,
            clock: Mutex::new(0),
            avatar_base_url: self.avatar_base_url,
            active_subscriptions: Arc::new(AtomicUsize::new(0)),
        })
    }
}
