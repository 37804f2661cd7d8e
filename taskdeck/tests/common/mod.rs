#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use taskdeck::{
    NewTask, OwnerId, Principal, Profile, ProfilePatch, RemoteStore, SeaOrmStore,
    SeaOrmStoreBuilder, StoreError, Subscription, Table, Task, TaskId, TaskPatch,
};
use tokio::sync::Semaphore;
use uuid::Uuid;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub async fn memory_store() -> Arc<SeaOrmStore> {
    init_logging();
    Arc::new(
        SeaOrmStoreBuilder::new("sqlite::memory:")
            .build()
            .await
            .expect("Failed to create store"),
    )
}

pub fn principal() -> Principal {
    Principal::new(Uuid::new_v4())
}

/// Poll `condition` until it holds or two seconds have passed.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    FetchTasks,
    InsertTask,
    UpdateTask,
    DeleteTask,
    FetchProfile,
    InsertProfile,
    UpdateProfile,
    UploadAvatar,
    Subscribe,
}

/// A [`RemoteStore`] over a real store that fails selected operations on demand
/// and can hold individual calls until the test releases them.
///
/// A held `fetch_tasks` reads the store first and holds its response.
pub struct FlakyStore {
    inner: Arc<SeaOrmStore>,
    failing: Mutex<HashSet<Op>>,
    calls: Mutex<HashMap<Op, usize>>,
    holding: Mutex<HashSet<Op>>,
    held: Mutex<HashMap<Op, Vec<Arc<Semaphore>>>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<SeaOrmStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
            holding: Mutex::new(HashSet::new()),
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn inner(&self) -> &Arc<SeaOrmStore> {
        &self.inner
    }

    pub fn fail(&self, op: Op) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn heal(&self, op: Op) {
        self.failing.lock().unwrap().remove(&op);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    /// Hold every following call of `op` until released one by one.
    pub fn hold(&self, op: Op) {
        self.holding.lock().unwrap().insert(op);
    }

    /// Number of calls of `op` held so far, released or not.
    pub fn held(&self, op: Op) -> usize {
        self.held.lock().unwrap().get(&op).map_or(0, Vec::len)
    }

    /// Let the `index`-th held call of `op` proceed.
    pub fn release(&self, op: Op, index: usize) {
        self.held.lock().unwrap()[&op][index].add_permits(1);
    }

    async fn wait_if_held(&self, op: Op) {
        let gate = {
            if !self.holding.lock().unwrap().contains(&op) {
                return;
            }
            let gate = Arc::new(Semaphore::new(0));
            self.held
                .lock()
                .unwrap()
                .entry(op)
                .or_default()
                .push(Arc::clone(&gate));
            gate
        };
        gate.acquire().await.expect("gate closed").forget();
    }

    fn enter(&self, op: Op) -> Result<(), StoreError> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        self.check(op)
    }

    fn check(&self, op: Op) -> Result<(), StoreError> {
        if self.failing.lock().unwrap().contains(&op) {
            return Err(StoreError::Unavailable(format!("injected failure in {op:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FlakyStore {
    async fn fetch_tasks(&self, owner: &OwnerId) -> Result<Vec<Task>, StoreError> {
        self.enter(Op::FetchTasks)?;
        let tasks = self.inner.fetch_tasks(owner).await;
        self.wait_if_held(Op::FetchTasks).await;
        tasks
    }

    async fn insert_task(&self, owner: &OwnerId, task: NewTask) -> Result<Task, StoreError> {
        self.enter(Op::InsertTask)?;
        self.inner.insert_task(owner, task).await
    }

    async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<(), StoreError> {
        *self.calls.lock().unwrap().entry(Op::UpdateTask).or_default() += 1;
        self.wait_if_held(Op::UpdateTask).await;
        self.check(Op::UpdateTask)?;
        self.inner.update_task(id, patch).await
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), StoreError> {
        self.enter(Op::DeleteTask)?;
        self.inner.delete_task(id).await
    }

    async fn fetch_profile(&self, owner: &OwnerId) -> Result<Option<Profile>, StoreError> {
        self.enter(Op::FetchProfile)?;
        self.inner.fetch_profile(owner).await
    }

    async fn insert_profile(
        &self,
        owner: &OwnerId,
        initial_name: Option<String>,
    ) -> Result<Profile, StoreError> {
        self.enter(Op::InsertProfile)?;
        self.inner.insert_profile(owner, initial_name).await
    }

    async fn update_profile(
        &self,
        owner: &OwnerId,
        patch: ProfilePatch,
    ) -> Result<(), StoreError> {
        self.enter(Op::UpdateProfile)?;
        self.inner.update_profile(owner, patch).await
    }

    async fn upload_avatar(
        &self,
        owner: &OwnerId,
        bytes: Vec<u8>,
        extension: &str,
    ) -> Result<String, StoreError> {
        self.enter(Op::UploadAvatar)?;
        self.inner.upload_avatar(owner, bytes, extension).await
    }

    async fn subscribe(&self, owner: &OwnerId, table: Table) -> Result<Subscription, StoreError> {
        self.enter(Op::Subscribe)?;
        self.inner.subscribe(owner, table).await
    }
}
