//! In-memory mirror of the current principal's tasks.
//!
//! The mirror is updated through two channels: mutations issued by the user and
//! realtime events pushed by the store. Both may interleave arbitrarily, so every
//! path is idempotent and keyed by task identifier:
//!
//! - `create` and `update` are confirm-then-apply.
//! - `toggle_complete` and `delete` apply optimistically before the remote call
//!   resolves. With [`OptimisticPolicy::BestEffort`] a failed call is not rolled
//!   back; the mirror stays diverged until the next `load` or a corrective event.
//! - `apply_remote_event` is last-applied-wins per identifier; events for
//!   unknown identifiers are no-ops.
//!
//! Every local change stamps the task with a mirror revision. A `load` remembers
//! the revision it was issued at, and when its response lands, tasks changed
//! since then keep their local version: the fetched snapshot is older than them.
//!
//! Deleted identifiers are remembered so that a late `Inserted` event, or a load
//! issued before the delete, cannot bring the task back. A tombstone is dropped
//! once a later load no longer returns the task, or once the task's `Deleted`
//! event arrives while no load is in flight.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::conflict::{Field, TicketBook};
use crate::messages::{NewTask, OwnerId, RealtimeEvent, Task, TaskId, TaskPatch};
use crate::notifier::ChangeNotifier;
use crate::stats::TaskStats;
use crate::store::{RemoteStore, StoreError};

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Failed to fetch tasks: {0}")]
    Fetch(StoreError),

    #[error("Remote call failed: {0}")]
    Remote(#[from] StoreError),
}

/// What happens to an optimistic change whose remote call fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OptimisticPolicy {
    /// Keep the optimistic state.
    #[default]
    BestEffort,
    /// Revert the optimistic state, unless a newer change to the same task has
    /// been applied in the meantime.
    Rollback,
}

#[derive(Debug, Default)]
struct MirrorState {
    owner: Option<OwnerId>,
    tasks: Vec<Task>,
    tickets: TicketBook,
    loads_issued: u64,
    loads_in_flight: usize,
    /// Bumped on every local change.
    revision: u64,
    /// Revision of the latest local change per task.
    touched: HashMap<TaskId, u64>,
    /// Revision at which each deleted task was removed.
    tombstones: HashMap<TaskId, u64>,
}

impl MirrorState {
    fn position(&self, id: TaskId) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == id)
    }

    fn find_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn touch(&mut self, id: TaskId) {
        let revision = self.next_revision();
        self.touched.insert(id, revision);
    }

    fn bury(&mut self, id: TaskId) {
        let revision = self.next_revision();
        self.tombstones.insert(id, revision);
        self.touched.remove(&id);
    }

    /// Apply `change` to the task if present, stamping it as changed.
    fn modify(&mut self, id: TaskId, change: impl FnOnce(&mut Task)) -> bool {
        let Some(task) = self.find_mut(id) else {
            return false;
        };
        change(task);
        self.touch(id);
        true
    }

    fn remove(&mut self, id: TaskId) -> Option<(usize, Task)> {
        let index = self.position(id)?;
        Some((index, self.tasks.remove(index)))
    }

    /// Prepend `task` unless it is already present, deleted, or foreign.
    fn prepend(&mut self, task: Task) -> bool {
        if self.owner != Some(task.owner)
            || self.tombstones.contains_key(&task.id)
            || self.position(task.id).is_some()
        {
            return false;
        }
        let id = task.id;
        self.tasks.insert(0, task);
        self.touch(id);
        true
    }

    /// Start a load. Returns its generation and the revision it was issued at.
    fn begin_load(&mut self) -> (u64, u64) {
        self.loads_issued += 1;
        self.loads_in_flight += 1;
        (self.loads_issued, self.revision)
    }

    fn end_load(&mut self) {
        self.loads_in_flight = self.loads_in_flight.saturating_sub(1);
    }

    /// Replace the tasks with a fetch of `owner` taken at revision `issued_at`,
    /// keeping local changes made after that.
    fn apply_load(&mut self, owner: OwnerId, issued_at: u64, mut fetched: Vec<Task>) {
        if self.owner != Some(owner) {
            self.owner = Some(owner);
            self.tasks.clear();
            self.tickets.clear();
            self.touched.clear();
            self.tombstones.clear();
        }
        fetched.retain(|task| task.owner == owner);

        let returned: HashSet<TaskId> = fetched.iter().map(|task| task.id).collect();
        self.tombstones
            .retain(|id, buried_at| *buried_at > issued_at || returned.contains(id));

        let tombstones = &self.tombstones;
        let mut seen = HashSet::with_capacity(fetched.len());
        fetched.retain(|task| !tombstones.contains_key(&task.id) && seen.insert(task.id));

        let touched = &self.touched;
        let newer: Vec<Task> = self
            .tasks
            .iter()
            .filter(|task| touched.get(&task.id).is_some_and(|at| *at > issued_at))
            .cloned()
            .collect();
        for task in newer {
            match fetched.iter_mut().find(|fetched| fetched.id == task.id) {
                Some(slot) => *slot = task,
                None => fetched.push(task),
            }
        }
        fetched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        self.touched.retain(|_, at| *at > issued_at);
        let present: HashSet<TaskId> = fetched.iter().map(|task| task.id).collect();
        self.tickets.retain_tasks(|id| present.contains(id));
        self.tasks = fetched;
    }

    fn apply_event(&mut self, event: RealtimeEvent) -> bool {
        if self.owner != Some(event.task().owner) {
            log::debug!("Ignoring event for foreign task {}", event.task().id);
            return false;
        }
        match event {
            RealtimeEvent::Inserted(task) => self.prepend(task),
            RealtimeEvent::Updated(task) => {
                let id = task.id;
                match self.find_mut(id) {
                    Some(slot) if *slot != task => *slot = task,
                    _ => return false,
                }
                self.touch(id);
                true
            }
            RealtimeEvent::Deleted(task) => {
                let removed = self.remove(task.id).is_some();
                self.tickets.forget(task.id);
                if self.loads_in_flight == 0 {
                    self.tombstones.remove(&task.id);
                    self.touched.remove(&task.id);
                } else {
                    // A load issued before the delete may still return the task
                    self.bury(task.id);
                }
                removed
            }
        }
    }
}

pub struct TaskMirror {
    store: Arc<dyn RemoteStore>,
    notifier: ChangeNotifier,
    policy: OptimisticPolicy,
    state: Mutex<MirrorState>,
}

impl TaskMirror {
    pub fn new(store: Arc<dyn RemoteStore>, notifier: ChangeNotifier) -> Self {
        Self {
            store,
            notifier,
            policy: OptimisticPolicy::default(),
            state: Mutex::new(MirrorState::default()),
        }
    }

    pub fn with_policy(mut self, policy: OptimisticPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> OptimisticPolicy {
        self.policy
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Owner of the mirrored tasks, `None` until the first successful `load`.
    pub fn owner(&self) -> Option<OwnerId> {
        self.state().owner
    }

    pub fn is_loaded(&self) -> bool {
        self.owner().is_some()
    }

    /// Copy of the mirrored tasks, newest first.
    pub fn snapshot(&self) -> Vec<Task> {
        self.state().tasks.clone()
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.state().tasks.iter().find(|task| task.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().tasks.is_empty()
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats::from_tasks(&self.state().tasks)
    }

    /// Replace the mirror with the store's current tasks of `owner`.
    ///
    /// On failure the mirror keeps its previous contents. If another `load` was
    /// issued while this one was suspended, this response is discarded. Local
    /// changes applied while it was suspended are kept over the fetched records.
    pub async fn load(&self, owner: OwnerId) -> Result<(), MirrorError> {
        let (generation, issued_at) = self.state().begin_load();
        let fetched = self.store.fetch_tasks(&owner).await;

        {
            let mut state = self.state();
            state.end_load();
            let tasks = fetched.map_err(|e| {
                log::error!("Failed to fetch tasks for {owner}: {e}");
                MirrorError::Fetch(e)
            })?;
            if state.loads_issued != generation {
                log::debug!("Discarding superseded load #{generation} for {owner}");
                return Ok(());
            }
            state.apply_load(owner, issued_at, tasks);
            log::debug!("Loaded {} task(s) for {owner}", state.tasks.len());
        }
        self.notifier.publish();
        Ok(())
    }

    /// Create a task and prepend the store's canonical record.
    ///
    /// Rejects a blank title before any remote call.
    pub async fn create(
        &self,
        owner: OwnerId,
        title: &str,
        description: Option<&str>,
    ) -> Result<Task, MirrorError> {
        let title = validate_title(title)?;
        let task = self
            .store
            .insert_task(&owner, NewTask::new(title, description))
            .await
            .map_err(|e| {
                log::error!("Failed to add task: {e}");
                MirrorError::Remote(e)
            })?;

        let prepended = self.state().prepend(task.clone());
        if !prepended {
            log::debug!("Task {} already mirrored or not ours", task.id);
        }
        self.notifier.publish();
        Ok(task)
    }

    /// Update title and/or description, applied locally once the store confirms.
    ///
    /// A task that no longer exists remotely is treated as success.
    pub async fn update(&self, id: TaskId, mut patch: TaskPatch) -> Result<(), MirrorError> {
        if let Some(title) = patch.title.take() {
            patch.title = Some(validate_title(&title)?);
        }
        if patch.is_empty() {
            return Ok(());
        }

        let ticket = self.state().tickets.issue();
        match self.store.update_task(&id, patch.clone()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                log::debug!("Task {id} is gone remotely, ignoring update");
                return Ok(());
            }
            Err(e) => {
                log::error!("Failed to update task {id}: {e}");
                return Err(MirrorError::Remote(e));
            }
        }

        {
            let mut state = self.state();
            let fresh = state.tickets.fresh_patch(id, &patch, ticket);
            if fresh != patch {
                log::debug!("Dropping superseded fields of update #{ticket} for {id}");
            }
            if !fresh.is_empty() {
                state.modify(id, |task| fresh.apply_to(task));
            }
            state.tickets.record_patch(id, &fresh, ticket);
        }
        self.notifier.publish();
        Ok(())
    }

    /// Flip `completed`, applied locally before the store confirms.
    pub async fn toggle_complete(
        &self,
        id: TaskId,
        current_completed: bool,
    ) -> Result<(), MirrorError> {
        let target = !current_completed;
        let ticket = {
            let mut state = self.state();
            let ticket = state.tickets.issue();
            state.modify(id, |task| task.completed = target);
            state.tickets.record(id, Field::Completed, ticket);
            ticket
        };
        self.notifier.publish();

        let patch = TaskPatch::default().with_completed(target);
        match self.store.update_task(&id, patch).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                log::error!("Failed to toggle task {id}: {e}");
                if self.policy == OptimisticPolicy::Rollback {
                    let reverted = {
                        let mut state = self.state();
                        state.tickets.newest(id, Field::Completed) == Some(ticket)
                            && state.modify(id, |task| task.completed = current_completed)
                    };
                    if reverted {
                        self.notifier.publish();
                    }
                }
                Err(MirrorError::Remote(e))
            }
        }
    }

    /// Remove a task, applied locally before the store confirms.
    ///
    /// Deleting a task that no longer exists remotely is a success.
    pub async fn delete(&self, id: TaskId) -> Result<(), MirrorError> {
        let removed = {
            let mut state = self.state();
            state.bury(id);
            state.remove(id)
        };
        self.notifier.publish();

        match self.store.delete_task(&id).await {
            Ok(()) => {
                self.state().tickets.forget(id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.state().tickets.forget(id);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to delete task {id}: {e}");
                let restored = {
                    let mut state = self.state();
                    // The task still exists remotely, so the next load may show it again.
                    state.tombstones.remove(&id);
                    match removed {
                        Some((index, task))
                            if self.policy == OptimisticPolicy::Rollback
                                && state.position(id).is_none() =>
                        {
                            let index = index.min(state.tasks.len());
                            state.tasks.insert(index, task);
                            state.touch(id);
                            true
                        }
                        _ => false,
                    }
                };
                if restored {
                    self.notifier.publish();
                }
                Err(MirrorError::Remote(e))
            }
        }
    }

    /// Apply a realtime event. Returns whether the mirror changed.
    ///
    /// Applying the same event twice leaves the mirror as applying it once.
    pub fn apply_remote_event(&self, event: RealtimeEvent) -> bool {
        let changed = self.state().apply_event(event);
        if changed {
            self.notifier.publish();
        }
        changed
    }

    fn state(&self) -> MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_title(title: &str) -> Result<String, MirrorError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(MirrorError::Validation("title must not be empty".into()));
    }
    Ok(title.to_string())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_blank_title_is_rejected() {
        assert!(matches!(validate_title("   "), Err(MirrorError::Validation(_))));
        assert!(matches!(validate_title(""), Err(MirrorError::Validation(_))));
    }

    #[test]
    fn test_title_is_trimmed() {
        assert_eq!(validate_title("  Buy milk ").unwrap(), "Buy milk");
    }

    fn task(owner: OwnerId, title: &str, minute: u32) -> Task {
        let at = chrono::Utc
            .with_ymd_and_hms(2024, 3, 1, 10, minute, 0)
            .single()
            .unwrap();
        Task {
            id: uuid::Uuid::new_v4(),
            title: title.into(),
            description: None,
            completed: false,
            created_at: at,
            updated_at: at,
            owner,
        }
    }

    fn loaded(tasks: &[Task]) -> MirrorState {
        let owner = tasks[0].owner;
        let mut state = MirrorState::default();
        let (_, issued_at) = state.begin_load();
        state.end_load();
        state.apply_load(owner, issued_at, tasks.to_vec());
        state
    }

    fn titles(state: &MirrorState) -> Vec<&str> {
        state.tasks.iter().map(|task| task.title.as_str()).collect()
    }

    #[test]
    fn test_load_keeps_task_created_while_in_flight() {
        let owner = uuid::Uuid::new_v4();
        let older = task(owner, "older", 0);
        let mut state = loaded(&[older.clone()]);

        let (_, issued_at) = state.begin_load();
        assert!(state.prepend(task(owner, "fresh", 5)));
        state.end_load();
        state.apply_load(owner, issued_at, vec![older]);

        assert_eq!(titles(&state), ["fresh", "older"]);
    }

    #[test]
    fn test_load_keeps_local_version_changed_while_in_flight() {
        let owner = uuid::Uuid::new_v4();
        let milk = task(owner, "milk", 0);
        let mut state = loaded(&[milk.clone()]);

        let (_, issued_at) = state.begin_load();
        assert!(state.modify(milk.id, |task| task.completed = true));
        state.end_load();
        state.apply_load(owner, issued_at, vec![milk.clone()]);
        assert!(state.tasks[0].completed);

        // A load issued after the change takes the fetched record again
        let (_, issued_at) = state.begin_load();
        state.end_load();
        state.apply_load(owner, issued_at, vec![milk]);
        assert!(!state.tasks[0].completed);
        assert!(state.touched.is_empty());
    }

    #[test]
    fn test_tombstone_outlives_earlier_load_only() {
        let owner = uuid::Uuid::new_v4();
        let milk = task(owner, "milk", 0);
        let mut state = loaded(&[milk.clone()]);

        let (_, before_delete) = state.begin_load();
        state.bury(milk.id);
        state.remove(milk.id);
        state.end_load();
        state.apply_load(owner, before_delete, vec![milk.clone()]);
        assert!(state.tasks.is_empty());
        assert!(state.tombstones.contains_key(&milk.id));

        let (_, after_delete) = state.begin_load();
        state.end_load();
        state.apply_load(owner, after_delete, Vec::new());
        assert!(state.tombstones.is_empty());
    }

    #[test]
    fn test_deleted_event_without_load_leaves_nothing_behind() {
        let owner = uuid::Uuid::new_v4();
        let milk = task(owner, "milk", 0);
        let mut state = loaded(&[milk.clone()]);
        state.modify(milk.id, |task| task.completed = true);
        let ticket = state.tickets.issue();
        state.tickets.record(milk.id, Field::Completed, ticket);

        assert!(state.apply_event(RealtimeEvent::Deleted(milk.clone())));

        assert!(state.tasks.is_empty());
        assert!(state.tombstones.is_empty());
        assert!(state.touched.is_empty());
        assert_eq!(state.tickets.newest(milk.id, Field::Completed), None);
    }

    #[test]
    fn test_deleted_event_during_load_is_remembered() {
        let owner = uuid::Uuid::new_v4();
        let milk = task(owner, "milk", 0);
        let mut state = loaded(&[milk.clone()]);

        let (_, issued_at) = state.begin_load();
        assert!(state.apply_event(RealtimeEvent::Deleted(milk.clone())));
        state.end_load();
        state.apply_load(owner, issued_at, vec![milk.clone()]);

        assert!(state.tasks.is_empty());
        // Replaying the delete is a no-op
        assert!(!state.apply_event(RealtimeEvent::Deleted(milk)));
        assert!(state.tombstones.is_empty());
    }
}
