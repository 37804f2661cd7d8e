//! Completion statistics derived from the task mirror.
//!
//! [`TaskStats`] is a pure function of a task snapshot. [`StatisticsView`] keeps a
//! current snapshot by recomputing it whenever the change notifier fires.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::messages::Task;
use crate::mirror::TaskMirror;
use crate::notifier::{ChangeNotifier, ObserverHandle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
    /// Percentage in `0..=100`.
    pub completion_rate: u8,
}

impl TaskStats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let (total, completed) = tasks.into_iter().fold((0, 0), |(total, completed), task| {
            (total + 1, completed + usize::from(task.completed))
        });
        Self {
            total,
            completed,
            pending: total - completed,
            completion_rate: completion_rate(completed, total),
        }
    }

    /// No tasks yet, so there is nothing to report.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl fmt::Display for TaskStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} completed, {} remaining", self.completed, self.pending)
    }
}

/// `completed * 100 / total`, rounded half up; 0 when there are no tasks.
pub fn completion_rate(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let completed = completed.min(total);
    let rate = (completed * 200 + total) / (total * 2);
    u8::try_from(rate).unwrap_or(100)
}

/// Live statistics for one observer, e.g. a dashboard panel.
///
/// Holds `None` while the mirror has not been loaded yet.
pub struct StatisticsView {
    current: Arc<RwLock<Option<TaskStats>>>,
    _observer: ObserverHandle,
}

impl StatisticsView {
    /// Compute the initial snapshot and recompute on every notification until
    /// the view is dropped.
    pub fn attach(mirror: &Arc<TaskMirror>, notifier: &ChangeNotifier) -> Self {
        let current = Arc::new(RwLock::new(None));
        let weak_mirror = Arc::downgrade(mirror);
        let slot = Arc::clone(&current);
        let observer = notifier.subscribe(move || {
            if let Some(mirror) = weak_mirror.upgrade() {
                let stats = mirror.is_loaded().then(|| mirror.stats());
                *slot.write().unwrap_or_else(PoisonError::into_inner) = stats;
            }
        });
        *current.write().unwrap_or_else(PoisonError::into_inner) =
            mirror.is_loaded().then(|| mirror.stats());

        Self {
            current,
            _observer: observer,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.read().is_none()
    }

    /// Latest statistics; all zeros while loading.
    pub fn snapshot(&self) -> TaskStats {
        self.read().unwrap_or_default()
    }

    pub fn detach(self) {}

    fn read(&self) -> Option<TaskStats> {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn task(completed: bool) -> Task {
        Task {
            id: Uuid::new_v4(),
            title: "t".into(),
            description: None,
            completed,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            owner: Uuid::nil(),
        }
    }

    #[test]
    fn test_empty_collection_rate_is_zero() {
        let stats = TaskStats::from_tasks(&[] as &[Task]);
        assert_eq!(stats, TaskStats::default());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_one_of_three_completed_is_33() {
        let tasks = [task(true), task(false), task(false)];
        let stats = TaskStats::from_tasks(&tasks);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.completion_rate, 33);
    }

    #[test]
    fn test_two_of_three_rounds_up_to_67() {
        assert_eq!(completion_rate(2, 3), 67);
    }

    #[test]
    fn test_exact_half_rounds_up() {
        // 1/8 = 12.5%
        assert_eq!(completion_rate(1, 8), 13);
        assert_eq!(completion_rate(1, 2), 50);
    }

    #[test]
    fn test_rate_stays_within_bounds() {
        for total in 1..=50 {
            for completed in 0..=total {
                let rate = completion_rate(completed, total);
                assert!(rate <= 100);
                let expected = (completed as f64 * 100.0 / total as f64).round() as u8;
                assert_eq!(rate, expected, "{completed}/{total}");
            }
        }
        assert_eq!(completion_rate(7, 7), 100);
    }

    #[test]
    fn test_summary_line() {
        let tasks = [task(true), task(false)];
        assert_eq!(
            TaskStats::from_tasks(&tasks).to_string(),
            "1 completed, 1 remaining"
        );
    }
}
