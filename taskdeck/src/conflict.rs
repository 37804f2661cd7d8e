//! Stale-response suppression for in-flight task mutations.
//!
//! Every local mutation takes a ticket from a monotonically increasing counter
//! before it suspends on the remote call. When a change is applied to the mirror
//! (optimistically or on confirmation) the ticket is recorded per `(task, field)`.
//! A confirmation arriving later only applies the fields for which no newer
//! ticket has been recorded, so a slow response never reverts newer local state.

use std::collections::HashMap;

use crate::messages::{TaskId, TaskPatch};

pub type Ticket = u64;

/// Task fields tracked independently, so that e.g. a toggle does not discard a
/// concurrent title edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Title,
    Description,
    Completed,
}

/// Determine whether a change tagged with `ticket` may be applied.
///
/// Returns `true` if nothing was applied yet for the field, or if `ticket` is
/// strictly newer than the newest applied one.
pub fn should_apply(ticket: Ticket, newest_applied: Option<Ticket>) -> bool {
    match newest_applied {
        None => true,
        Some(newest) => ticket > newest,
    }
}

#[derive(Debug, Default)]
pub struct TicketBook {
    last_issued: Ticket,
    applied: HashMap<(TaskId, Field), Ticket>,
}

impl TicketBook {
    pub fn issue(&mut self) -> Ticket {
        self.last_issued += 1;
        self.last_issued
    }

    pub fn newest(&self, id: TaskId, field: Field) -> Option<Ticket> {
        self.applied.get(&(id, field)).copied()
    }

    pub fn record(&mut self, id: TaskId, field: Field, ticket: Ticket) {
        let slot = self.applied.entry((id, field)).or_insert(ticket);
        *slot = (*slot).max(ticket);
    }

    /// The subset of `patch` that is still fresh for `ticket`.
    pub fn fresh_patch(&self, id: TaskId, patch: &TaskPatch, ticket: Ticket) -> TaskPatch {
        let fresh = |field| should_apply(ticket, self.newest(id, field));
        TaskPatch {
            title: patch.title.clone().filter(|_| fresh(Field::Title)),
            description: patch.description.clone().filter(|_| fresh(Field::Description)),
            completed: patch.completed.filter(|_| fresh(Field::Completed)),
        }
    }

    pub fn record_patch(&mut self, id: TaskId, patch: &TaskPatch, ticket: Ticket) {
        if patch.title.is_some() {
            self.record(id, Field::Title, ticket);
        }
        if patch.description.is_some() {
            self.record(id, Field::Description, ticket);
        }
        if patch.completed.is_some() {
            self.record(id, Field::Completed, ticket);
        }
    }

    /// Drop the tickets recorded for a task that is gone.
    pub fn forget(&mut self, id: TaskId) {
        self.applied.retain(|(task, _), _| *task != id);
    }

    /// Keep only the tickets of tasks for which `keep` holds.
    pub fn retain_tasks(&mut self, mut keep: impl FnMut(&TaskId) -> bool) {
        self.applied.retain(|(task, _), _| keep(task));
    }

    /// Drop all recorded tickets. The counter keeps increasing.
    pub fn clear(&mut self) {
        self.applied.clear();
    }
}
