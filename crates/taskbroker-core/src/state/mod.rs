//! The task status transition graph. Kept separate from the store so it
//! can be unit-tested without a database: the store enforces it with an
//! optimistic `UPDATE ... WHERE status = $expected`, but the *shape* of
//! the graph lives here.

use taskbroker_db::models::{BacklogStatus, TaskStatus};

/// Whether moving from `from` to `to` is a legal transition.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Assigned)
            | (Assigned, InProgress)
            | (Assigned, Pending) // requeue before the agent ever starts
            | (Assigned, TimedOut)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Pending) // requeue for retry
            | (InProgress, TimedOut)
            | (Failed, Pending) // retried
    )
}

/// Attempt a transition, returning the new status if legal.
pub fn transition(from: TaskStatus, to: TaskStatus) -> Result<TaskStatus, String> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(format!("cannot transition task from {from} to {to}"))
    }
}

/// Whether a task in `status` is eligible for scheduling another attempt
/// (i.e. its dispatch is not yet final).
pub fn is_terminal(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Completed)
        || (matches!(status, TaskStatus::Failed | TaskStatus::TimedOut))
}

/// Whether moving from `from` to `to` is a legal transition in the
/// backlog item's 10-state DAG.
pub fn is_valid_backlog_transition(from: BacklogStatus, to: BacklogStatus) -> bool {
    use BacklogStatus::*;
    if matches!(to, Cancelled) {
        return !is_terminal_backlog(from);
    }
    matches!(
        (from, to),
        (Backlog, Ready)
            | (Ready, InDiscovery)
            | (Ready, Park)
            | (InDiscovery, Planned)
            | (InDiscovery, Park)
            | (Planned, InProgress)
            | (Planned, Park)
            | (InProgress, Review)
            | (InProgress, Blocked)
            | (Blocked, InProgress)
            | (Review, Done)
            | (Review, InProgress)
            | (Park, Backlog)
    )
}

pub fn transition_backlog(from: BacklogStatus, to: BacklogStatus) -> Result<BacklogStatus, String> {
    if is_valid_backlog_transition(from, to) {
        Ok(to)
    } else {
        Err(format!("cannot transition backlog item from {from} to {to}"))
    }
}

pub fn is_terminal_backlog(status: BacklogStatus) -> bool {
    matches!(status, BacklogStatus::Done | BacklogStatus::Cancelled)
}
