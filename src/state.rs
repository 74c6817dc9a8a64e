use crate::error::QueueError;

use std::fmt;
use std::num::NonZeroUsize;

/// Lifecycle state of a [`Task`](crate::Task).
///
/// States only move forward along `Pending < Ready < Running < Finished`.
/// `Cancelled` can be entered from `Pending` or `Ready` only. `Cancelled` and
/// `Finished` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
  Pending,
  Ready,
  Running,
  Cancelled,
  Finished,
}

impl TaskState {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskState::Cancelled | TaskState::Finished)
  }

  /// Whether the state machine permits moving from `self` to `next`.
  pub(crate) fn can_transition_to(self, next: TaskState) -> bool {
    matches!(
      (self, next),
      (TaskState::Pending, TaskState::Ready)
        | (TaskState::Ready, TaskState::Running)
        | (TaskState::Running, TaskState::Finished)
        | (TaskState::Pending, TaskState::Cancelled)
        | (TaskState::Ready, TaskState::Cancelled)
    )
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      TaskState::Pending => "pending",
      TaskState::Ready => "ready",
      TaskState::Running => "running",
      TaskState::Cancelled => "cancelled",
      TaskState::Finished => "finished",
    };
    f.write_str(name)
  }
}

/// A single state change of a task, as observed by the scheduler and by
/// completion handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
  pub task_id: u64,
  pub from: TaskState,
  pub to: TaskState,
}

/// Maximum number of tasks a queue lets run at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyLimit {
  Limited(NonZeroUsize),
  #[default]
  Unlimited,
}

impl ConcurrencyLimit {
  /// One task at a time, in submission order.
  pub const SERIAL: ConcurrencyLimit = ConcurrencyLimit::Limited(NonZeroUsize::MIN);

  pub fn new(limit: usize) -> Result<Self, QueueError> {
    NonZeroUsize::new(limit)
      .map(ConcurrencyLimit::Limited)
      .ok_or(QueueError::InvalidConcurrencyLimit)
  }

  /// Returns `None` for [`ConcurrencyLimit::Unlimited`].
  pub fn get(&self) -> Option<usize> {
    match self {
      ConcurrencyLimit::Limited(n) => Some(n.get()),
      ConcurrencyLimit::Unlimited => None,
    }
  }

  /// Whether one more task may start while `running` tasks are executing.
  pub(crate) fn admits(&self, running: usize) -> bool {
    match self {
      ConcurrencyLimit::Limited(n) => running < n.get(),
      ConcurrencyLimit::Unlimited => true,
    }
  }
}

impl TryFrom<usize> for ConcurrencyLimit {
  type Error = QueueError;

  fn try_from(limit: usize) -> Result<Self, Self::Error> {
    ConcurrencyLimit::new(limit)
  }
}

impl From<NonZeroUsize> for ConcurrencyLimit {
  fn from(limit: NonZeroUsize) -> Self {
    ConcurrencyLimit::Limited(limit)
  }
}

impl fmt::Display for ConcurrencyLimit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ConcurrencyLimit::Limited(n) => write!(f, "{}", n),
      ConcurrencyLimit::Unlimited => f.write_str("unlimited"),
    }
  }
}
