use crate::error::QueueError;
use crate::state::StateTransition;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::{debug, error, info, trace};

// --- Public Event Structs for Handlers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  /// The work function returned or signalled a value.
  Success,
  /// The task was cancelled before it started.
  Cancelled,
  Panicked,
  /// An async work function dropped its completion signal without invoking it.
  Abandoned,
}

impl<R> From<&Result<R, QueueError>> for TaskCompletionStatus {
  fn from(result: &Result<R, QueueError>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Success,
      Err(QueueError::TaskCancelled) => TaskCompletionStatus::Cancelled,
      Err(QueueError::TaskPanicked) => TaskCompletionStatus::Panicked,
      Err(_) => TaskCompletionStatus::Abandoned,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub queue_name: Arc<String>,
  /// The terminal transition: `Running -> Finished`, or `Pending`/`Ready -> Cancelled`.
  pub transition: StateTransition,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

/// Fans completion events out to user handlers.
pub(crate) struct CompletionNotifier {
  queue_name: Arc<String>,
  handlers: RwLock<Vec<CompletionHandler>>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionNotifier")
      .field("queue_name", &self.queue_name)
      .field("handler_count", &self.handlers.read().len())
      .finish()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(queue_name: Arc<String>) -> Self {
    Self {
      queue_name,
      handlers: RwLock::new(Vec::new()),
    }
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(queue_name = %*self.queue_name, "Notifier: Added new completion handler. Total handlers: {}", handlers_guard.len());
  }

  /// Runs every handler on the calling context. A panicking handler is
  /// logged and does not prevent the others from running.
  pub(crate) fn dispatch(&self, transition: StateTransition, status: TaskCompletionStatus) {
    // Snapshot so handlers may register further handlers without deadlocking.
    let handlers: Vec<CompletionHandler> = self.handlers.read().clone();
    if handlers.is_empty() {
      trace!(task_id = %transition.task_id, "No completion handlers registered, dropping notification.");
      return;
    }

    let info = TaskCompletionInfo {
      task_id: transition.task_id,
      queue_name: self.queue_name.clone(),
      transition,
      status,
      completion_time: SystemTime::now(),
    };

    debug!(task_id = %info.task_id, ?status, "Dispatching notification to {} handlers.", handlers.len());

    for handler in handlers {
      let info_for_handler = info.clone();
      if catch_unwind(AssertUnwindSafe(|| handler(info_for_handler))).is_err() {
        error!(
          "A completion handler panicked during execution. Queue: {}, Task ID: {}",
          self.queue_name, info.task_id
        );
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::state::TaskState;
  use parking_lot::Mutex;

  fn finished(task_id: u64) -> StateTransition {
    StateTransition {
      task_id,
      from: TaskState::Running,
      to: TaskState::Finished,
    }
  }

  #[test]
  fn test_status_from_result() {
    assert_eq!(TaskCompletionStatus::from(&Ok::<u8, QueueError>(1)), TaskCompletionStatus::Success);
    assert_eq!(
      TaskCompletionStatus::from(&Err::<u8, _>(QueueError::TaskPanicked)),
      TaskCompletionStatus::Panicked
    );
    assert_eq!(
      TaskCompletionStatus::from(&Err::<u8, _>(QueueError::SignalDropped)),
      TaskCompletionStatus::Abandoned
    );
  }

  #[test]
  fn test_dispatch_reaches_all_handlers_despite_panic() {
    let notifier = CompletionNotifier::new(Arc::new("notifier_unit".to_string()));
    let seen = Arc::new(Mutex::new(Vec::new()));

    notifier.add_handler(|_| panic!("handler failure"));
    let seen_clone = seen.clone();
    notifier.add_handler(move |info| seen_clone.lock().push((info.task_id, info.status)));

    notifier.dispatch(finished(7), TaskCompletionStatus::Success);
    assert_eq!(*seen.lock(), vec![(7, TaskCompletionStatus::Success)]);
  }
}
