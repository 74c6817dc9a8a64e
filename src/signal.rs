use crate::error::QueueError;
use crate::task::{Task, TaskContext};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, warn};

struct SignalInner<R: Send + 'static> {
  task: Task<R>,
  fired: AtomicBool,
}

impl<R: Send + 'static> Drop for SignalInner<R> {
  fn drop(&mut self) {
    if !self.fired.swap(true, Ordering::AcqRel) {
      warn!(task_id = %self.task.id(), "Completion signal dropped without being invoked; finishing task.");
      if let Err(e) = self.task.finish(Err(QueueError::SignalDropped)) {
        error!(task_id = %self.task.id(), "Could not finish task after its signal was dropped: {}", e);
      }
    }
  }
}

/// Single-use handle an asynchronous work function invokes to report that its
/// task has finished.
///
/// Clones share the same one-shot state: across all clones, the first
/// [`complete`](CompletionSignal::complete) wins and later calls return
/// `QueueError::DoubleSignal` without touching the queue's bookkeeping. If
/// every clone is dropped without being invoked, the task finishes with
/// `QueueError::SignalDropped`.
pub struct CompletionSignal<R: Send + 'static> {
  inner: Arc<SignalInner<R>>,
}

impl<R: Send + 'static> Clone for CompletionSignal<R> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<R: Send + 'static> fmt::Debug for CompletionSignal<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionSignal")
      .field("task_id", &self.inner.task.id())
      .field("fired", &self.inner.fired.load(Ordering::Acquire))
      .finish()
  }
}

impl<R: Send + 'static> CompletionSignal<R> {
  pub(crate) fn new(task: Task<R>) -> Self {
    Self {
      inner: Arc::new(SignalInner {
        task,
        fired: AtomicBool::new(false),
      }),
    }
  }

  pub fn task_id(&self) -> u64 {
    self.inner.task.id()
  }

  /// Reports completion with the task's result. Safe to call from any thread.
  ///
  /// # Errors
  /// Returns `QueueError::DoubleSignal` if this signal (or a clone of it) was
  /// already invoked.
  pub fn complete(&self, value: R) -> Result<(), QueueError> {
    let task_id = self.inner.task.id();
    if self.inner.fired.swap(true, Ordering::AcqRel) {
      error!(%task_id, "Completion signal invoked more than once; ignoring.");
      return Err(QueueError::DoubleSignal { task_id });
    }
    self.inner.task.finish(Ok(value))
  }

  /// Whether cancellation of the task has been requested.
  pub fn is_cancellation_requested(&self) -> bool {
    self.inner.task.is_cancelled()
  }

  /// Resolves once cancellation of the task has been requested.
  pub async fn cancelled(&self) {
    self.context().cancelled().await
  }

  pub fn context(&self) -> TaskContext {
    self.inner.task.context()
  }

  /// Finishes the task with an error unless the signal already fired.
  pub(crate) fn fail(&self, err: QueueError) {
    if !self.inner.fired.swap(true, Ordering::AcqRel) {
      if let Err(e) = self.inner.task.finish(Err(err)) {
        error!(task_id = %self.inner.task.id(), "Could not fail task through its signal: {}", e);
      }
    }
  }
}
