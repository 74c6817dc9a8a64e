use crate::error::QueueError;
use crate::notifier::TaskCompletionInfo;
use crate::scheduler::Scheduler;
use crate::state::ConcurrencyLimit;
use crate::task::Task;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, warn};

const DEFAULT_QUEUE_NAME: &str = "task_queue";

/// Caller-facing handle for submitting tasks, waiting for them and
/// cancelling them in bulk.
///
/// Cloning is cheap and every clone drives the same queue. When the last
/// clone is dropped, tasks that never started are cancelled; running tasks
/// finish on their own but nothing further is admitted.
pub struct TaskQueue<R: Send + 'static> {
  scheduler: Arc<Scheduler<R>>,
}

impl<R: Send + 'static> Clone for TaskQueue<R> {
  fn clone(&self) -> Self {
    Self {
      scheduler: self.scheduler.clone(),
    }
  }
}

impl<R: Send + 'static> fmt::Debug for TaskQueue<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskQueue").field("scheduler", &self.scheduler).finish()
  }
}

impl<R: Send + 'static> TaskQueue<R> {
  /// Creates a queue whose work runs on `tokio_handle`.
  pub fn new(concurrency_limit: ConcurrencyLimit, tokio_handle: TokioHandle, queue_name: &str) -> Self {
    Self {
      scheduler: Scheduler::new(concurrency_limit, false, tokio_handle, queue_name),
    }
  }

  pub fn name(&self) -> &str {
    self.scheduler.queue_name()
  }

  /// Submits a task. It becomes `Ready` immediately and starts as soon as
  /// the concurrency limit allows.
  ///
  /// A task cancelled before submission is accepted and never runs.
  ///
  /// # Errors
  /// Returns `QueueError::AlreadySubmitted` if the task was already handed to
  /// a queue or started directly.
  pub fn add_task(&self, task: &Task<R>) -> Result<(), QueueError> {
    self.scheduler.submit(task).map_err(|e| {
      warn!(queue_name = %self.name(), task_id = %task.id(), "Rejected task submission: {}", e);
      e
    })
  }

  /// Submits tasks in iteration order, stopping at the first rejection.
  pub fn add_tasks<'a, I>(&self, tasks: I) -> Result<(), QueueError>
  where
    I: IntoIterator<Item = &'a Task<R>>,
  {
    for task in tasks {
      self.add_task(task)?;
    }
    Ok(())
  }

  /// Waits until every submitted task, including tasks submitted while
  /// waiting, is `Finished` or `Cancelled`. Returns immediately on an idle
  /// queue.
  ///
  /// Never returns while an async work function holds its
  /// [`CompletionSignal`](crate::CompletionSignal) without invoking it; see
  /// [`wait_until_all_complete_timeout`](Self::wait_until_all_complete_timeout).
  pub async fn wait_until_all_complete(&self) {
    let mut outstanding_rx = self.scheduler.outstanding_receiver();
    if outstanding_rx.wait_for(|outstanding| *outstanding == 0).await.is_err() {
      // The sender lives as long as the scheduler, which `self` keeps alive.
      debug!(queue_name = %self.name(), "Outstanding count channel closed while waiting.");
    }
  }

  /// Like [`wait_until_all_complete`](Self::wait_until_all_complete), giving
  /// up after `timeout`.
  ///
  /// # Errors
  /// Returns `QueueError::WaitTimedOut` if tasks are still outstanding when the timeout elapses.
  pub async fn wait_until_all_complete_timeout(&self, timeout: Duration) -> Result<(), QueueError> {
    tokio::time::timeout(timeout, self.wait_until_all_complete())
      .await
      .map_err(|_| QueueError::WaitTimedOut(timeout))
  }

  /// Blocks the calling thread until no task is outstanding, or until
  /// `timeout` elapses.
  ///
  /// Must not be called from an async context of the runtime executing the
  /// queue's work; use [`wait_until_all_complete`](Self::wait_until_all_complete) there.
  pub fn blocking_wait_until_all_complete(&self, timeout: Option<Duration>) -> Result<(), QueueError> {
    self.scheduler.blocking_wait(timeout)
  }

  /// Calls [`Task::cancel`] on every task currently pending or running.
  ///
  /// Submissions keep being accepted afterwards.
  pub fn cancel_all(&self) {
    self.scheduler.cancel_all();
  }

  pub fn concurrency_limit(&self) -> ConcurrencyLimit {
    self.scheduler.concurrency_limit()
  }

  /// Changes the concurrency limit. Raising it admits pending work right
  /// away; lowering it never interrupts running tasks, admission simply
  /// resumes once enough of them finish.
  pub fn set_concurrency_limit(&self, limit: ConcurrencyLimit) {
    self.scheduler.set_concurrency_limit(limit);
  }

  /// While suspended, no task is admitted. Resuming admits immediately.
  pub fn set_suspended(&self, suspended: bool) {
    self.scheduler.set_suspended(suspended);
  }

  pub fn is_suspended(&self) -> bool {
    self.scheduler.is_suspended()
  }

  /// Number of tasks submitted but not yet admitted.
  pub fn pending_count(&self) -> usize {
    self.scheduler.pending_count()
  }

  pub fn running_count(&self) -> usize {
    self.scheduler.running_count()
  }

  /// Number of tasks submitted and not yet `Finished` or `Cancelled`.
  pub fn outstanding_count(&self) -> usize {
    self.scheduler.outstanding_count()
  }

  /// Registers a handler invoked once per task when it finishes or is
  /// cancelled.
  ///
  /// Handlers run on the context that completed the task, before the queue
  /// updates its counters, so they have all run by the time
  /// [`wait_until_all_complete`](Self::wait_until_all_complete) returns. Keep
  /// them short.
  pub fn add_completion_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.scheduler.notifier().add_handler(handler);
  }
}

/// Configures and creates a [`TaskQueue`].
#[derive(Debug, Clone)]
pub struct QueueBuilder {
  name: String,
  concurrency_limit: ConcurrencyLimit,
  tokio_handle: Option<TokioHandle>,
  suspended: bool,
}

impl Default for QueueBuilder {
  fn default() -> Self {
    Self {
      name: DEFAULT_QUEUE_NAME.to_string(),
      concurrency_limit: ConcurrencyLimit::Unlimited,
      tokio_handle: None,
      suspended: false,
    }
  }
}

impl QueueBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn concurrency_limit(mut self, limit: ConcurrencyLimit) -> Self {
    self.concurrency_limit = limit;
    self
  }

  /// Shorthand for a concurrency limit of one.
  pub fn serial(self) -> Self {
    self.concurrency_limit(ConcurrencyLimit::SERIAL)
  }

  /// Runtime that executes the queue's work. Defaults to the runtime
  /// `build` is called from.
  pub fn tokio_handle(mut self, tokio_handle: TokioHandle) -> Self {
    self.tokio_handle = Some(tokio_handle);
    self
  }

  /// Start suspended; nothing runs until [`TaskQueue::set_suspended`] is
  /// called with `false`.
  pub fn suspended(mut self, suspended: bool) -> Self {
    self.suspended = suspended;
    self
  }

  /// # Errors
  /// Returns `QueueError::NoRuntime` if no handle was given and `build` is
  /// not called from within a Tokio runtime.
  pub fn build<R: Send + 'static>(self) -> Result<TaskQueue<R>, QueueError> {
    let tokio_handle = match self.tokio_handle {
      Some(handle) => handle,
      None => TokioHandle::try_current().map_err(|_| QueueError::NoRuntime)?,
    };
    Ok(TaskQueue {
      scheduler: Scheduler::new(self.concurrency_limit, self.suspended, tokio_handle, &self.name),
    })
  }
}
