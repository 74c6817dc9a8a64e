use crate::error::QueueError;
use crate::notifier::TaskCompletionStatus;
use crate::signal::CompletionSignal;
use crate::state::{StateTransition, TaskState};

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, Instrument, Span};

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// The future type produced by a future-returning work function.
pub type TaskFuture<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// The caller-supplied computation a task wraps.
pub(crate) enum Work<R: Send + 'static> {
  Sync(Box<dyn FnOnce(&TaskContext) -> R + Send + 'static>),
  Async(Box<dyn FnOnce(CompletionSignal<R>) + Send + 'static>),
  Future(Box<dyn FnOnce(TaskContext) -> TaskFuture<R> + Send + 'static>),
}

/// Work taken out of a task started directly, with the runtime it needs.
enum DirectRun<R: Send + 'static> {
  Sync(Box<dyn FnOnce(&TaskContext) -> R + Send + 'static>),
  Async(Box<dyn FnOnce(CompletionSignal<R>) + Send + 'static>),
  Future(Box<dyn FnOnce(TaskContext) -> TaskFuture<R> + Send + 'static>, TokioHandle),
}

/// Receives terminal transitions of tasks it has been bound to.
///
/// Called outside of the task's own lock, exactly once per task.
pub(crate) trait TransitionObserver<R: Send + 'static>: Send + Sync {
  fn on_terminal(&self, task: &Task<R>, transition: StateTransition, status: TaskCompletionStatus);
}

/// Read-only view of a task handed to its work function.
#[derive(Debug, Clone)]
pub struct TaskContext {
  task_id: u64,
  token: CancellationToken,
}

impl TaskContext {
  pub fn task_id(&self) -> u64 {
    self.task_id
  }

  /// Whether someone called [`Task::cancel`]. Work functions should poll this
  /// and return early; the task still ends `Finished`.
  pub fn is_cancellation_requested(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Resolves once cancellation has been requested.
  pub async fn cancelled(&self) {
    self.token.cancelled().await
  }
}

struct TaskCore<R: Send + 'static> {
  state: TaskState,
  work: Option<Work<R>>,
  result: Option<Result<R, QueueError>>,
  observer: Option<Weak<dyn TransitionObserver<R>>>,
  // Set once the task is handed to a queue or started directly.
  bound: bool,
}

struct TaskInner<R: Send + 'static> {
  task_id: u64,
  token: CancellationToken,
  core: Mutex<TaskCore<R>>,
  state_tx: watch::Sender<TaskState>,
}

/// A cancelable unit of work with explicit lifecycle state.
///
/// `Task` is a cheap, cloneable handle; every clone refers to the same task.
/// A task is submitted to at most one [`TaskQueue`](crate::TaskQueue), or
/// started directly with [`Task::start`].
pub struct Task<R: Send + 'static> {
  inner: Arc<TaskInner<R>>,
}

impl<R: Send + 'static> Clone for Task<R> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<R: Send + 'static> fmt::Debug for Task<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task")
      .field("task_id", &self.inner.task_id)
      .field("state", &self.state())
      .field("cancel_requested", &self.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> Task<R> {
  /// Creates a task around a synchronous work function. The task finishes
  /// when the function returns.
  pub fn new<F>(work: F) -> Self
  where
    F: FnOnce(&TaskContext) -> R + Send + 'static,
  {
    Self::with_work(Work::Sync(Box::new(work)))
  }

  /// Creates a task around an asynchronous, callback-style work function.
  ///
  /// The function must return promptly and arrange for the
  /// [`CompletionSignal`] to be invoked exactly once, from any thread, on every
  /// code path. A signal that is kept alive but never invoked holds its
  /// concurrency slot forever and stalls
  /// [`wait_until_all_complete`](crate::TaskQueue::wait_until_all_complete).
  pub fn new_async<F>(work: F) -> Self
  where
    F: FnOnce(CompletionSignal<R>) + Send + 'static,
  {
    Self::with_work(Work::Async(Box::new(work)))
  }

  /// Creates a task whose work function returns a future; the future's
  /// output becomes the task result.
  pub fn from_future<F, Fut>(work: F) -> Self
  where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
  {
    Self::with_work(Work::Future(Box::new(move |ctx| Box::pin(work(ctx)) as TaskFuture<R>)))
  }

  fn with_work(work: Work<R>) -> Self {
    let task_id = NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let (state_tx, _) = watch::channel(TaskState::Pending);
    trace!(%task_id, "Task created.");
    Self {
      inner: Arc::new(TaskInner {
        task_id,
        token: CancellationToken::new(),
        core: Mutex::new(TaskCore {
          state: TaskState::Pending,
          work: Some(work),
          result: None,
          observer: None,
          bound: false,
        }),
        state_tx,
      }),
    }
  }

  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.inner.task_id
  }

  pub fn state(&self) -> TaskState {
    self.inner.core.lock().state
  }

  /// Whether cancellation has been requested. Once true, stays true.
  pub fn is_cancelled(&self) -> bool {
    self.inner.token.is_cancelled()
  }

  pub fn is_terminal(&self) -> bool {
    self.state().is_terminal()
  }

  /// Requests cancellation.
  ///
  /// A task that has not started yet moves straight to `Cancelled` and its
  /// work function is never invoked. A running task is not interrupted: the
  /// request is only visible to the work function through its context or
  /// signal, and the task still ends `Finished`. Calling this on a terminal
  /// task is a no-op. Never blocks on the task's work.
  pub fn cancel(&self) {
    let (transition, observer, work) = {
      let mut core = self.inner.core.lock();
      self.inner.token.cancel();
      if !core.state.can_transition_to(TaskState::Cancelled) {
        trace!(task_id = %self.inner.task_id, state = %core.state, "Cancel requested after start; advisory only.");
        return;
      }
      let transition = self.set_state(&mut core, TaskState::Cancelled);
      (transition, core.observer.clone(), core.work.take())
    };
    drop(work);
    debug!(task_id = %self.inner.task_id, from = %transition.from, "Task cancelled before it started.");
    self.notify_observer(observer, transition, TaskCompletionStatus::Cancelled);
  }

  /// Runs the task without a queue.
  ///
  /// A synchronous work function runs to completion on the calling thread. A
  /// callback-style work function is invoked on the calling thread and this
  /// returns as soon as it does. A future-returning work function is spawned
  /// on the current Tokio runtime.
  ///
  /// # Errors
  /// Returns `QueueError::AlreadySubmitted` if the task was started or queued before.
  /// Returns `QueueError::TaskCancelled` if the task was cancelled.
  /// Returns `QueueError::NoRuntime` for future work outside a Tokio runtime; the task stays `Pending`.
  pub fn start(&self) -> Result<(), QueueError> {
    let task_id = self.inner.task_id;
    let run = {
      let mut core = self.inner.core.lock();
      if core.bound {
        return Err(QueueError::AlreadySubmitted { task_id });
      }
      match core.state {
        TaskState::Pending => {}
        TaskState::Cancelled => return Err(QueueError::TaskCancelled),
        _ => return Err(QueueError::AlreadySubmitted { task_id }),
      }
      let run = match core.work.take() {
        Some(Work::Sync(f)) => DirectRun::Sync(f),
        Some(Work::Async(f)) => DirectRun::Async(f),
        Some(Work::Future(f)) => match TokioHandle::try_current() {
          Ok(handle) => DirectRun::Future(f, handle),
          Err(_) => {
            core.work = Some(Work::Future(f));
            return Err(QueueError::NoRuntime);
          }
        },
        None => {
          error!(%task_id, "Pending task has no work function; refusing to start it.");
          return Err(QueueError::ResultUnavailable);
        }
      };
      core.bound = true;
      self.set_state(&mut core, TaskState::Ready);
      self.set_state(&mut core, TaskState::Running);
      run
    };

    debug!(%task_id, "Starting task directly.");
    match run {
      DirectRun::Sync(f) => self.run_sync(f),
      DirectRun::Async(f) => self.run_async(f),
      DirectRun::Future(f, handle) => self.spawn_future(f, &handle, info_span!("direct_task", %task_id)),
    }
    Ok(())
  }

  /// Waits until the task reaches a terminal state and returns that state.
  pub async fn wait(&self) -> TaskState {
    let mut rx = self.inner.state_tx.subscribe();
    let waited = rx.wait_for(|state| state.is_terminal()).await.map(|state| *state);
    match waited {
      Ok(state) => state,
      Err(_) => self.state(),
    }
  }

  /// Subscribes to the task's state changes.
  pub fn subscribe(&self) -> watch::Receiver<TaskState> {
    self.inner.state_tx.subscribe()
  }

  /// Takes the task result.
  ///
  /// # Errors
  /// Returns `QueueError::TaskCancelled` if the task ended `Cancelled`.
  /// Returns `QueueError::TaskPanicked` if the work function panicked.
  /// Returns `QueueError::SignalDropped` if an async work function dropped its signal.
  /// Returns `QueueError::ResultUnavailable` if the task has not finished or the result was already taken.
  pub fn take_result(&self) -> Result<R, QueueError> {
    let mut core = self.inner.core.lock();
    match core.state {
      TaskState::Cancelled => Err(QueueError::TaskCancelled),
      TaskState::Finished => core.result.take().unwrap_or(Err(QueueError::ResultUnavailable)),
      _ => Err(QueueError::ResultUnavailable),
    }
  }

  /// Waits for the task to finish, then takes its result.
  pub async fn await_result(&self) -> Result<R, QueueError> {
    self.wait().await;
    self.take_result()
  }

  pub(crate) fn context(&self) -> TaskContext {
    TaskContext {
      task_id: self.inner.task_id,
      token: self.inner.token.clone(),
    }
  }

  /// Hands the task to a queue: `Pending -> Ready`.
  ///
  /// Returns `Ok(false)` if the task was cancelled before submission; it is
  /// then accepted but never scheduled.
  pub(crate) fn bind(&self, observer: Weak<dyn TransitionObserver<R>>) -> Result<bool, QueueError> {
    let mut core = self.inner.core.lock();
    if core.bound {
      return Err(QueueError::AlreadySubmitted {
        task_id: self.inner.task_id,
      });
    }
    core.bound = true;
    match core.state {
      TaskState::Pending => {
        core.observer = Some(observer);
        self.set_state(&mut core, TaskState::Ready);
        Ok(true)
      }
      TaskState::Cancelled => Ok(false),
      _ => Err(QueueError::AlreadySubmitted {
        task_id: self.inner.task_id,
      }),
    }
  }

  /// `Ready -> Running`. Returns the work function to invoke, or `None` if the
  /// task is no longer ready (cancelled in the meantime).
  pub(crate) fn begin_running(&self) -> Option<Work<R>> {
    let mut core = self.inner.core.lock();
    if core.state != TaskState::Ready {
      return None;
    }
    self.set_state(&mut core, TaskState::Running);
    core.work.take()
  }

  /// `Running -> Finished`, storing the result. Exactly one call succeeds.
  pub(crate) fn finish(&self, result: Result<R, QueueError>) -> Result<(), QueueError> {
    let status = TaskCompletionStatus::from(&result);
    let (transition, observer) = {
      let mut core = self.inner.core.lock();
      if core.state != TaskState::Running {
        return Err(QueueError::DoubleSignal {
          task_id: self.inner.task_id,
        });
      }
      core.result = Some(result);
      let transition = self.set_state(&mut core, TaskState::Finished);
      (transition, core.observer.clone())
    };
    debug!(task_id = %self.inner.task_id, ?status, "Task finished.");
    self.notify_observer(observer, transition, status);
    Ok(())
  }

  /// Executes admitted work on the queue's runtime. Never runs user code on
  /// the calling thread.
  pub(crate) fn spawn_work(&self, work: Work<R>, tokio_handle: &TokioHandle, queue_name: &str) {
    let task_id = self.inner.task_id;
    let span = info_span!("queued_task", %queue_name, %task_id);
    match work {
      Work::Sync(f) => {
        let task = self.clone();
        tokio_handle.spawn_blocking(move || span.in_scope(|| task.run_sync(f)));
      }
      Work::Async(f) => {
        let task = self.clone();
        tokio_handle.spawn(async move { task.run_async(f) }.instrument(span));
      }
      Work::Future(f) => self.spawn_future(f, tokio_handle, span),
    }
  }

  fn run_sync(&self, f: Box<dyn FnOnce(&TaskContext) -> R + Send + 'static>) {
    let ctx = self.context();
    let result = match catch_unwind(AssertUnwindSafe(|| f(&ctx))) {
      Ok(value) => Ok(value),
      Err(_panic_payload) => {
        error!(task_id = %self.inner.task_id, "Task work function panicked.");
        Err(QueueError::TaskPanicked)
      }
    };
    if let Err(e) = self.finish(result) {
      error!(task_id = %self.inner.task_id, "Synchronous task could not finish: {}", e);
    }
  }

  fn run_async(&self, f: Box<dyn FnOnce(CompletionSignal<R>) + Send + 'static>) {
    let signal = CompletionSignal::new(self.clone());
    let guard = signal.clone();
    if catch_unwind(AssertUnwindSafe(move || f(signal))).is_err() {
      error!(task_id = %self.inner.task_id, "Async task work function panicked before returning.");
      guard.fail(QueueError::TaskPanicked);
    }
  }

  fn spawn_future(&self, f: Box<dyn FnOnce(TaskContext) -> TaskFuture<R> + Send + 'static>, tokio_handle: &TokioHandle, span: Span) {
    let task = self.clone();
    let ctx = self.context();
    tokio_handle.spawn(
      async move {
        let outcome = AssertUnwindSafe(async move { f(ctx).await }).catch_unwind().await;
        let result = match outcome {
          Ok(value) => Ok(value),
          Err(_panic_payload) => {
            error!(task_id = %task.id(), "Task future panicked.");
            Err(QueueError::TaskPanicked)
          }
        };
        if let Err(e) = task.finish(result) {
          error!(task_id = %task.id(), "Future task could not finish: {}", e);
        }
      }
      .instrument(span),
    );
  }

  fn set_state(&self, core: &mut TaskCore<R>, next: TaskState) -> StateTransition {
    debug_assert!(
      core.state.can_transition_to(next),
      "illegal task transition {} -> {}",
      core.state,
      next
    );
    let transition = StateTransition {
      task_id: self.inner.task_id,
      from: core.state,
      to: next,
    };
    core.state = next;
    self.inner.state_tx.send_replace(next);
    trace!(task_id = %self.inner.task_id, from = %transition.from, to = %next, "Task state changed.");
    transition
  }

  fn notify_observer(
    &self,
    observer: Option<Weak<dyn TransitionObserver<R>>>,
    transition: StateTransition,
    status: TaskCompletionStatus,
  ) {
    if let Some(observer) = observer.and_then(|weak| weak.upgrade()) {
      observer.on_terminal(self, transition, status);
    }
  }
}
