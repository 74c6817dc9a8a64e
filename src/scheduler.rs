use crate::error::QueueError;
use crate::notifier::{CompletionNotifier, TaskCompletionStatus};
use crate::state::{ConcurrencyLimit, StateTransition, TaskState};
use crate::task::{Task, TransitionObserver};

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

/// Bookkeeping guarded by the scheduler lock.
struct SchedulerState<R: Send + 'static> {
  /// Admission order is FIFO.
  pending: VecDeque<Task<R>>,
  running_count: usize,
  /// Submitted tasks not yet `Finished` or `Cancelled`.
  outstanding: usize,
  limit: ConcurrencyLimit,
  suspended: bool,
}

/// Admits ready tasks up to the concurrency limit and re-admits whenever a
/// running task finishes.
///
/// All mutations of the pending set and the counters happen under one lock.
/// Work functions are only ever spawned onto the runtime from inside it,
/// never invoked inline, so no user code runs while the lock is held.
pub(crate) struct Scheduler<R: Send + 'static> {
  queue_name: Arc<String>,
  state: Mutex<SchedulerState<R>>,
  all_complete: Condvar,
  outstanding_tx: watch::Sender<usize>,
  // Inserted under `state` before the work is spawned; read and removed without it.
  running_tasks: DashMap<u64, Task<R>>,
  tokio_handle: TokioHandle,
  notifier: CompletionNotifier,
  self_ref: Weak<Self>,
}

impl<R: Send + 'static> fmt::Debug for Scheduler<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("Scheduler")
      .field("queue_name", &self.queue_name)
      .field("pending", &state.pending.len())
      .field("running", &state.running_count)
      .field("outstanding", &state.outstanding)
      .field("limit", &state.limit)
      .field("suspended", &state.suspended)
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> Scheduler<R> {
  pub(crate) fn new(
    concurrency_limit: ConcurrencyLimit,
    suspended: bool,
    tokio_handle: TokioHandle,
    queue_name: &str,
  ) -> Arc<Self> {
    let queue_name = Arc::new(queue_name.to_string());
    let (outstanding_tx, _) = watch::channel(0usize);
    info!(queue_name = %*queue_name, limit = %concurrency_limit, suspended, "Creating task queue.");

    Arc::new_cyclic(|self_ref| Self {
      queue_name: queue_name.clone(),
      state: Mutex::new(SchedulerState {
        pending: VecDeque::new(),
        running_count: 0,
        outstanding: 0,
        limit: concurrency_limit,
        suspended,
      }),
      all_complete: Condvar::new(),
      outstanding_tx,
      running_tasks: DashMap::new(),
      tokio_handle,
      notifier: CompletionNotifier::new(queue_name),
      self_ref: self_ref.clone(),
    })
  }

  pub(crate) fn queue_name(&self) -> &Arc<String> {
    &self.queue_name
  }

  pub(crate) fn notifier(&self) -> &CompletionNotifier {
    &self.notifier
  }

  /// Registers a task (`Pending -> Ready`) and tries to admit work.
  pub(crate) fn submit(&self, task: &Task<R>) -> Result<(), QueueError> {
    let observer: Weak<dyn TransitionObserver<R>> = self.self_ref.clone();
    let mut state = self.state.lock();

    if !task.bind(observer)? {
      debug!(queue_name = %*self.queue_name, task_id = %task.id(), "Task was cancelled before submission; nothing to schedule.");
      return Ok(());
    }

    state.pending.push_back(task.clone());
    state.outstanding += 1;
    self.publish_outstanding(&state);
    debug!(
      queue_name = %*self.queue_name,
      task_id = %task.id(),
      pending = state.pending.len(),
      outstanding = state.outstanding,
      "Task submitted."
    );

    self.try_admit_next(&mut state);
    Ok(())
  }

  /// Admits from the head of the pending set while capacity allows.
  fn try_admit_next(&self, state: &mut SchedulerState<R>) {
    if state.suspended {
      trace!(queue_name = %*self.queue_name, "Queue suspended; admission deferred.");
      return;
    }

    while state.limit.admits(state.running_count) {
      let Some(task) = state.pending.pop_front() else {
        break;
      };
      let task_id = task.id();
      let Some(work) = task.begin_running() else {
        trace!(queue_name = %*self.queue_name, %task_id, "Skipping task that left the ready state before admission.");
        continue;
      };

      state.running_count += 1;
      debug_assert!(
        state.limit.get().map_or(true, |limit| state.running_count <= limit),
        "running count {} exceeded concurrency limit {}",
        state.running_count,
        state.limit
      );
      self.running_tasks.insert(task_id, task.clone());
      debug!(
        queue_name = %*self.queue_name,
        %task_id,
        running = state.running_count,
        pending = state.pending.len(),
        "Admitted task. Spawning work."
      );
      task.spawn_work(work, &self.tokio_handle, &self.queue_name);
    }
  }

  fn publish_outstanding(&self, state: &SchedulerState<R>) {
    self.outstanding_tx.send_replace(state.outstanding);
    if state.outstanding == 0 {
      self.all_complete.notify_all();
    }
  }

  pub(crate) fn cancel_all(&self) {
    let mut tasks: Vec<Task<R>> = self.state.lock().pending.iter().cloned().collect();
    // A task admitted in between shows up twice; cancelling it again is a no-op.
    tasks.extend(self.running_tasks.iter().map(|entry| entry.value().clone()));

    if tasks.is_empty() {
      info!(queue_name = %*self.queue_name, "Cancel all: no known tasks.");
      return;
    }
    info!(queue_name = %*self.queue_name, count = tasks.len(), "Cancel all: requesting cancellation of every known task.");
    // Must run without the scheduler lock: pre-start cancellation reports back through `on_terminal`.
    for task in tasks {
      task.cancel();
    }
  }

  pub(crate) fn concurrency_limit(&self) -> ConcurrencyLimit {
    self.state.lock().limit
  }

  pub(crate) fn set_concurrency_limit(&self, limit: ConcurrencyLimit) {
    let mut state = self.state.lock();
    info!(queue_name = %*self.queue_name, old = %state.limit, new = %limit, "Changing concurrency limit.");
    state.limit = limit;
    self.try_admit_next(&mut state);
  }

  pub(crate) fn is_suspended(&self) -> bool {
    self.state.lock().suspended
  }

  pub(crate) fn set_suspended(&self, suspended: bool) {
    let mut state = self.state.lock();
    if state.suspended == suspended {
      return;
    }
    info!(queue_name = %*self.queue_name, suspended, "Queue suspension changed.");
    state.suspended = suspended;
    self.try_admit_next(&mut state);
  }

  pub(crate) fn pending_count(&self) -> usize {
    self.state.lock().pending.len()
  }

  pub(crate) fn running_count(&self) -> usize {
    self.state.lock().running_count
  }

  pub(crate) fn outstanding_count(&self) -> usize {
    self.state.lock().outstanding
  }

  pub(crate) fn outstanding_receiver(&self) -> watch::Receiver<usize> {
    self.outstanding_tx.subscribe()
  }

  /// Blocks the calling thread until no task is outstanding.
  pub(crate) fn blocking_wait(&self, timeout: Option<Duration>) -> Result<(), QueueError> {
    let mut state = self.state.lock();
    match timeout {
      None => {
        while state.outstanding > 0 {
          self.all_complete.wait(&mut state);
        }
        Ok(())
      }
      Some(duration) => {
        let deadline = Instant::now() + duration;
        while state.outstanding > 0 {
          if self.all_complete.wait_until(&mut state, deadline).timed_out() && state.outstanding > 0 {
            return Err(QueueError::WaitTimedOut(duration));
          }
        }
        Ok(())
      }
    }
  }
}

impl<R: Send + 'static> TransitionObserver<R> for Scheduler<R> {
  fn on_terminal(&self, task: &Task<R>, transition: StateTransition, status: TaskCompletionStatus) {
    self.notifier.dispatch(transition, status);
    if transition.from == TaskState::Running {
      self.running_tasks.remove(&task.id());
    }

    let mut state = self.state.lock();
    match transition.from {
      TaskState::Running => {
        if state.running_count == 0 {
          error!(queue_name = %*self.queue_name, task_id = %task.id(), "Running task finished while running count was zero.");
        } else {
          state.running_count -= 1;
        }
      }
      _ => {
        // Pre-start cancellation; the admission loop may already have popped it.
        if let Some(position) = state.pending.iter().position(|pending| pending.id() == task.id()) {
          state.pending.remove(position);
        }
      }
    }

    if state.outstanding == 0 {
      error!(queue_name = %*self.queue_name, task_id = %task.id(), "Terminal transition observed with no outstanding tasks.");
    } else {
      state.outstanding -= 1;
    }
    debug!(
      queue_name = %*self.queue_name,
      task_id = %task.id(),
      to = %transition.to,
      running = state.running_count,
      outstanding = state.outstanding,
      "Task left the queue."
    );
    self.publish_outstanding(&state);
    self.try_admit_next(&mut state);
  }
}

impl<R: Send + 'static> Drop for Scheduler<R> {
  fn drop(&mut self) {
    let pending: Vec<Task<R>> = self.state.get_mut().pending.drain(..).collect();
    if pending.is_empty() {
      trace!(queue_name = %*self.queue_name, "Drop: no pending tasks.");
      return;
    }
    info!(
      queue_name = %*self.queue_name,
      count = pending.len(),
      "Task queue dropped. Cancelling tasks that never started."
    );
    for task in pending {
      task.cancel();
    }
  }
}
