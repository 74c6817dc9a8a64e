use std::time::Duration;

use thiserror::Error;

/// Errors that can occur within the `futures_operations` queue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
  #[error("Task was cancelled before it started running")]
  TaskCancelled,

  #[error("Task work function panicked")]
  TaskPanicked,

  #[error("Completion signal for task {task_id} was invoked more than once")]
  DoubleSignal { task_id: u64 },

  #[error("Completion signal was dropped without being invoked")]
  SignalDropped,

  #[error("Task result not yet available or already taken")]
  ResultUnavailable,

  #[error("Task {task_id} was already submitted to a queue or started")]
  AlreadySubmitted { task_id: u64 },

  #[error("Concurrency limit must be at least 1")]
  InvalidConcurrencyLimit,

  #[error("Timed out after {0:?} waiting for outstanding tasks")]
  WaitTimedOut(Duration),

  #[error("No Tokio runtime available to execute tasks")]
  NoRuntime,
}
