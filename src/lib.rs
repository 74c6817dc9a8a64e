//! A Tokio-based operation queue: cancelable tasks with explicit lifecycle
//! state, admitted for execution under a bounded concurrency limit.
//!
//! A [`Task`] wraps a synchronous, callback-style or future-returning work
//! function and moves through `Pending -> Ready -> Running -> Finished`, or
//! to `Cancelled` if cancellation is requested before it starts. A
//! [`TaskQueue`] admits ready tasks in FIFO order while fewer than its
//! [`ConcurrencyLimit`] are running. Cancellation of running work is
//! cooperative.

mod error;
mod notifier;
mod queue;
mod scheduler;
mod signal;
mod state;
mod task;

pub use error::QueueError;
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use queue::{QueueBuilder, TaskQueue};
pub use signal::CompletionSignal;
pub use state::{ConcurrencyLimit, StateTransition, TaskState};
pub use task::{Task, TaskContext, TaskFuture};
