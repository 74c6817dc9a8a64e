use futures_operations::{ConcurrencyLimit, Task, TaskQueue, TaskState};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Cancellation Example ---");

  let queue = TaskQueue::new(ConcurrencyLimit::SERIAL, Handle::current(), "cancellation_queue");

  // Polls for cancellation and stops early; still finishes normally.
  let long_running = Task::from_future(|ctx| async move {
    for step in 0..50u32 {
      if ctx.is_cancellation_requested() {
        info!("Task {} observed cancellation at step {}", ctx.task_id(), step);
        return step;
      }
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
    50
  });
  let never_started = Task::new(|_ctx| 0u32);

  queue.add_tasks([&long_running, &never_started]).expect("fresh tasks are accepted");
  tokio::time::sleep(Duration::from_millis(350)).await;
  queue.cancel_all();
  queue.wait_until_all_complete().await;

  info!("Long-running task: {:?} -> {:?}", long_running.state(), long_running.take_result());
  info!("Queued task: {:?} -> {:?}", never_started.state(), never_started.take_result());
  assert_eq!(never_started.state(), TaskState::Cancelled);
  info!("--- Cancellation Example End ---");
}
