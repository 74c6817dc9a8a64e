use futures_operations::{ConcurrencyLimit, Task, TaskQueue};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::info;

// Stand-in for a slow, CPU-bound image filter.
fn slow_filter(name: &str) -> String {
  std::thread::sleep(Duration::from_millis(500));
  format!("{}_filtered", name)
}

async fn run_batch(queue: &TaskQueue<String>, names: &[&'static str]) -> Vec<Task<String>> {
  let tasks: Vec<Task<String>> = names.iter().map(|&name| Task::new(move |_ctx| slow_filter(name))).collect();
  queue.add_tasks(&tasks).expect("fresh tasks are accepted");
  queue.wait_until_all_complete().await;
  tasks
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  let names = ["dark_road_small", "train_day", "train_dusk", "train_night"];

  info!("--- Serial queue (limit 1) ---");
  let serial = TaskQueue::new(ConcurrencyLimit::SERIAL, Handle::current(), "serial_queue");
  let started = Instant::now();
  run_batch(&serial, &names).await;
  info!("Serial batch took {:?} (expected ~2s).", started.elapsed());

  info!("--- Concurrent queue (limit 4) ---");
  let concurrent = TaskQueue::new(
    ConcurrencyLimit::new(names.len()).expect("non-zero limit"),
    Handle::current(),
    "concurrent_queue",
  );
  let started = Instant::now();
  let tasks = run_batch(&concurrent, &names).await;
  info!("Concurrent batch took {:?} (expected ~0.5s).", started.elapsed());

  for task in tasks {
    match task.take_result() {
      Ok(output) => info!("Task {} produced {}", task.id(), output),
      Err(e) => info!("Task {} failed: {}", task.id(), e),
    }
  }
}
