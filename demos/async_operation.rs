use futures_operations::{CompletionSignal, QueueBuilder, Task, TaskQueue};
use std::time::Duration;
use tracing::{info, warn};

// Stand-in for a network image load that reports back through a callback.
fn simulate_async_load(name: &'static str, on_loaded: impl FnOnce(String) + Send + 'static) {
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(300)).await;
    on_loaded(format!("{}.jpg ({} bytes)", name, name.len() * 1024));
  });
}

fn image_load_task(name: &'static str) -> Task<String> {
  Task::new_async(move |signal: CompletionSignal<String>| {
    simulate_async_load(name, move |image| {
      if let Err(e) = signal.complete(image) {
        warn!("Load of {} reported twice: {}", name, e);
      }
    });
  })
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Async Operation Example ---");
  let queue: TaskQueue<String> = QueueBuilder::new()
    .name("image_loads")
    .serial()
    .build()
    .expect("running inside a Tokio runtime");

  let image_load = image_load_task("train_dusk");
  queue.add_task(&image_load).expect("fresh task is accepted");

  if let Err(e) = queue.wait_until_all_complete_timeout(Duration::from_secs(5)).await {
    warn!("Queue did not drain: {}", e);
    return;
  }

  match image_load.take_result() {
    Ok(image) => info!("Loaded {}", image),
    Err(e) => warn!("Image load failed: {}", e),
  }
  info!("--- Async Operation Example End ---");
}
