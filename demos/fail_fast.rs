use bounded_task_queue::{BoundedTaskQueue, CallDescriptor, ErrorPolicy, QueueError, TaskCompletionInfo};
use std::time::Duration;
use tracing::{error, info, warn};

fn resize_image((name, delay_ms, corrupt): (&'static str, u64, bool)) -> Result<usize, String> {
  std::thread::sleep(Duration::from_millis(delay_ms));
  if corrupt {
    return Err(format!("{} is not a valid image", name));
  }
  Ok(name.len() * 1024)
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Fail Fast Example ---");

  let images = vec![
    ("cat.png", 300, false),
    ("broken.png", 100, true),
    ("dog.png", 200, false),
    ("bird.png", 500, false),
    ("fish.png", 500, false),
  ];

  let queue = BoundedTaskQueue::new(resize_image)
    .name("fail_fast_queue")
    .max_concurrency(2)
    .overall_timeout(Duration::from_secs(5))
    .on_completion(|info: &TaskCompletionInfo<String>| {
      info!(
        "Completion: task_id={:?}, status={:?}, elapsed={:?}",
        info.task_id, info.status, info.elapsed
      );
    })
    .with_calls(images.into_iter().map(|(name, delay, corrupt)| {
      CallDescriptor::with_id((name, delay, corrupt), name.to_string())
    }));

  let results = match queue.yield_results(ErrorPolicy::FailFast) {
    Ok(results) => results,
    Err(e) => {
      error!("Failed to start queue: {}", e);
      return;
    }
  };

  for item in results {
    match item {
      Ok((bytes, task_id)) => info!("Resized {:?} to {} bytes", task_id, bytes),
      Err(QueueError::TaskFailed { task_id, source }) => {
        warn!("Giving up: {:?} failed with '{}'. Remaining images were not processed.", task_id, source);
      }
      Err(e) => error!("Queue stopped: {}", e),
    }
  }

  info!("--- Fail Fast Example Finished ---");
}
