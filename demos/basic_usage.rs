use bounded_task_queue::{BoundedTaskQueue, CallDescriptor, ErrorPolicy};
use std::time::Duration;
use tracing::info;

fn fetch_page((page, delay_ms): (u32, u64)) -> Result<String, String> {
  info!("Fetching page {}, will take {}ms", page, delay_ms);
  std::thread::sleep(Duration::from_millis(delay_ms));
  Ok(format!("contents of page {}", page))
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Usage Example ---");

  // Pages 0 and 1 are known up front, the rest are discovered lazily.
  let queue = BoundedTaskQueue::new(fetch_page)
    .name("basic_queue")
    .max_concurrency(2)
    .with_calls((0..2).map(|page| CallDescriptor::with_id((page, 400), format!("page-{}", page))))
    .with_call_producer(|| {
      info!("Producer invoked, discovering more pages.");
      (2..6).map(|page| CallDescriptor::with_id((page, 150 + page as u64 * 50), format!("page-{}", page)))
    });

  let results = match queue.yield_results(ErrorPolicy::FailFast) {
    Ok(results) => results,
    Err(e) => {
      tracing::error!("Failed to start queue: {}", e);
      return;
    }
  };

  for item in results {
    match item {
      Ok((contents, task_id)) => info!("{:?} -> {}", task_id, contents),
      Err(e) => tracing::error!("Queue stopped: {}", e),
    }
  }

  info!("--- Basic Usage Example Finished ---");
}
