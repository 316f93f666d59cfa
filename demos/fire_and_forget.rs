use bounded_task_queue::{CallDescriptor, SimpleBoundedTaskQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Fire And Forget Example ---");

  let delivered = Arc::new(AtomicUsize::new(0));
  let delivered_clone = delivered.clone();

  // Every fourth notification fails; the failures are only logged.
  let queue = SimpleBoundedTaskQueue::new(
    move |(user, attempt): (u32, u32)| -> Result<(), String> {
      std::thread::sleep(Duration::from_millis(50));
      if user % 4 == 3 {
        return Err(format!("mailbox of user {} is full (attempt {})", user, attempt));
      }
      delivered_clone.fetch_add(1, Ordering::SeqCst);
      Ok(())
    },
    || (0..12).map(|user| CallDescriptor::with_id((user, 1), format!("notify-user-{}", user))),
  )
  .name("notification_queue")
  .max_concurrency(3);

  match queue.submit() {
    Ok(summary) => info!(
      "Submitted {} notifications, {} delivered.",
      summary.submitted,
      delivered.load(Ordering::SeqCst)
    ),
    Err(e) => tracing::error!("Queue could not start: {}", e),
  }

  info!("--- Fire And Forget Example Finished ---");
}
