use crate::error::TaskError;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, trace};

// --- Public Event Structs for Handlers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Success,
  Failed,
  Panicked,
  Cancelled,
}

impl<R> From<&Result<R, TaskError>> for TaskCompletionStatus {
  fn from(result: &Result<R, TaskError>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Success,
      Err(TaskError::Failed(_)) => TaskCompletionStatus::Failed,
      Err(TaskError::Panicked(_)) => TaskCompletionStatus::Panicked,
      Err(TaskError::Cancelled) => TaskCompletionStatus::Cancelled,
    }
  }
}

/// Delivered to completion handlers once per finished submission, on the worker
/// thread that ran it.
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo<Id> {
  pub seq: u64,
  pub task_id: Option<Id>,
  pub queue_name: Arc<str>,
  pub status: TaskCompletionStatus,
  /// Rendered task error for anything but `Success`.
  pub error: Option<String>,
  pub elapsed: Duration,
  pub completion_time: SystemTime,
}

pub(crate) type CompletionHandler<Id> = Arc<dyn Fn(&TaskCompletionInfo<Id>) + Send + Sync + 'static>;

// --- CompletionNotifier Struct ---

pub(crate) struct CompletionNotifier<Id> {
  queue_name: Arc<str>,
  handlers: Vec<CompletionHandler<Id>>,
}

impl<Id> fmt::Debug for CompletionNotifier<Id> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionNotifier")
      .field("queue_name", &self.queue_name)
      .field("handler_count", &self.handlers.len())
      .finish()
  }
}

impl<Id> CompletionNotifier<Id> {
  pub(crate) fn new(queue_name: Arc<str>, handlers: Vec<CompletionHandler<Id>>) -> Arc<Self> {
    Arc::new(Self {
      queue_name,
      handlers,
    })
  }

  pub(crate) fn has_handlers(&self) -> bool {
    !self.handlers.is_empty()
  }

  /// Builds the event and dispatches it to every handler. A panicking handler is
  /// logged and does not affect the others or the worker.
  pub(crate) fn notify<R>(
    &self,
    seq: u64,
    task_id: Option<Id>,
    outcome: &Result<R, TaskError>,
    elapsed: Duration,
  ) {
    if self.handlers.is_empty() {
      trace!(queue = %self.queue_name, %seq, "No completion handlers registered, dropping notification.");
      return;
    }

    let info = TaskCompletionInfo {
      seq,
      task_id,
      queue_name: self.queue_name.clone(),
      status: TaskCompletionStatus::from(outcome),
      error: outcome.as_ref().err().map(|e| e.to_string()),
      elapsed,
      completion_time: SystemTime::now(),
    };

    debug!(
      queue = %self.queue_name,
      %seq,
      status = ?info.status,
      "Dispatching notification to {} handlers.",
      self.handlers.len()
    );

    for handler in self.handlers.iter() {
      let result = catch_unwind(AssertUnwindSafe(|| handler(&info)));
      if result.is_err() {
        error!(
          "A completion handler panicked during execution. Queue: {}, Seq: {}",
          self.queue_name, seq
        );
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;

  #[test]
  fn test_status_from_outcome() {
    let ok: Result<u8, TaskError> = Ok(1);
    assert_eq!(TaskCompletionStatus::from(&ok), TaskCompletionStatus::Success);
    let failed: Result<u8, TaskError> = Err(TaskError::Failed("boom".into()));
    assert_eq!(TaskCompletionStatus::from(&failed), TaskCompletionStatus::Failed);
    let panicked: Result<u8, TaskError> = Err(TaskError::Panicked("oops".into()));
    assert_eq!(TaskCompletionStatus::from(&panicked), TaskCompletionStatus::Panicked);
    let cancelled: Result<u8, TaskError> = Err(TaskError::Cancelled);
    assert_eq!(TaskCompletionStatus::from(&cancelled), TaskCompletionStatus::Cancelled);
  }

  #[test]
  fn test_panicking_handler_does_not_block_others() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let handlers: Vec<CompletionHandler<String>> = vec![
      Arc::new(|_info: &TaskCompletionInfo<String>| panic!("handler exploded")),
      Arc::new(move |info: &TaskCompletionInfo<String>| seen_clone.lock().push(info.seq)),
    ];
    let notifier = CompletionNotifier::new(Arc::from("notifier_unit"), handlers);
    let outcome: Result<(), TaskError> = Err(TaskError::Failed("bad input".into()));
    notifier.notify(42, Some("t".to_string()), &outcome, Duration::from_millis(1));

    assert_eq!(*seen.lock(), vec![42]);
  }

  #[test]
  fn test_error_text_is_rendered() {
    let captured = Arc::new(Mutex::new(None));
    let captured_clone = captured.clone();
    let handlers: Vec<CompletionHandler<u32>> = vec![Arc::new(move |info: &TaskCompletionInfo<u32>| {
      *captured_clone.lock() = Some((info.status, info.error.clone(), info.task_id));
    })];
    let notifier = CompletionNotifier::new(Arc::from("notifier_unit_err"), handlers);
    assert!(notifier.has_handlers());
    let outcome: Result<(), TaskError> = Err(TaskError::Panicked("kaboom".into()));
    notifier.notify(1, Some(9), &outcome, Duration::ZERO);

    let (status, error, task_id) = captured.lock().clone().unwrap();
    assert_eq!(status, TaskCompletionStatus::Panicked);
    assert_eq!(error.as_deref(), Some("Task function panicked: kaboom"));
    assert_eq!(task_id, Some(9));
  }
}
