use crate::task::BoxError;

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// Why a single submitted task did not produce a value.
#[derive(Error, Debug)]
pub enum TaskError {
  #[error("Task function returned an error: {0}")]
  Failed(#[source] BoxError),

  #[error("Task function panicked: {0}")]
  Panicked(String),

  #[error("Task was cancelled before it started")]
  Cancelled,
}

impl TaskError {
  pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    TaskError::Panicked(panic_message(payload))
  }
}

/// Renders a caught panic payload as text.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

/// Errors surfaced to callers of the task queues.
#[derive(Error, Debug)]
pub enum QueueError<Id> {
  /// The first task to fail (in completion order) when failures are not ignored.
  #[error("Task failed: id={task_id:?}")]
  TaskFailed {
    task_id: Option<Id>,
    #[source]
    source: TaskError,
  },

  /// The overall timeout elapsed before every submitted task completed. Work that
  /// was already running or queued is not cancelled by this.
  #[error("Timed out after {0:?} waiting for submitted tasks to complete")]
  Timeout(Duration),

  /// The lazy call producer panicked. Descriptors it would have yielded were
  /// never dispatched, and pending submissions are cancelled.
  #[error("Call producer panicked: {0}")]
  Producer(String),

  #[error("Failed to start the worker runtime: {0}")]
  RuntimeBuild(#[source] std::io::Error),

  #[error("Failed to spawn worker thread: {0}")]
  WorkerSpawn(#[source] std::io::Error),

  #[error("Invalid queue configuration: {0}")]
  Config(String),
}

impl<Id> QueueError<Id> {
  /// The identifier of the failing task, for `TaskFailed`.
  pub fn task_id(&self) -> Option<&Id> {
    match self {
      QueueError::TaskFailed { task_id, .. } => task_id.as_ref(),
      _ => None,
    }
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, QueueError::Timeout(_))
  }

  pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
    QueueError::Config(msg.into())
  }
}
