use std::error::Error as StdError;
use std::sync::Arc;

/// The error type a task function's failure is boxed into.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The task function after type erasure. Every descriptor submitted to a queue
/// is executed by the same `TaskFn`.
pub type TaskFn<A, R> = Arc<dyn Fn(A) -> Result<R, BoxError> + Send + Sync + 'static>;

/// A lazily evaluated source of call descriptors, invoked at most once.
pub type CallProducer<A, Id> =
  Box<dyn FnOnce() -> Box<dyn Iterator<Item = CallDescriptor<A, Id>> + Send> + Send + 'static>;

/// One unit of work: the arguments for a single task function invocation plus an
/// optional identifier used to correlate the result back to this descriptor.
///
/// Positional and keyword arguments are both carried by `A`. A tuple or a struct
/// works; use an `Option` field for an argument that has a default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor<A, Id = String> {
  pub args: A,
  pub task_id: Option<Id>,
}

impl<A, Id> CallDescriptor<A, Id> {
  pub fn new(args: A) -> Self {
    Self { args, task_id: None }
  }

  pub fn with_id(args: A, task_id: Id) -> Self {
    Self {
      args,
      task_id: Some(task_id),
    }
  }

  /// Attaches (or replaces) the correlation identifier.
  pub fn with_task_id(mut self, task_id: Id) -> Self {
    self.task_id = Some(task_id);
    self
  }

  pub(crate) fn into_parts(self) -> (A, Option<Id>) {
    (self.args, self.task_id)
  }
}

impl<A, Id> From<A> for CallDescriptor<A, Id> {
  fn from(args: A) -> Self {
    Self::new(args)
  }
}

/// Wraps a typed task function into a `TaskFn`.
pub(crate) fn erase_task_fn<A, R, E, F>(task: F) -> TaskFn<A, R>
where
  F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
  E: Into<BoxError>,
{
  Arc::new(move |args| task(args).map_err(Into::into))
}

/// Short name of the task function's type, used as the default queue name.
pub(crate) fn task_fn_name<F>() -> String {
  let full = std::any::type_name::<F>();
  // Closures show up as `path::to::caller::{{closure}}`, keep the caller.
  let trimmed = full.trim_end_matches("::{{closure}}");
  let short = trimmed.rsplit("::").next().unwrap_or(trimmed);
  format!("task-queue-{}", short)
}
