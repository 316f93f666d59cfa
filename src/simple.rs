use crate::config::QueueConfig;
use crate::error::{QueueError, TaskError};
use crate::notifier::{CompletionHandler, CompletionNotifier, TaskCompletionInfo};
use crate::pending::next_seq;
use crate::task::{task_fn_name, BoxError, CallDescriptor, CallProducer, TaskFn};
use crate::work_queue::{Job, WorkQueue};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, trace};

/// What `submit` reports back. It deliberately says nothing about failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitSummary {
  /// Number of call descriptors the producer yielded.
  pub submitted: usize,
}

/// A fire-and-forget variant of the bounded queue: results are discarded and task
/// failures are only logged (and passed to completion handlers, if any).
///
/// Use [`BoundedTaskQueue`](crate::BoundedTaskQueue) when failures must reach the
/// caller.
pub struct SimpleBoundedTaskQueue<A, Id = String> {
  task: TaskFn<A, ()>,
  default_name: String,
  producer: CallProducer<A, Id>,
  config: QueueConfig,
  handlers: Vec<CompletionHandler<Id>>,
}

impl<A, Id> fmt::Debug for SimpleBoundedTaskQueue<A, Id> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SimpleBoundedTaskQueue")
      .field("name", &self.config.name_or(|| self.default_name.clone()))
      .field("config", &self.config)
      .field("handler_count", &self.handlers.len())
      .finish_non_exhaustive()
  }
}

impl<A, Id> SimpleBoundedTaskQueue<A, Id>
where
  A: Send + 'static,
  Id: fmt::Debug + Send + Sync + 'static,
{
  pub fn new<F, R, E, P, I>(task: F, producer: P) -> Self
  where
    F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    E: Into<BoxError>,
    P: FnOnce() -> I + Send + 'static,
    I: IntoIterator<Item = CallDescriptor<A, Id>>,
    I::IntoIter: Send + 'static,
  {
    Self {
      task: Arc::new(move |args| task(args).map(drop).map_err(Into::into)),
      default_name: task_fn_name::<F>(),
      producer: Box::new(move || {
        Box::new(producer().into_iter()) as Box<dyn Iterator<Item = CallDescriptor<A, Id>> + Send>
      }),
      config: QueueConfig::default(),
      handlers: Vec::new(),
    }
  }

  pub fn max_concurrency(mut self, n: usize) -> Self {
    self.config.max_concurrency = Some(n);
    self
  }

  pub fn name<S: Into<String>>(mut self, name: S) -> Self {
    self.config.name = Some(name.into());
    self
  }

  /// Only `max_concurrency` and `name` apply to this queue.
  pub fn with_config(mut self, config: QueueConfig) -> Self {
    self.config = config;
    self
  }

  /// Registers a handler invoked on the worker thread after every task finishes.
  pub fn on_completion(mut self, handler: impl Fn(&TaskCompletionInfo<Id>) + Send + Sync + 'static) -> Self {
    self.handlers.push(Arc::new(handler));
    self
  }

  /// Starts `max_concurrency` worker threads, feeds them every descriptor the
  /// producer yields, and returns once all of them have been processed. Worker
  /// threads are stopped and joined before returning.
  pub fn submit(self) -> Result<SubmitSummary, QueueError<Id>> {
    self.config.validate::<Id>()?;
    let concurrency = self.config.effective_concurrency();
    let queue_name: Arc<str> = Arc::from(self.config.name_or(|| self.default_name.clone()));
    let queue = WorkQueue::new();
    let notifier = CompletionNotifier::new(queue_name.clone(), self.handlers);

    let mut workers = WorkerSet {
      queue: queue.clone(),
      handles: Vec::with_capacity(concurrency),
      queue_name: queue_name.clone(),
    };
    for index in 0..concurrency {
      let worker = Worker {
        index,
        queue: queue.clone(),
        task: self.task.clone(),
        notifier: notifier.clone(),
        queue_name: queue_name.clone(),
      };
      let handle = thread::Builder::new()
        .name(format!("{}-{}", queue_name, index))
        .spawn(move || worker.run())
        .map_err(|e| {
          error!(queue = %queue_name, index, "Failed to spawn worker thread: {}", e);
          QueueError::WorkerSpawn(e)
        })?;
      workers.handles.push(handle);
    }
    info!(queue = %queue_name, concurrency, "Started fire-and-forget workers.");

    let mut submitted = 0usize;
    for call in (self.producer)() {
      queue.put(Job::Run(call));
      submitted += 1;
    }
    debug!(queue = %queue_name, submitted, "All call descriptors enqueued. Waiting for the queue to drain.");

    queue.join();
    workers.retire();
    info!(queue = %queue_name, submitted, "Fire-and-forget queue drained.");
    Ok(SubmitSummary { submitted })
  }
}

struct Worker<A, Id> {
  index: usize,
  queue: WorkQueue<CallDescriptor<A, Id>>,
  task: TaskFn<A, ()>,
  notifier: Arc<CompletionNotifier<Id>>,
  queue_name: Arc<str>,
}

impl<A, Id: fmt::Debug> Worker<A, Id> {
  fn run(self) {
    trace!(queue = %self.queue_name, worker = self.index, "Worker started.");
    loop {
      let (job, _done) = match self.queue.get() {
        Ok(received) => received,
        Err(_) => {
          debug!(queue = %self.queue_name, worker = self.index, "Work queue disconnected. Worker exiting.");
          return;
        }
      };

      let call = match job {
        Job::Stop => {
          self.queue.put(Job::Stop);
          trace!(queue = %self.queue_name, worker = self.index, "Stop signal received and passed on.");
          return;
        }
        Job::Run(call) => call,
      };

      let (args, task_id) = call.into_parts();
      let seq = next_seq();
      let started = Instant::now();
      let outcome = match catch_unwind(AssertUnwindSafe(|| (self.task)(args))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(TaskError::Failed(source)),
        Err(panic_payload) => Err(TaskError::from_panic(panic_payload)),
      };

      if let Err(e) = &outcome {
        error!(
          queue = %self.queue_name,
          worker = self.index,
          %seq,
          ?task_id,
          "Task failed, continuing with the next one: {}",
          e
        );
      }
      self.notifier.notify(seq, task_id, &outcome, started.elapsed());
    }
  }
}

/// Owns the worker threads. Retiring (explicitly or on drop) sends one stop
/// signal, which every worker passes on, and joins them all.
struct WorkerSet<A, Id> {
  queue: WorkQueue<CallDescriptor<A, Id>>,
  handles: Vec<JoinHandle<()>>,
  queue_name: Arc<str>,
}

impl<A, Id> WorkerSet<A, Id> {
  fn retire(&mut self) {
    if self.handles.is_empty() {
      return;
    }
    self.queue.put(Job::Stop);
    for handle in self.handles.drain(..) {
      if handle.join().is_err() {
        error!(queue = %self.queue_name, "A worker thread panicked.");
      }
    }
    debug!(queue = %self.queue_name, "All workers stopped.");
  }
}

impl<A, Id> Drop for WorkerSet<A, Id> {
  fn drop(&mut self) {
    self.retire();
  }
}
