use crate::config::{ErrorPolicy, QueueConfig, ShutdownMode};
use crate::error::{panic_message, QueueError, TaskError};
use crate::notifier::{CompletionHandler, CompletionNotifier, TaskCompletionInfo};
use crate::pending::PendingMap;
use crate::task::{erase_task_fn, task_fn_name, BoxError, CallDescriptor, CallProducer, TaskFn};

use std::fmt;
use std::iter::FusedIterator;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Builder as RuntimeBuilder, Runtime};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

const CORE_THREADS: usize = 2;

/// Runs one task function over many call descriptors on a bounded pool of worker
/// threads and yields `(result, task_id)` pairs in completion order.
///
/// ```no_run
/// use bounded_task_queue::{BoundedTaskQueue, CallDescriptor, ErrorPolicy};
///
/// fn add((a, b, c): (i64, i64, Option<i64>)) -> Result<i64, String> {
///   Ok(a + b + c.unwrap_or(0))
/// }
///
/// let queue = BoundedTaskQueue::new(add)
///   .with_calls(vec![
///     CallDescriptor::with_id((2, 3, None), "plain".to_string()),
///     CallDescriptor::with_id((2, 3, Some(1)), "with_c".to_string()),
///   ])
///   .max_concurrency(4);
///
/// for item in queue.yield_results(ErrorPolicy::FailFast).unwrap() {
///   let (sum, task_id) = item.unwrap();
///   println!("{:?} -> {}", task_id, sum);
/// }
/// ```
pub struct BoundedTaskQueue<A, R, Id = String> {
  task: TaskFn<A, R>,
  default_name: String,
  initial_calls: Vec<CallDescriptor<A, Id>>,
  producer: Option<CallProducer<A, Id>>,
  config: QueueConfig,
  handlers: Vec<CompletionHandler<Id>>,
}

impl<A, R, Id> fmt::Debug for BoundedTaskQueue<A, R, Id> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BoundedTaskQueue")
      .field("name", &self.config.name_or(|| self.default_name.clone()))
      .field("initial_calls", &self.initial_calls.len())
      .field("has_producer", &self.producer.is_some())
      .field("config", &self.config)
      .field("handler_count", &self.handlers.len())
      .finish()
  }
}

impl<A, R, Id> BoundedTaskQueue<A, R, Id>
where
  A: Send + 'static,
  R: Send + 'static,
  Id: Clone + fmt::Debug + Send + Sync + 'static,
{
  pub fn new<F, E>(task: F) -> Self
  where
    F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    E: Into<BoxError>,
  {
    Self {
      task: erase_task_fn(task),
      default_name: task_fn_name::<F>(),
      initial_calls: Vec::new(),
      producer: None,
      config: QueueConfig::default(),
      handlers: Vec::new(),
    }
  }

  /// Adds eagerly available descriptors. They are dispatched before anything the
  /// producer yields.
  pub fn with_calls<I>(mut self, calls: I) -> Self
  where
    I: IntoIterator<Item = CallDescriptor<A, Id>>,
  {
    self.initial_calls.extend(calls);
    self
  }

  /// Sets the lazy producer, called once after the initial descriptors are used up.
  pub fn with_call_producer<P, I>(mut self, producer: P) -> Self
  where
    P: FnOnce() -> I + Send + 'static,
    I: IntoIterator<Item = CallDescriptor<A, Id>>,
    I::IntoIter: Send + 'static,
  {
    self.producer = Some(Box::new(move || {
      Box::new(producer().into_iter()) as Box<dyn Iterator<Item = CallDescriptor<A, Id>> + Send>
    }));
    self
  }

  pub fn max_concurrency(mut self, n: usize) -> Self {
    self.config.max_concurrency = Some(n);
    self
  }

  /// Bounds how long the consumer waits for *all* submitted work. See
  /// [`QueueError::Timeout`] for what it does not do.
  pub fn overall_timeout(mut self, timeout: Duration) -> Self {
    self.config.overall_timeout = Some(timeout);
    self
  }

  pub fn name<S: Into<String>>(mut self, name: S) -> Self {
    self.config.name = Some(name.into());
    self
  }

  pub fn shutdown_mode(mut self, mode: ShutdownMode) -> Self {
    self.config.shutdown_mode = mode;
    self
  }

  pub fn with_config(mut self, config: QueueConfig) -> Self {
    self.config = config;
    self
  }

  /// Registers a handler invoked on the worker thread after every task finishes.
  pub fn on_completion(mut self, handler: impl Fn(&TaskCompletionInfo<Id>) + Send + Sync + 'static) -> Self {
    self.handlers.push(Arc::new(handler));
    self
  }

  pub fn config(&self) -> &QueueConfig {
    &self.config
  }

  /// Starts the worker pool and returns the lazy sequence of results.
  ///
  /// The pool lives as long as the returned [`Results`]. Must not be called from
  /// within an async runtime, as iterating blocks the calling thread.
  pub fn yield_results(self, policy: ErrorPolicy) -> Result<Results<R, Id>, QueueError<Id>> {
    self.config.validate::<Id>()?;
    let concurrency = self.config.effective_concurrency();
    let queue_name: Arc<str> = Arc::from(self.config.name_or(|| self.default_name.clone()));

    let thread_prefix = queue_name.clone();
    let thread_counter = Arc::new(AtomicUsize::new(0));
    // Two core threads: the dispatcher may block one while pulling from the
    // producer, the other keeps the timer driver turning. Both are spawned while
    // the runtime is built, so they take the first two names.
    let runtime = RuntimeBuilder::new_multi_thread()
      .worker_threads(CORE_THREADS)
      .max_blocking_threads(concurrency)
      .thread_name_fn(move || {
        let n = thread_counter.fetch_add(1, AtomicOrdering::Relaxed);
        match n.checked_sub(CORE_THREADS) {
          Some(worker) => format!("{}-{}", thread_prefix, worker),
          None => format!("{}-rt-{}", thread_prefix, n),
        }
      })
      .enable_time()
      .build()
      .map_err(QueueError::RuntimeBuild)?;

    let cancel = CancellationToken::new();
    let pending = PendingMap::new();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let notifier = CompletionNotifier::new(queue_name.clone(), self.handlers);

    info!(
      queue = %queue_name,
      concurrency,
      initial_calls = self.initial_calls.len(),
      has_producer = self.producer.is_some(),
      policy = ?policy,
      "Starting bounded task queue."
    );

    let dispatcher = Dispatcher {
      queue_name: queue_name.clone(),
      task: self.task,
      calls: CallFeed {
        initial: self.initial_calls.into_iter(),
        producer: self.producer,
        lazy: None,
      },
      semaphore: Arc::new(Semaphore::new(concurrency)),
      pending: pending.clone(),
      cancel: cancel.clone(),
      outcome_tx,
      notifier,
    };
    runtime.spawn(
      dispatcher
        .run()
        .instrument(info_span!("task_queue_dispatcher", name = %queue_name)),
    );

    Ok(Results {
      engine: Some(Engine { runtime, outcome_rx }),
      pending,
      cancel,
      deadline: self.config.overall_timeout.map(|timeout| Instant::now() + timeout),
      overall_timeout: self.config.overall_timeout,
      policy,
      shutdown_mode: self.config.shutdown_mode,
      queue_name,
      yielded: 0,
    })
  }
}

/// Initial descriptors followed by whatever the producer yields.
struct CallFeed<A, Id> {
  initial: std::vec::IntoIter<CallDescriptor<A, Id>>,
  producer: Option<CallProducer<A, Id>>,
  lazy: Option<Box<dyn Iterator<Item = CallDescriptor<A, Id>> + Send>>,
}

impl<A, Id> Iterator for CallFeed<A, Id> {
  type Item = CallDescriptor<A, Id>;

  fn next(&mut self) -> Option<Self::Item> {
    if let Some(call) = self.initial.next() {
      return Some(call);
    }
    if let Some(producer) = self.producer.take() {
      self.lazy = Some(producer());
    }
    self.lazy.as_mut()?.next()
  }
}

enum Completion<R> {
  Task { seq: u64, outcome: Result<R, TaskError> },
  /// Sent once by the dispatcher when pulling the next descriptor panicked.
  ProducerPanicked(String),
}

struct Dispatcher<A, R, Id> {
  queue_name: Arc<str>,
  task: TaskFn<A, R>,
  calls: CallFeed<A, Id>,
  semaphore: Arc<Semaphore>,
  pending: PendingMap<Id>,
  cancel: CancellationToken,
  outcome_tx: mpsc::UnboundedSender<Completion<R>>,
  notifier: Arc<CompletionNotifier<Id>>,
}

impl<A, R, Id> Dispatcher<A, R, Id>
where
  A: Send + 'static,
  R: Send + 'static,
  Id: Clone + fmt::Debug + Send + Sync + 'static,
{
  /// Pulls one descriptor per acquired permit and hands both to a worker thread.
  /// The permit is released when the task function returns, so at most
  /// `concurrency` task functions run at once.
  async fn run(mut self) {
    info!(name = %self.queue_name, "Dispatcher started.");
    let mut dispatched: u64 = 0;

    loop {
      let permit = tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!(name = %self.queue_name, "Cancellation requested. Dispatcher stops pulling call descriptors.");
          break;
        }

        acquired = self.semaphore.clone().acquire_owned() => match acquired {
          Ok(permit) => permit,
          Err(_) => {
            error!(name = %self.queue_name, "Semaphore closed. Dispatcher exiting.");
            break;
          }
        }
      };
      trace!(name = %self.queue_name, "Acquired permit. Available: {}", self.semaphore.available_permits());

      if self.cancel.is_cancelled() {
        break;
      }
      let call = match catch_unwind(AssertUnwindSafe(|| self.calls.next())) {
        Ok(Some(call)) => call,
        Ok(None) => {
          debug!(name = %self.queue_name, "Call descriptors exhausted.");
          break;
        }
        Err(panic_payload) => {
          let message = panic_message(panic_payload);
          error!(name = %self.queue_name, "Call producer panicked: {}", message);
          if self.outcome_tx.send(Completion::ProducerPanicked(message)).is_err() {
            warn!(name = %self.queue_name, "Result receiver was dropped. Producer failure was lost.");
          }
          break;
        }
      };

      let (args, task_id) = call.into_parts();
      let notify_task_id = if self.notifier.has_handlers() { task_id.clone() } else { None };
      let (seq, token) = self.pending.register(task_id, &self.cancel);
      dispatched += 1;

      let task = self.task.clone();
      let outcome_tx = self.outcome_tx.clone();
      let notifier = self.notifier.clone();
      let span = info_span!("queued_task", queue = %self.queue_name, %seq);
      debug!(name = %self.queue_name, %seq, "Handing call to a worker thread.");

      tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let _entered = span.enter();
        let started = Instant::now();

        let outcome = if token.is_cancelled() {
          debug!(%seq, "Submission cancelled before it started.");
          Err(TaskError::Cancelled)
        } else {
          match catch_unwind(AssertUnwindSafe(|| task(args))) {
            Ok(Ok(value)) => {
              trace!(%seq, "Task executed successfully.");
              Ok(value)
            }
            Ok(Err(source)) => {
              debug!(%seq, error = %source, "Task returned an error.");
              Err(TaskError::Failed(source))
            }
            Err(panic_payload) => {
              error!(%seq, "Task panicked during execution.");
              Err(TaskError::from_panic(panic_payload))
            }
          }
        };

        notifier.notify(seq, notify_task_id, &outcome, started.elapsed());
        if outcome_tx.send(Completion::Task { seq, outcome }).is_err() {
          warn!(%seq, "Result receiver was dropped. Task outcome was lost.");
        }
      });
    }

    info!(name = %self.queue_name, dispatched, "Dispatcher stopped.");
  }
}

struct Engine<R> {
  runtime: Runtime,
  outcome_rx: mpsc::UnboundedReceiver<Completion<R>>,
}

impl<R> Engine<R> {
  /// Shuts the runtime down without waiting for running task functions.
  fn abandon(self) {
    self.runtime.shutdown_background();
  }
}

impl<R: Send + 'static> Engine<R> {
  /// Keeps the runtime alive on a detached thread until every dispatched
  /// submission has completed, discarding their outcomes.
  fn drain_in_background(self, queue_name: &str) {
    // Shared so the engine can be taken back if the thread never starts.
    let slot = Arc::new(Mutex::new(Some(self)));
    let handed_off = slot.clone();
    let spawned = thread::Builder::new()
      .name(format!("{}-drain", queue_name))
      .spawn(move || {
        let Some(Engine { runtime, mut outcome_rx }) = handed_off.lock().take() else {
          return;
        };
        let drained = runtime.block_on(async move {
          let mut drained = 0usize;
          while outcome_rx.recv().await.is_some() {
            drained += 1;
          }
          drained
        });
        debug!(drained, "Background drain finished; releasing worker pool.");
      });
    if let Err(e) = spawned {
      error!(
        queue = %queue_name,
        "Failed to spawn drain thread: {}. Running tasks finish detached; work not yet started is dropped.",
        e
      );
      let engine = slot.lock().take();
      if let Some(engine) = engine {
        engine.abandon();
      }
    }
  }
}

/// Lazy, forward-only sequence of `(result, task_id)` pairs in completion order.
///
/// Yields at most one `Err`, after which iteration is over: the first task
/// failure under [`ErrorPolicy::FailFast`], [`QueueError::Producer`] if the lazy
/// producer panicked (under either policy), or [`QueueError::Timeout`].
/// Dropping it releases the worker pool according to the configured
/// [`ShutdownMode`], except after a timeout: then the already submitted work is
/// left to finish on a background thread.
pub struct Results<R, Id> {
  engine: Option<Engine<R>>,
  pending: PendingMap<Id>,
  cancel: CancellationToken,
  deadline: Option<Instant>,
  overall_timeout: Option<Duration>,
  policy: ErrorPolicy,
  shutdown_mode: ShutdownMode,
  queue_name: Arc<str>,
  yielded: usize,
}

impl<R, Id: fmt::Debug> fmt::Debug for Results<R, Id> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Results")
      .field("queue_name", &self.queue_name)
      .field("running", &self.engine.is_some())
      .field("pending", &self.pending.len())
      .field("yielded", &self.yielded)
      .field("policy", &self.policy)
      .finish_non_exhaustive()
  }
}

impl<R, Id> Results<R, Id>
where
  R: Send + 'static,
  Id: fmt::Debug,
{
  pub fn name(&self) -> &str {
    &self.queue_name
  }

  /// Submissions handed to a worker whose outcome has not been yielded yet.
  pub fn pending_count(&self) -> usize {
    self.pending.len()
  }

  pub fn yielded_count(&self) -> usize {
    self.yielded
  }

  fn on_timeout(&mut self) -> QueueError<Id> {
    let timeout = self.overall_timeout.unwrap_or_default();
    warn!(
      queue = %self.queue_name,
      pending = self.pending.len(),
      "Overall timeout of {:?} elapsed. Submitted work is not cancelled and keeps running in the background.",
      timeout
    );
    if let Some(engine) = self.engine.take() {
      engine.drain_in_background(&self.queue_name);
    }
    QueueError::Timeout(timeout)
  }
}

impl<R, Id> Results<R, Id> {
  /// Stops dispatching and gives the worker pool back according to the
  /// configured shutdown mode. Idempotent.
  fn release(&mut self) {
    let Some(engine) = self.engine.take() else {
      return;
    };
    self.cancel.cancel();
    match self.shutdown_mode {
      ShutdownMode::Graceful => {
        debug!(queue = %self.queue_name, "Releasing worker pool; waiting for running tasks to return.");
        drop(engine);
      }
      ShutdownMode::Detach => {
        debug!(queue = %self.queue_name, "Releasing worker pool; running tasks finish in the background.");
        engine.abandon();
      }
    }
    info!(queue = %self.queue_name, yielded = self.yielded, "Bounded task queue released.");
  }
}

impl<R, Id> Iterator for Results<R, Id>
where
  R: Send + 'static,
  Id: fmt::Debug,
{
  type Item = Result<(R, Option<Id>), QueueError<Id>>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let engine = self.engine.as_mut()?;
      let received = match self.deadline {
        Some(deadline) => {
          let outcome_rx = &mut engine.outcome_rx;
          let waited = engine.runtime.block_on(async move {
            tokio::time::timeout_at(deadline.into(), outcome_rx.recv()).await
          });
          match waited {
            Ok(received) => received,
            Err(_elapsed) => return Some(Err(self.on_timeout())),
          }
        }
        None => engine.runtime.block_on(engine.outcome_rx.recv()),
      };

      let (seq, outcome) = match received {
        Some(Completion::Task { seq, outcome }) => (seq, outcome),
        Some(Completion::ProducerPanicked(message)) => {
          let cancelled = self.pending.cancel_all();
          warn!(
            queue = %self.queue_name,
            cancelled,
            "Call producer failed. Cancelling pending submissions."
          );
          self.release();
          return Some(Err(QueueError::Producer(message)));
        }
        None => {
          debug!(queue = %self.queue_name, "All submissions completed.");
          self.release();
          return None;
        }
      };

      let (task_id, in_flight) = self.pending.retire(seq);
      match outcome {
        Ok(value) => {
          self.yielded += 1;
          trace!(queue = %self.queue_name, %seq, ?in_flight, "Yielding result.");
          return Some(Ok((value, task_id)));
        }
        Err(source) if self.policy == ErrorPolicy::Ignore => {
          debug!(queue = %self.queue_name, %seq, ?task_id, error = %source, "Ignoring failed task.");
        }
        Err(source) => {
          let cancelled = self.pending.cancel_all();
          self.cancel.cancel();
          warn!(
            queue = %self.queue_name,
            %seq,
            ?task_id,
            cancelled,
            error = %source,
            "Task failed. Cancelling pending submissions."
          );
          self.release();
          return Some(Err(QueueError::TaskFailed { task_id, source }));
        }
      }
    }
  }
}

impl<R, Id> FusedIterator for Results<R, Id>
where
  R: Send + 'static,
  Id: fmt::Debug,
{
}

impl<R, Id> Drop for Results<R, Id> {
  fn drop(&mut self) {
    if self.engine.is_none() {
      trace!(queue = %self.queue_name, "Results dropped after the pool was released.");
      return;
    }
    info!(
      queue = %self.queue_name,
      "Results dropped before completion. Releasing worker pool (mode: {:?}).",
      self.shutdown_mode
    );
    self.release();
  }
}
