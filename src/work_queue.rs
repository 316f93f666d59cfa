use crossbeam::channel::{self, Receiver, RecvError, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

/// An item travelling through the work queue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Job<T> {
  Run(T),
  /// Tells the worker that receives it to stop. Workers put it back before
  /// exiting so that it reaches every other worker too.
  Stop,
}

/// Counts items that were put but not yet marked done, like a joinable queue.
#[derive(Debug, Default)]
struct Unfinished {
  count: Mutex<usize>,
  all_done: Condvar,
}

impl Unfinished {
  fn increment(&self) {
    *self.count.lock() += 1;
  }

  fn task_done(&self) {
    let mut count = self.count.lock();
    *count = count.saturating_sub(1);
    if *count == 0 {
      self.all_done.notify_all();
    }
  }

  fn wait_until_zero(&self) {
    let mut count = self.count.lock();
    while *count > 0 {
      self.all_done.wait(&mut count);
    }
  }
}

/// Marks the dequeued item as done when dropped, which happens after the worker
/// has finished processing it (successfully, with an error or by panicking).
#[must_use = "dropping the ticket marks the item as done"]
pub(crate) struct DoneTicket {
  unfinished: Arc<Unfinished>,
}

impl fmt::Debug for DoneTicket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DoneTicket").finish_non_exhaustive()
  }
}

impl Drop for DoneTicket {
  fn drop(&mut self) {
    self.unfinished.task_done();
  }
}

/// An unbounded, multi-producer, multi-consumer FIFO shared by the fire-and-forget
/// workers, with `join` semantics: `join` returns once every item that was put has
/// been marked done.
pub(crate) struct WorkQueue<T> {
  tx: Sender<Job<T>>,
  rx: Receiver<Job<T>>,
  unfinished: Arc<Unfinished>,
}

impl<T> Clone for WorkQueue<T> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      rx: self.rx.clone(),
      unfinished: self.unfinished.clone(),
    }
  }
}

impl<T> fmt::Debug for WorkQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkQueue")
      .field("len", &self.len())
      .field("unfinished", &self.unfinished_count())
      .finish_non_exhaustive()
  }
}

impl<T> WorkQueue<T> {
  pub(crate) fn new() -> Self {
    let (tx, rx) = channel::unbounded();
    Self {
      tx,
      rx,
      unfinished: Arc::new(Unfinished::default()),
    }
  }

  /// Enqueues a job. The send cannot fail while this queue holds a receiver.
  pub(crate) fn put(&self, job: Job<T>) {
    self.unfinished.increment();
    if self.tx.send(job).is_err() {
      // Unreachable in practice: `self.rx` keeps the channel connected.
      self.unfinished.task_done();
    }
  }

  /// Blocks until a job is available. The returned ticket must be held until the
  /// job has been processed.
  pub(crate) fn get(&self) -> Result<(Job<T>, DoneTicket), RecvError> {
    let job = self.rx.recv()?;
    Ok((
      job,
      DoneTicket {
        unfinished: self.unfinished.clone(),
      },
    ))
  }

  /// Blocks until every job put so far has been marked done.
  pub(crate) fn join(&self) {
    self.unfinished.wait_until_zero();
  }

  /// Number of jobs waiting in the channel.
  pub(crate) fn len(&self) -> usize {
    self.rx.len()
  }

  pub(crate) fn unfinished_count(&self) -> usize {
    *self.unfinished.count.lock()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::thread;
  use std::time::Duration;

  #[test]
  fn test_queue_put_get() {
    let queue = WorkQueue::<u32>::new();
    queue.put(Job::Run(1));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.unfinished_count(), 1);

    let (job, ticket) = queue.get().unwrap();
    assert_eq!(job, Job::Run(1));
    // Dequeued but not processed yet.
    assert_eq!(queue.len(), 0);
    assert_eq!(queue.unfinished_count(), 1);

    drop(ticket);
    assert_eq!(queue.unfinished_count(), 0);
  }

  #[test]
  fn test_queue_is_fifo() {
    let queue = WorkQueue::<u32>::new();
    for i in 0..5 {
      queue.put(Job::Run(i));
    }
    let order: Vec<u32> = (0..5)
      .map(|_| match queue.get().unwrap().0 {
        Job::Run(i) => i,
        Job::Stop => panic!("unexpected stop"),
      })
      .collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
  }

  #[test]
  fn test_join_waits_for_tickets() {
    let queue = WorkQueue::<u32>::new();
    let processed = Arc::new(AtomicUsize::new(0));
    queue.put(Job::Run(1));
    queue.put(Job::Run(2));

    let worker = {
      let queue = queue.clone();
      let processed = processed.clone();
      thread::spawn(move || {
        for _ in 0..2 {
          let (_job, _ticket) = queue.get().unwrap();
          thread::sleep(Duration::from_millis(30));
          processed.fetch_add(1, Ordering::SeqCst);
        }
      })
    };

    queue.join();
    assert_eq!(processed.load(Ordering::SeqCst), 2);
    worker.join().unwrap();
  }

  #[test]
  fn test_join_on_empty_queue_returns() {
    let queue = WorkQueue::<u32>::new();
    queue.join();
    assert_eq!(queue.unfinished_count(), 0);
  }

  #[test]
  fn test_stop_propagates_to_all_workers() {
    let queue = WorkQueue::<u32>::new();
    let stopped = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..4)
      .map(|_| {
        let queue = queue.clone();
        let stopped = stopped.clone();
        thread::spawn(move || loop {
          let (job, _ticket) = queue.get().unwrap();
          if job == Job::Stop {
            queue.put(Job::Stop);
            stopped.fetch_add(1, Ordering::SeqCst);
            return;
          }
        })
      })
      .collect();

    queue.put(Job::Stop);
    for worker in workers {
      worker.join().unwrap();
    }
    assert_eq!(stopped.load(Ordering::SeqCst), 4);
    // The last re-enqueued sentinel is still waiting.
    assert_eq!(queue.len(), 1);
  }
}
