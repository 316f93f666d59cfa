use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

lazy_static::lazy_static! {
  static ref NEXT_SUBMISSION_SEQ: AtomicU64 = AtomicU64::new(0);
}

/// Allocates the next process-wide submission sequence number.
pub(crate) fn next_seq() -> u64 {
  NEXT_SUBMISSION_SEQ.fetch_add(1, AtomicOrdering::Relaxed)
}

/// A unit of work that has been handed to a worker but whose completion has not
/// been observed by the consumer yet.
pub(crate) struct PendingSubmission<Id> {
  pub(crate) seq: u64,
  pub(crate) task_id: Option<Id>,
  pub(crate) token: CancellationToken,
  pub(crate) submitted_at: Instant,
}

impl<Id: fmt::Debug> fmt::Debug for PendingSubmission<Id> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PendingSubmission")
      .field("seq", &self.seq)
      .field("task_id", &self.task_id)
      .field("cancelled", &self.token.is_cancelled())
      .finish_non_exhaustive()
  }
}

/// In-flight submissions keyed by sequence number. Shared between the dispatcher,
/// which registers entries, and the consumer, which retires them.
pub(crate) struct PendingMap<Id> {
  entries: Arc<DashMap<u64, PendingSubmission<Id>>>,
}

impl<Id> Clone for PendingMap<Id> {
  fn clone(&self) -> Self {
    Self {
      entries: self.entries.clone(),
    }
  }
}

impl<Id: fmt::Debug> PendingMap<Id> {
  pub(crate) fn new() -> Self {
    Self {
      entries: Arc::new(DashMap::new()),
    }
  }

  /// Records a new submission and returns its sequence number and the token the
  /// worker checks before starting the task function.
  pub(crate) fn register(&self, task_id: Option<Id>, parent: &CancellationToken) -> (u64, CancellationToken) {
    let seq = next_seq();
    let token = parent.child_token();
    trace!(%seq, ?task_id, "Registering pending submission.");
    self.entries.insert(
      seq,
      PendingSubmission {
        seq,
        task_id,
        token: token.clone(),
        submitted_at: Instant::now(),
      },
    );
    (seq, token)
  }

  /// Removes a submission once its outcome reached the consumer, returning its
  /// task identifier and time spent in flight.
  pub(crate) fn retire(&self, seq: u64) -> (Option<Id>, Option<Duration>) {
    match self.entries.remove(&seq) {
      Some((_, pending)) => (pending.task_id, Some(pending.submitted_at.elapsed())),
      None => {
        debug!(%seq, "Completion for unknown submission; it was already retired.");
        (None, None)
      }
    }
  }

  /// Requests cancellation of every submission still in flight.
  pub(crate) fn cancel_all(&self) -> usize {
    let mut cancelled = 0;
    for entry in self.entries.iter() {
      if !entry.token.is_cancelled() {
        entry.token.cancel();
        cancelled += 1;
      }
    }
    cancelled
  }

  pub(crate) fn len(&self) -> usize {
    self.entries.len()
  }
}
