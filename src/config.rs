use crate::error::QueueError;

use std::fmt;
use std::time::Duration;

/// Upper bound of the default worker count.
pub const MAX_DEFAULT_CONCURRENCY: usize = 32;

/// Worker count used when none is configured: `min(32, cpu_count + 4)`.
///
/// Leaves headroom for I/O-bound tasks without oversubscribing large machines.
pub fn default_max_concurrency() -> usize {
  MAX_DEFAULT_CONCURRENCY.min(num_cpus::get() + 4)
}

/// Defines how the worker pool is released once the consumer stops iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
  /// Waits for task functions that are already running to return.
  /// Submissions that haven't started will not be processed.
  #[default]
  Graceful,
  /// Returns immediately; running task functions finish in the background.
  /// Submissions that haven't started will not be processed.
  Detach,
}

/// What the result-collecting queue does when a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
  /// Cancel pending work and surface the first failure.
  #[default]
  FailFast,
  /// Skip failed tasks and keep yielding the remaining results.
  Ignore,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct QueueConfig {
  pub max_concurrency: Option<usize>,
  pub overall_timeout: Option<Duration>,
  pub name: Option<String>,
  pub shutdown_mode: ShutdownMode,
}

impl fmt::Debug for QueueConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConfig")
      .field("max_concurrency", &self.effective_concurrency())
      .field("overall_timeout", &self.overall_timeout)
      .field("name", &self.name)
      .field("shutdown_mode", &self.shutdown_mode)
      .finish()
  }
}

impl QueueConfig {
  pub fn builder() -> QueueConfigBuilder {
    QueueConfigBuilder::new()
  }

  pub fn validate<Id>(&self) -> Result<(), QueueError<Id>> {
    if self.max_concurrency == Some(0) {
      return Err(QueueError::config("max_concurrency must be > 0"));
    }
    if self.overall_timeout == Some(Duration::ZERO) {
      return Err(QueueError::config("overall_timeout must be > 0"));
    }
    Ok(())
  }

  /// The worker count the queue will actually use.
  pub fn effective_concurrency(&self) -> usize {
    self.max_concurrency.unwrap_or_else(default_max_concurrency)
  }

  pub(crate) fn name_or(&self, fallback: impl FnOnce() -> String) -> String {
    self.name.clone().unwrap_or_else(fallback)
  }
}

#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
  config: QueueConfig,
}

impl QueueConfigBuilder {
  pub fn new() -> Self {
    Self {
      config: QueueConfig::default(),
    }
  }

  pub fn max_concurrency(mut self, n: usize) -> Self {
    self.config.max_concurrency = Some(n);
    self
  }

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

  pub fn build<Id>(self) -> Result<QueueConfig, QueueError<Id>> {
    self.config.validate::<Id>()?;
    Ok(self.config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_concurrency_formula() {
    let expected = std::cmp::min(32, num_cpus::get() + 4);
    assert_eq!(default_max_concurrency(), expected);
    assert!(default_max_concurrency() >= 5);
    assert!(default_max_concurrency() <= MAX_DEFAULT_CONCURRENCY);
    assert_eq!(QueueConfig::default().effective_concurrency(), expected);
  }

  #[test]
  fn test_builder_sets_fields() {
    let config = QueueConfig::builder()
      .max_concurrency(3)
      .overall_timeout(Duration::from_millis(250))
      .name("builder_queue")
      .shutdown_mode(ShutdownMode::Detach)
      .build::<String>()
      .unwrap();

    assert_eq!(config.effective_concurrency(), 3);
    assert_eq!(config.overall_timeout, Some(Duration::from_millis(250)));
    assert_eq!(config.name.as_deref(), Some("builder_queue"));
    assert_eq!(config.shutdown_mode, ShutdownMode::Detach);
  }

  #[test]
  fn test_zero_concurrency_is_rejected() {
    let result = QueueConfig::builder().max_concurrency(0).build::<String>();
    assert!(matches!(result, Err(QueueError::Config(_))));
  }

  #[test]
  fn test_zero_timeout_is_rejected() {
    let result = QueueConfig::builder().overall_timeout(Duration::ZERO).build::<String>();
    assert!(matches!(result, Err(QueueError::Config(_))));
  }

  #[test]
  fn test_name_fallback() {
    let unnamed = QueueConfig::default();
    assert_eq!(unnamed.name_or(|| "fallback".to_string()), "fallback");
    let named = QueueConfig::builder().name("explicit").build::<String>().unwrap();
    assert_eq!(named.name_or(|| "fallback".to_string()), "explicit");
  }

  #[test]
  fn test_defaults() {
    assert_eq!(ShutdownMode::default(), ShutdownMode::Graceful);
    assert_eq!(ErrorPolicy::default(), ErrorPolicy::FailFast);
  }
}
