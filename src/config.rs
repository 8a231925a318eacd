//! Per-database transaction defaults

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::isolation::IsolationLevel;

/// How a transaction requested inside another transaction on the same
/// database behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestingPolicy {
   /// The inner scope gets its own `Transaction` on the outer connection,
   /// guarded by a savepoint. Failing or rolling back the inner scope only
   /// undoes work done since the savepoint.
   #[default]
   Savepoint,

   /// The inner scope runs inside the outer `Transaction` itself. Its commit
   /// is a no-op and an explicit rollback undoes the whole outer transaction.
   Shared,
}

/// Transaction defaults for one registered database
///
/// # Examples
///
/// ```
/// use sqlx_txn::{DatabaseConfig, NestingPolicy};
///
/// let config = DatabaseConfig::default()
///     .with_name("main")
///     .with_max_attempts(5)
///     .with_nesting(NestingPolicy::Shared);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
   /// Name used in logs and errors. Defaults to the file path for SQLite
   /// databases and to the database id otherwise.
   pub name: Option<String>,

   /// Isolation level for transactions that do not ask for one. `None` uses
   /// the dialect's default.
   pub default_isolation: Option<IsolationLevel>,

   /// Whether transactions are read-only unless they ask otherwise.
   ///
   /// Default: false
   pub default_read_only: bool,

   /// How many times a top-level transaction body runs before a retryable
   /// conflict is surfaced.
   ///
   /// Default: 3
   pub default_max_attempts: u32,

   /// Delay before the first retry (in milliseconds). Doubles on each
   /// further attempt.
   ///
   /// Default: 0
   pub min_retry_delay_ms: u64,

   /// Upper bound for the retry delay (in milliseconds).
   ///
   /// Default: 0
   pub max_retry_delay_ms: u64,

   /// Per-statement timeout (in milliseconds). `None` disables it.
   pub default_query_timeout_ms: Option<u64>,

   /// Statements slower than this are logged as warnings (in milliseconds).
   pub warn_long_queries_ms: Option<u64>,

   /// Nested transaction behaviour. Fixed for the lifetime of the database.
   pub nesting: NestingPolicy,
}

impl Default for DatabaseConfig {
   fn default() -> Self {
      Self {
         name: None,
         default_isolation: None,
         default_read_only: false,
         default_max_attempts: 3,
         min_retry_delay_ms: 0,
         max_retry_delay_ms: 0,
         default_query_timeout_ms: None,
         warn_long_queries_ms: None,
         nesting: NestingPolicy::default(),
      }
   }
}

impl DatabaseConfig {
   pub fn with_name(mut self, name: impl Into<String>) -> Self {
      self.name = Some(name.into());
      self
   }

   pub fn with_default_isolation(mut self, level: IsolationLevel) -> Self {
      self.default_isolation = Some(level);
      self
   }

   pub fn with_default_read_only(mut self, read_only: bool) -> Self {
      self.default_read_only = read_only;
      self
   }

   pub fn with_max_attempts(mut self, attempts: u32) -> Self {
      self.default_max_attempts = attempts;
      self
   }

   pub fn with_retry_delay(mut self, min: Duration, max: Duration) -> Self {
      self.min_retry_delay_ms = min.as_millis() as u64;
      self.max_retry_delay_ms = max.as_millis() as u64;
      self
   }

   pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
      self.default_query_timeout_ms = Some(timeout.as_millis() as u64);
      self
   }

   pub fn with_warn_long_queries(mut self, threshold: Duration) -> Self {
      self.warn_long_queries_ms = Some(threshold.as_millis() as u64);
      self
   }

   pub fn with_nesting(mut self, nesting: NestingPolicy) -> Self {
      self.nesting = nesting;
      self
   }

   pub(crate) fn query_timeout(&self) -> Option<Duration> {
      self.default_query_timeout_ms.map(Duration::from_millis)
   }

   pub(crate) fn long_query_threshold(&self) -> Option<Duration> {
      self.warn_long_queries_ms.map(Duration::from_millis)
   }

   pub(crate) fn retry_delays(&self) -> (Duration, Duration) {
      (
         Duration::from_millis(self.min_retry_delay_ms),
         Duration::from_millis(self.max_retry_delay_ms.max(self.min_retry_delay_ms)),
      )
   }
}
