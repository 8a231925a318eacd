//! Configuration for SQLite database connection pools

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for SqliteDatabase connection pools
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_mgr::SqliteDatabaseConfig;
///
/// // Use defaults
/// let config = SqliteDatabaseConfig::default();
///
/// // Override just one field
/// let config = SqliteDatabaseConfig {
///     max_read_connections: 3,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteDatabaseConfig {
   /// Maximum number of concurrent read connections
   ///
   /// This controls the size of the read-only connection pool. Every read-only
   /// transaction holds one of these for its whole lifetime.
   ///
   /// Default: 6
   pub max_read_connections: u32,

   /// Idle timeout for both read and write connections (in seconds)
   ///
   /// Default: 30
   pub idle_timeout_secs: u64,

   /// How long `acquire_reader()` / `acquire_writer()` wait for a free
   /// connection before giving up (in seconds)
   ///
   /// The writer is held for the whole duration of a read-write transaction, so
   /// this is effectively the longest a transaction waits for the one before it.
   ///
   /// Default: 30
   pub acquire_timeout_secs: u64,

   /// SQLite busy handler timeout (in milliseconds)
   ///
   /// Default: 5000
   pub busy_timeout_ms: u64,
}

impl SqliteDatabaseConfig {
   pub(crate) fn idle_timeout(&self) -> Duration {
      Duration::from_secs(self.idle_timeout_secs)
   }

   pub(crate) fn acquire_timeout(&self) -> Duration {
      Duration::from_secs(self.acquire_timeout_secs)
   }

   pub(crate) fn busy_timeout(&self) -> Duration {
      Duration::from_millis(self.busy_timeout_ms)
   }
}

impl Default for SqliteDatabaseConfig {
   fn default() -> Self {
      Self {
         max_read_connections: 6,
         idle_timeout_secs: 30,
         acquire_timeout_secs: 30,
         busy_timeout_ms: 5000,
      }
   }
}
