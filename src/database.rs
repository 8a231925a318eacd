//! Registered databases and how to open them

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sqlx_sqlite_conn_mgr::{SqliteDatabase, SqliteDatabaseConfig};
use tokio::runtime::{Handle, Runtime};
use tracing::debug;

use crate::config::{DatabaseConfig, NestingPolicy};
use crate::connection::ConnectionSource;
use crate::dialect::Dialect;
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::manager::TransactionManager;
use crate::run::TransactionBuilder;
use crate::sqlite::{SqliteDialect, SqliteSource};
use crate::{Error, Result};

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a registered database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseId(u64);

impl DatabaseId {
   fn next() -> Self {
      Self(NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed))
   }
}

impl fmt::Display for DatabaseId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "db-{}", self.0)
   }
}

// Runtime owned by a database opened for blocking use. Shut down in the
// background so dropping the last handle from async code does not panic.
struct BlockingRuntime(Option<Runtime>);

impl BlockingRuntime {
   fn new(name: &str) -> Result<Self> {
      let runtime = tokio::runtime::Builder::new_multi_thread()
         .enable_all()
         .thread_name(format!("sqlx-txn-{name}"))
         .build()?;
      Ok(Self(Some(runtime)))
   }

   fn handle(&self) -> Option<&Handle> {
      self.0.as_ref().map(Runtime::handle)
   }
}

impl Drop for BlockingRuntime {
   fn drop(&mut self) {
      if let Some(runtime) = self.0.take() {
         runtime.shutdown_background();
      }
   }
}

struct DatabaseInner {
   id: DatabaseId,
   name: String,
   source: Arc<dyn ConnectionSource>,
   dialect: Arc<dyn Dialect>,
   config: DatabaseConfig,
   interceptors: InterceptorChain,
   runtime: Option<BlockingRuntime>,
}

/// A database registered with the transaction engine.
///
/// Cheap to clone. Every clone refers to the same registration, the same
/// [`TransactionManager`] and the same connection source.
///
/// # Example
///
/// ```no_run
/// use sqlx_txn::{Database, DatabaseConfig};
///
/// # async fn example() -> sqlx_txn::Result<()> {
/// let db = Database::connect("app.db", DatabaseConfig::default(), None).await?;
///
/// db.transaction()
///     .run_async(|tx| async move {
///         tx.execute("INSERT INTO users (name) VALUES (?)", vec!["Alice".into()])
///             .await?;
///         Ok(())
///     })
///     .await?;
///
/// db.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Database {
   inner: Arc<DatabaseInner>,
}

impl Database {
   /// Registers a database backed by `source` for use from async code.
   pub fn register(
      source: Arc<dyn ConnectionSource>,
      dialect: Arc<dyn Dialect>,
      config: DatabaseConfig,
   ) -> Result<Self> {
      Self::register_as(DatabaseId::next(), source, dialect, config, None)
   }

   /// Registers a database for use from blocking threads.
   ///
   /// The database gets its own multi-threaded tokio runtime, which drives
   /// the connection source while blocking callers wait. Must not be called
   /// from within an async context.
   pub fn register_blocking(
      source: Arc<dyn ConnectionSource>,
      dialect: Arc<dyn Dialect>,
      config: DatabaseConfig,
   ) -> Result<Self> {
      let id = DatabaseId::next();
      let runtime = BlockingRuntime::new(&id.to_string())?;
      Self::register_as(id, source, dialect, config, Some(runtime))
   }

   fn register_as(
      id: DatabaseId,
      source: Arc<dyn ConnectionSource>,
      dialect: Arc<dyn Dialect>,
      config: DatabaseConfig,
      runtime: Option<BlockingRuntime>,
   ) -> Result<Self> {
      let name = config.name.clone().unwrap_or_else(|| id.to_string());

      let database = Self {
         inner: Arc::new(DatabaseInner {
            id,
            name,
            source,
            dialect,
            config,
            interceptors: InterceptorChain::default(),
            runtime,
         }),
      };

      TransactionManager::register(database.clone())?;
      Ok(database)
   }

   /// Opens (or reuses) the SQLite database at `path` and registers it.
   ///
   /// The database name defaults to the path.
   pub async fn connect(
      path: impl AsRef<Path>,
      config: DatabaseConfig,
      sqlite_config: Option<SqliteDatabaseConfig>,
   ) -> Result<Self> {
      let path = path.as_ref();
      let sqlite = SqliteDatabase::connect(path, sqlite_config).await?;

      debug!(path = %path.display(), "Connected SQLite database");
      Self::register(
         Arc::new(SqliteSource::new(sqlite)),
         Arc::new(SqliteDialect),
         named_after(config, path),
      )
   }

   /// Blocking counterpart of [`connect`](Self::connect). Opens the pools on
   /// the database's own runtime.
   pub fn connect_blocking(
      path: impl AsRef<Path>,
      config: DatabaseConfig,
      sqlite_config: Option<SqliteDatabaseConfig>,
   ) -> Result<Self> {
      let path = path.as_ref();
      let id = DatabaseId::next();
      let runtime = BlockingRuntime::new(&id.to_string())?;

      let handle = runtime
         .handle()
         .ok_or_else(|| Error::NoBlockingRuntime(path.display().to_string()))?;
      let sqlite = handle.block_on(SqliteDatabase::connect(path, sqlite_config))?;

      debug!(path = %path.display(), "Connected SQLite database for blocking use");
      Self::register_as(
         id,
         Arc::new(SqliteSource::new(sqlite)),
         Arc::new(SqliteDialect),
         named_after(config, path),
         Some(runtime),
      )
   }

   pub fn id(&self) -> DatabaseId {
      self.inner.id
   }

   pub fn name(&self) -> &str {
      &self.inner.name
   }

   pub fn config(&self) -> &DatabaseConfig {
      &self.inner.config
   }

   pub fn dialect(&self) -> &Arc<dyn Dialect> {
      &self.inner.dialect
   }

   pub(crate) fn source(&self) -> &Arc<dyn ConnectionSource> {
      &self.inner.source
   }

   /// Effective nesting policy. A dialect without savepoints always shares
   /// the outer transaction.
   pub fn nesting(&self) -> NestingPolicy {
      if self.inner.dialect.supports_savepoints() {
         self.inner.config.nesting
      } else {
         NestingPolicy::Shared
      }
   }

   /// Registers an interceptor for every transaction created on this
   /// database from now on. Runs before per-transaction interceptors.
   pub fn register_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
      self.inner.interceptors.push(interceptor);
   }

   pub(crate) fn interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
      self.inner.interceptors.snapshot()
   }

   pub fn manager(&self) -> Result<Arc<TransactionManager>> {
      TransactionManager::for_database(self.inner.id)
   }

   /// Starts configuring a transaction on this database.
   pub fn transaction(&self) -> TransactionBuilder {
      TransactionBuilder::new(Some(self.clone()))
   }

   pub fn is_blocking(&self) -> bool {
      self.inner.runtime.is_some()
   }

   pub(crate) fn blocking_handle(&self) -> Result<Handle> {
      self
         .inner
         .runtime
         .as_ref()
         .and_then(BlockingRuntime::handle)
         .cloned()
         .ok_or_else(|| Error::NoBlockingRuntime(self.inner.name.clone()))
   }

   /// Removes the database from the registry without closing its source.
   pub fn unregister(&self) -> Result<()> {
      TransactionManager::unregister(self.inner.id)
   }

   /// Unregisters the database and closes its connection source.
   pub async fn close(self) -> Result<()> {
      self.unregister()?;
      self.inner.source.close().await?;
      debug!(database = %self.inner.name, "Closed database");
      Ok(())
   }

   /// Blocking counterpart of [`close`](Self::close).
   pub fn close_blocking(self) -> Result<()> {
      let handle = self.blocking_handle()?;
      self.unregister()?;
      handle.block_on(self.inner.source.close())?;
      debug!(database = %self.inner.name, "Closed database");
      Ok(())
   }
}

fn named_after(mut config: DatabaseConfig, path: &Path) -> DatabaseConfig {
   if config.name.is_none() {
      config.name = Some(path.display().to_string());
   }
   config
}

impl PartialEq for Database {
   fn eq(&self, other: &Self) -> bool {
      self.inner.id == other.inner.id
   }
}

impl Eq for Database {}

impl fmt::Debug for Database {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Database")
         .field("id", &self.inner.id)
         .field("name", &self.inner.name)
         .field("dialect", &self.inner.dialect.name())
         .field("nesting", &self.nesting())
         .finish()
   }
}
