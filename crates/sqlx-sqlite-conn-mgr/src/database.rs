//! SQLite database with a pool of readers and a single exclusive writer

use crate::Result;
use crate::config::SqliteDatabaseConfig;
use crate::error::Error;
use crate::guard::PooledConnection;
use crate::registry::{get_or_open_database, is_memory_database, uncache_database};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Sqlite};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

/// SQLite database with connection pooling for concurrent reads and exclusive writes.
///
/// Read-only work checks out a connection with `acquire_reader()`; write work
/// takes the single writer with `acquire_writer()`, which lazily initializes
/// WAL mode on first use.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_conn_mgr::SqliteDatabase;
///
/// # async fn example() -> Result<(), sqlx_sqlite_conn_mgr::Error> {
/// let db = SqliteDatabase::connect("test.db", None).await?;
///
/// let mut writer = db.acquire_writer().await?;
/// sqlx::query("INSERT INTO users (name) VALUES (?)")
///     .bind("Alice")
///     .execute(&mut *writer)
///     .await?;
/// drop(writer);
///
/// let mut reader = db.acquire_reader().await?;
/// let rows = sqlx::query("SELECT * FROM users")
///     .fetch_all(&mut *reader)
///     .await?;
///
/// db.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SqliteDatabase {
   /// Pool of read-only connections for concurrent reads
   read_pool: Pool<Sqlite>,

   /// Single read-write connection pool (max_connections=1) for serialized writes
   write_conn: Pool<Sqlite>,

   /// Tracks if WAL mode has been initialized (set on first write)
   wal_initialized: AtomicBool,

   /// Marks database as closed to prevent further operations
   closed: AtomicBool,

   /// Path to database file (used for cleanup and registry lookups)
   path: PathBuf,
}

impl SqliteDatabase {
   /// Connect to a SQLite database
   ///
   /// Multiple calls with the same path return the same database instance.
   /// The database file is created if it doesn't exist.
   ///
   /// # Arguments
   ///
   /// * `path` - Path to the SQLite database file (will be created if missing)
   /// * `custom_config` - Optional custom configuration for connection pools.
   ///   Pass `None` to use [`SqliteDatabaseConfig::default`].
   pub async fn connect(
      path: impl AsRef<Path>,
      custom_config: Option<SqliteDatabaseConfig>,
   ) -> Result<Arc<Self>> {
      let config = custom_config.unwrap_or_default();
      let path = path.as_ref();

      if path.as_os_str().is_empty() {
         return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Database path cannot be empty",
         )));
      }

      let path = path.to_path_buf();

      get_or_open_database(&path, || async {
         // Read pool connections are read-only and cannot create the file, so
         // create it up front with a throwaway read-write connection.
         if !path.exists() && !is_memory_database(&path) {
            let conn = SqliteConnectOptions::new()
               .filename(&path)
               .create_if_missing(true)
               .read_only(false)
               .connect()
               .await?;
            drop(conn);
         }

         let read_options = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true)
            .busy_timeout(config.busy_timeout());

         let read_pool = SqlitePoolOptions::new()
            .max_connections(config.max_read_connections)
            .min_connections(0)
            .idle_timeout(Some(config.idle_timeout()))
            .acquire_timeout(config.acquire_timeout())
            .connect_with(read_options)
            .await?;

         let write_options = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(false)
            .busy_timeout(config.busy_timeout());

         let write_conn = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .idle_timeout(Some(config.idle_timeout()))
            .acquire_timeout(config.acquire_timeout())
            .connect_with(write_options)
            .await?;

         debug!(
            "Opened {} with up to {} readers",
            path.display(),
            config.max_read_connections
         );

         Ok(Self {
            read_pool,
            write_conn,
            wal_initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            path: path.clone(),
         })
      })
      .await
   }

   /// Path this database was opened with
   pub fn path(&self) -> &Path {
      &self.path
   }

   /// Whether [`close`](Self::close) has been called
   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::SeqCst)
   }

   /// Get a reference to the read-only connection pool
   pub fn read_pool(&self) -> Result<&Pool<Sqlite>> {
      if self.is_closed() {
         return Err(Error::DatabaseClosed);
      }
      Ok(&self.read_pool)
   }

   /// Check out one read-only connection
   ///
   /// The connection stays checked out until the returned guard is dropped, so
   /// a caller can run several statements (including an explicit `BEGIN`) on
   /// the same connection.
   pub async fn acquire_reader(&self) -> Result<PooledConnection> {
      if self.is_closed() {
         return Err(Error::DatabaseClosed);
      }

      let conn = self
         .read_pool
         .acquire()
         .await
         .map_err(|e| map_acquire_error(e, "read"))?;

      Ok(PooledConnection::reader(conn))
   }

   /// Acquire exclusive write access to the database
   ///
   /// Only one writer can exist at a time. On the first call this enables WAL
   /// mode and sets `synchronous = NORMAL`.
   pub async fn acquire_writer(&self) -> Result<PooledConnection> {
      if self.is_closed() {
         return Err(Error::DatabaseClosed);
      }

      let mut conn = self
         .write_conn
         .acquire()
         .await
         .map_err(|e| map_acquire_error(e, "write"))?;

      if !self.wal_initialized.load(Ordering::SeqCst) {
         sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;

         // https://www.sqlite.org/wal.html#performance_considerations
         sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&mut *conn)
            .await?;

         self.wal_initialized.store(true, Ordering::SeqCst);
      }

      Ok(PooledConnection::writer(conn))
   }

   /// Close the database and clean up resources
   ///
   /// Waits for checked-out connections to come back, checkpoints the WAL and
   /// closes both pools. Afterwards every acquire returns `Error::DatabaseClosed`.
   pub async fn close(self: Arc<Self>) -> Result<()> {
      self.closed.store(true, Ordering::SeqCst);

      if let Err(e) = uncache_database(&self.path).await {
         error!("Failed to remove database from cache: {}", e);
      }

      self.read_pool.close().await;

      // Flush the WAL into the main file and truncate it
      if self.wal_initialized.load(Ordering::SeqCst)
         && let Ok(mut conn) = self.write_conn.acquire().await
      {
         let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&mut *conn)
            .await;
      }

      self.write_conn.close().await;

      Ok(())
   }

   /// Close the database and delete the database, WAL and SHM files
   pub async fn remove(self: Arc<Self>) -> Result<()> {
      let path = self.path.clone();

      self.close().await?;

      std::fs::remove_file(&path).map_err(Error::Io)?;

      // WAL and SHM files only exist if a writer was ever acquired
      for suffix in ["-wal", "-shm"] {
         let mut sidecar = path.clone().into_os_string();
         sidecar.push(suffix);

         if let Err(e) = std::fs::remove_file(&sidecar)
            && e.kind() != std::io::ErrorKind::NotFound
         {
            return Err(Error::Io(e));
         }
      }

      Ok(())
   }
}

fn map_acquire_error(err: sqlx::Error, kind: &'static str) -> Error {
   match err {
      sqlx::Error::PoolTimedOut => Error::AcquireTimeout(kind),
      sqlx::Error::PoolClosed => Error::DatabaseClosed,
      other => Error::Sqlx(other),
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn test_database_closed_error() {
      let dir = tempfile::tempdir().unwrap();
      let db = SqliteDatabase::connect(dir.path().join("closed.db"), None)
         .await
         .unwrap();

      let db_ref = Arc::clone(&db);
      db.close().await.unwrap();

      assert!(db_ref.is_closed());
      assert!(matches!(db_ref.read_pool().unwrap_err(), Error::DatabaseClosed));
      assert!(matches!(
         db_ref.acquire_reader().await.unwrap_err(),
         Error::DatabaseClosed
      ));
      assert!(matches!(
         db_ref.acquire_writer().await.unwrap_err(),
         Error::DatabaseClosed
      ));
   }

   #[tokio::test]
   async fn test_empty_path_rejected() {
      let result = SqliteDatabase::connect("", None).await;

      assert!(matches!(result.unwrap_err(), Error::Io(_)));
   }

   #[tokio::test]
   async fn test_reader_and_writer_flags() {
      let dir = tempfile::tempdir().unwrap();
      let db = SqliteDatabase::connect(dir.path().join("flags.db"), None)
         .await
         .unwrap();

      let writer = db.acquire_writer().await.unwrap();
      assert!(!writer.is_read_only());
      drop(writer);

      let reader = db.acquire_reader().await.unwrap();
      assert!(reader.is_read_only());
      drop(reader);

      db.remove().await.unwrap();
   }
}
