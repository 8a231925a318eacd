//! RAII wrapper around a connection checked out of one of the pools

use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteConnection;
use std::ops::{Deref, DerefMut};

/// A connection checked out of either the read pool or the single-connection
/// write pool
///
/// The connection returns to its pool on drop. While a writer is checked out
/// no other writer can be acquired (the write pool has max_connections=1), so
/// holding one serializes write access.
///
/// The guard derefs to `SqliteConnection` allowing direct use with sqlx queries.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_conn_mgr::SqliteDatabase;
/// use sqlx::query;
///
/// # async fn example() -> Result<(), sqlx_sqlite_conn_mgr::Error> {
/// let db = SqliteDatabase::connect("test.db", None).await?;
/// let mut writer = db.acquire_writer().await?;
/// query("INSERT INTO users (name) VALUES (?)")
///     .bind("Alice")
///     .execute(&mut *writer)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PooledConnection {
   conn: PoolConnection<Sqlite>,
   read_only: bool,
}

impl PooledConnection {
   pub(crate) fn reader(conn: PoolConnection<Sqlite>) -> Self {
      Self {
         conn,
         read_only: true,
      }
   }

   pub(crate) fn writer(conn: PoolConnection<Sqlite>) -> Self {
      Self {
         conn,
         read_only: false,
      }
   }

   /// Whether this connection came from the read-only pool
   pub fn is_read_only(&self) -> bool {
      self.read_only
   }

   /// Closes the connection instead of returning it to its pool, which opens
   /// a replacement on demand
   ///
   /// For connections left in a state the next borrower must not inherit,
   /// such as a transaction that could not be rolled back.
   pub async fn discard(self) -> crate::Result<()> {
      self.conn.close().await?;
      Ok(())
   }
}

impl Deref for PooledConnection {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      &self.conn
   }
}

impl DerefMut for PooledConnection {
   fn deref_mut(&mut self) -> &mut Self::Target {
      &mut self.conn
   }
}
