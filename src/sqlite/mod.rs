//! SQLite backend over `sqlx-sqlite-conn-mgr`
//!
//! Read-only transactions check out a connection from the read pool;
//! read-write transactions take the single writer, so writers are
//! serialized in-process and `SQLITE_BUSY` only comes from other processes.

mod decode;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx_sqlite_conn_mgr::{PooledConnection, SqliteDatabase};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::connection::{AcquireConfig, ConnectionHandle, ConnectionSource};
use crate::dialect::Dialect;
use crate::isolation::IsolationLevel;
use crate::statement::{PreparedStatement, StatementKind, StatementResult, WriteQueryResult};
use crate::{Error, Result};

use decode::{bind_value, decode_row};

// ============================================================================
// Dialect
// ============================================================================

/// SQLite: serializable by default, `READ UNCOMMITTED` through
/// `PRAGMA read_uncommitted`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
   fn name(&self) -> &str {
      "sqlite"
   }

   fn default_isolation_level(&self) -> IsolationLevel {
      IsolationLevel::Serializable
   }

   fn supports_isolation(&self, level: IsolationLevel) -> bool {
      matches!(
         level,
         IsolationLevel::Serializable | IsolationLevel::ReadUncommitted
      )
   }
}

// ============================================================================
// Source
// ============================================================================

/// Hands out connections of one [`SqliteDatabase`].
#[derive(Debug, Clone)]
pub struct SqliteSource {
   db: Arc<SqliteDatabase>,
}

impl SqliteSource {
   pub fn new(db: Arc<SqliteDatabase>) -> Self {
      Self { db }
   }

   pub fn database(&self) -> &Arc<SqliteDatabase> {
      &self.db
   }
}

#[async_trait]
impl ConnectionSource for SqliteSource {
   async fn acquire(&self, config: &AcquireConfig) -> Result<Box<dyn ConnectionHandle>> {
      let acquired = if config.read_only {
         self.db.acquire_reader().await
      } else {
         self.db.acquire_writer().await
      };

      let conn = acquired.map_err(|e| Error::ConnectionUnavailable {
         database: config.database_name.clone(),
         reason: e.to_string(),
      })?;

      Ok(Box::new(SqliteConnection::new(conn)))
   }

   async fn close(&self) -> Result<()> {
      Arc::clone(&self.db).close().await?;
      Ok(())
   }
}

// ============================================================================
// Connection
// ============================================================================

/// One pooled connection with autocommit emulated off.
///
/// `BEGIN` is issued lazily before the first statement after acquisition or
/// after each commit/rollback: `IMMEDIATE` on the writer, so lock conflicts
/// surface at the first statement rather than at commit, and `DEFERRED` on
/// readers.
pub struct SqliteConnection {
   id: Uuid,
   conn: Option<PooledConnection>,
   in_transaction: bool,
   query_only: bool,
   read_uncommitted: bool,
}

impl SqliteConnection {
   fn new(conn: PooledConnection) -> Self {
      Self {
         id: Uuid::new_v4(),
         conn: Some(conn),
         in_transaction: false,
         query_only: false,
         read_uncommitted: false,
      }
   }

   fn conn_mut(&mut self) -> Result<&mut PooledConnection> {
      self.conn.as_mut().ok_or(Error::TransactionAlreadyFinalized)
   }

   async fn run(&mut self, sql: &str) -> Result<()> {
      trace!(connection = %self.id, sql, "SQLite control statement");
      let conn = self.conn_mut()?;
      sqlx::query(sql)
         .execute(&mut **conn)
         .await
         .map_err(map_sqlx_error)?;
      Ok(())
   }

   async fn ensure_begun(&mut self) -> Result<()> {
      if self.in_transaction {
         return Ok(());
      }

      let begin = if self.conn_mut()?.is_read_only() {
         "BEGIN DEFERRED"
      } else {
         "BEGIN IMMEDIATE"
      };
      self.run(begin).await?;
      self.in_transaction = true;
      Ok(())
   }
}

#[async_trait]
impl ConnectionHandle for SqliteConnection {
   fn id(&self) -> Uuid {
      self.id
   }

   async fn configure(&mut self, isolation: IsolationLevel, read_only: bool) -> Result<()> {
      if !SqliteDialect.supports_isolation(isolation) {
         return Err(Error::IsolationUnsupported {
            level: isolation,
            dialect: SqliteDialect.name().to_string(),
         });
      }

      if isolation == IsolationLevel::ReadUncommitted {
         self.run("PRAGMA read_uncommitted = ON").await?;
         self.read_uncommitted = true;
      }
      if read_only {
         self.run("PRAGMA query_only = ON").await?;
         self.query_only = true;
      }

      Ok(())
   }

   async fn execute(&mut self, statement: &PreparedStatement) -> Result<StatementResult> {
      self.ensure_begun().await?;
      let conn = self.conn_mut()?;

      let query = statement
         .values
         .iter()
         .fold(sqlx::query(&statement.sql), |query, value| bind_value(query, value));

      match statement.kind {
         StatementKind::Query => {
            let rows = query
               .fetch_all(&mut **conn)
               .await
               .map_err(map_sqlx_error)?;
            let decoded = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
            Ok(StatementResult::Rows(decoded))
         }
         StatementKind::Write | StatementKind::Control => {
            let result = query.execute(&mut **conn).await.map_err(map_sqlx_error)?;
            Ok(StatementResult::Write(WriteQueryResult {
               rows_affected: result.rows_affected(),
               last_insert_id: result.last_insert_rowid(),
            }))
         }
      }
   }

   async fn commit(&mut self) -> Result<()> {
      if !self.in_transaction {
         return Ok(());
      }
      // Still open if COMMIT fails; the caller rolls back
      self.run("COMMIT").await?;
      self.in_transaction = false;
      Ok(())
   }

   async fn rollback(&mut self) -> Result<()> {
      if !self.in_transaction {
         return Ok(());
      }

      let result = match self.run("ROLLBACK").await {
         // SQLite already rolled back on its own (e.g. after SQLITE_FULL)
         Err(Error::Sqlx(e)) if e.to_string().contains("no transaction is active") => Ok(()),
         result => result,
      };
      // Still open if ROLLBACK fails; close() discards the connection
      if result.is_ok() {
         self.in_transaction = false;
      }
      result
   }

   async fn close(&mut self) -> Result<()> {
      if self.conn.is_none() {
         return Ok(());
      }

      let rolled_back = self.rollback().await;

      if self.in_transaction {
         self.in_transaction = false;
         if let Some(conn) = self.conn.take() {
            warn!(connection = %self.id, "Discarding connection with a transaction still open");
            if let Err(e) = conn.discard().await {
               warn!(connection = %self.id, error = %e, "Failed to close discarded connection");
            }
         }
         return rolled_back;
      }

      // Pooled connections outlive this handle; undo per-transaction pragmas
      if self.query_only
         && let Err(e) = self.run("PRAGMA query_only = OFF").await
      {
         warn!(connection = %self.id, error = %e, "Failed to reset query_only");
      }
      if self.read_uncommitted
         && let Err(e) = self.run("PRAGMA read_uncommitted = OFF").await
      {
         warn!(connection = %self.id, error = %e, "Failed to reset read_uncommitted");
      }

      self.conn = None;
      rolled_back
   }
}

/// `SQLITE_BUSY` and `SQLITE_LOCKED`, including their extended codes, are
/// transient conflicts worth retrying.
fn map_sqlx_error(err: sqlx::Error) -> Error {
   let conflict = err
      .as_database_error()
      .and_then(|db_err| db_err.code())
      .is_some_and(|code| is_conflict_code(&code));

   if conflict {
      Error::RetryableConflict(err.to_string())
   } else {
      Error::Sqlx(err)
   }
}

fn is_conflict_code(code: &str) -> bool {
   const SQLITE_BUSY: i32 = 5;
   const SQLITE_LOCKED: i32 = 6;

   code
      .parse::<i32>()
      .is_ok_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}
