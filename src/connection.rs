//! The seam between the engine and a database driver
//!
//! A [`ConnectionSource`] hands out [`ConnectionHandle`]s. The engine asks for
//! one lazily, the first time a top-level transaction runs a statement, and
//! gives it back through [`ConnectionSource::release`] when that transaction
//! ends. A handle is never used by two transactions at once.

use async_trait::async_trait;
use uuid::Uuid;

use crate::database::DatabaseId;
use crate::isolation::IsolationLevel;
use crate::statement::{PreparedStatement, StatementResult};
use crate::Result;

/// What a transaction needs from the connection it is about to be given.
#[derive(Debug, Clone)]
pub struct AcquireConfig {
   pub database: DatabaseId,
   pub database_name: String,
   pub isolation: IsolationLevel,
   pub read_only: bool,
}

/// One physical connection, exclusively owned by one top-level transaction
/// (and shared with its nested transactions, which run sequentially).
///
/// Handles behave as if autocommit were off: after `configure`, the first
/// statement implicitly opens a transaction that stays open until `commit`
/// or `rollback`, and the next statement opens a new one.
#[async_trait]
pub trait ConnectionHandle: Send {
   /// Identity of the handle, distinct for every handle ever acquired.
   fn id(&self) -> Uuid;

   /// Apply the isolation level and read-only flag. Called once, right after
   /// acquisition and before any statement.
   async fn configure(&mut self, isolation: IsolationLevel, read_only: bool) -> Result<()>;

   async fn execute(&mut self, statement: &PreparedStatement) -> Result<StatementResult>;

   /// Commit the open transaction, if any.
   async fn commit(&mut self) -> Result<()>;

   /// Roll back the open transaction, if any.
   async fn rollback(&mut self) -> Result<()>;

   /// Roll back anything still open and return the connection to its source.
   async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait ConnectionSource: Send + Sync {
   async fn acquire(&self, config: &AcquireConfig) -> Result<Box<dyn ConnectionHandle>>;

   async fn release(&self, mut handle: Box<dyn ConnectionHandle>) -> Result<()> {
      handle.close().await
   }

   /// Shut the source down. Called when its database is closed.
   async fn close(&self) -> Result<()> {
      Ok(())
   }
}
