//! Transaction scopes: begin, run the body, commit or roll back, retry
//!
//! The three flavours share the boundary logic in this module and differ
//! only in how the body is run and how the context is carried:
//!
//! - [`TransactionBuilder::run`]: blocking closure, thread slot
//! - [`TransactionBuilder::run_async`]: future, rebound on every poll
//! - [`TransactionBuilder::stream`]: stream, explicit [`TxContext`](crate::TxContext)

mod blocking;
mod reactive;
mod task;

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, warn};

pub use blocking::SyncTransaction;
pub use reactive::TransactionStream;

use crate::context::ContextStack;
use crate::database::Database;
use crate::interceptor::Interceptor;
use crate::isolation::IsolationLevel;
use crate::manager::{TransactionManager, TransactionOptions};
use crate::transaction::Transaction;
use crate::{Error, Result};

/// Configures one transaction scope.
///
/// Obtained from [`Database::transaction`] or, to use the database of the
/// current transaction (or the default database), from [`transaction`].
///
/// Settings left unset are inherited: from the outer transaction when the
/// scope is nested, from the database's defaults otherwise. A nested scope
/// cannot change the isolation level or read-only flag of its outer
/// transaction.
#[derive(Clone, Default)]
pub struct TransactionBuilder {
   database: Option<Database>,
   options: TransactionOptions,
}

/// Starts configuring a transaction on the current transaction's database,
/// or on the default database outside any transaction.
pub fn transaction() -> TransactionBuilder {
   TransactionBuilder::new(None)
}

impl TransactionBuilder {
   pub(crate) fn new(database: Option<Database>) -> Self {
      Self {
         database,
         options: TransactionOptions::default(),
      }
   }

   pub fn isolation(mut self, level: IsolationLevel) -> Self {
      self.options.isolation = Some(level);
      self
   }

   pub fn read_only(mut self, read_only: bool) -> Self {
      self.options.read_only = Some(read_only);
      self
   }

   /// Total number of times the body may run. Must be at least 1. Ignored by
   /// nested scopes, which never retry.
   pub fn max_attempts(mut self, attempts: u32) -> Self {
      self.options.max_attempts = Some(attempts);
      self
   }

   pub fn query_timeout(mut self, timeout: Duration) -> Self {
      self.options.query_timeout = Some(timeout);
      self
   }

   /// Adds an interceptor to the transaction this scope creates.
   pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
      self.options.interceptors.push(interceptor);
      self
   }

   pub fn options(&self) -> &TransactionOptions {
      &self.options
   }
}

/// Picks the database for a scope: the explicit one, else the database of
/// the innermost transaction in `stack`, else the registry default.
pub(crate) fn resolve_database(stack: &ContextStack, database: Option<&Database>) -> Result<Database> {
   if let Some(database) = database {
      return Ok(database.clone());
   }
   if let Some(tx) = stack.current() {
      return Ok(tx.database().clone());
   }
   TransactionManager::default_database()
}

// ============================================================================
// Scope
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeKind {
   /// Owns a new transaction and its connection.
   TopLevel,
   /// New transaction guarded by a savepoint on the outer connection.
   Savepoint,
   /// Runs inside the outer transaction itself.
   Reused,
}

/// One attempt of a transaction scope.
pub(crate) struct Scope {
   tx: Arc<Transaction>,
   kind: ScopeKind,
}

/// Creates the transaction for one attempt, nested in the innermost
/// transaction of `stack` on the same database if there is one.
pub(crate) fn open_scope(
   stack: &ContextStack,
   database: &Database,
   options: &TransactionOptions,
) -> Result<Scope> {
   let manager = database.manager()?;
   let outer = stack.current_for(database.id());
   let tx = manager.new_transaction(options, outer)?;

   let kind = match outer {
      None => ScopeKind::TopLevel,
      Some(outer) if Arc::ptr_eq(outer, &tx) => ScopeKind::Reused,
      Some(_) => ScopeKind::Savepoint,
   };

   if kind == ScopeKind::Reused {
      tx.enter_shared_scope();
   }

   Ok(Scope { tx, kind })
}

impl Drop for Scope {
   fn drop(&mut self) {
      if self.kind == ScopeKind::Reused {
         self.tx.exit_shared_scope();
      }
   }
}

impl Scope {
   pub(crate) fn tx(&self) -> &Arc<Transaction> {
      &self.tx
   }

   /// Sets the savepoint of a nested scope. On failure the transaction is
   /// released and the error returned; the body must not run.
   pub(crate) async fn enter(&self) -> Result<()> {
      if self.kind != ScopeKind::Savepoint {
         return Ok(());
      }

      if let Err(e) = self.tx.begin_scope().await {
         self.tx.release().await;
         return Err(e);
      }
      Ok(())
   }

   /// Ends the scope with the body's `outcome`: commit on success, roll
   /// back on failure, then release.
   ///
   /// A failed commit is followed by a rollback and its error returned. A
   /// failed rollback is logged and the body's error returned. When
   /// everything else succeeded, an interceptor failure recorded during the
   /// scope is returned instead of the value.
   pub(crate) async fn finish<T>(&self, outcome: Result<T>) -> Result<T> {
      if self.kind == ScopeKind::Reused {
         return outcome;
      }

      let result = match outcome {
         Ok(value) => match self.tx.commit_scope().await {
            Ok(()) => Ok(value),
            Err(commit_err) => Err(self.tx.rollback_after(commit_err).await),
         },
         Err(e) => {
            debug!(transaction = %self.tx.id(), error = %e, "Transaction body failed");
            Err(self.tx.rollback_after(e).await)
         }
      };

      self.tx.release().await;

      match (result, self.tx.take_failure()) {
         (Ok(_), Some(failure)) => Err(failure),
         (result, _) => result,
      }
   }

   /// Whether the whole scope should run again after `err`.
   pub(crate) fn may_retry(&self, err: &Error, attempt: u32) -> bool {
      self.kind == ScopeKind::TopLevel && err.is_retryable() && attempt < self.tx.max_attempts()
   }

   pub(crate) fn retry_policy(&self) -> RetryPolicy {
      RetryPolicy::new(self.tx.max_attempts(), self.tx.database())
   }
}

/// Bounds and pacing of top-level retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
   pub max_attempts: u32,
   pub min_delay: Duration,
   pub max_delay: Duration,
}

impl RetryPolicy {
   pub(crate) fn new(max_attempts: u32, database: &Database) -> Self {
      let (min_delay, max_delay) = database.config().retry_delays();
      Self {
         max_attempts,
         min_delay,
         max_delay,
      }
   }

   /// Delay before attempt `attempt + 1`: the minimum delay doubled for
   /// every attempt already retried, capped at the maximum.
   pub fn delay(&self, attempt: u32) -> Duration {
      let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
      self.min_delay.saturating_mul(factor).min(self.max_delay)
   }
}

fn log_retry(tx: &Transaction, attempt: u32, policy: &RetryPolicy, err: &Error) {
   warn!(
      transaction = %tx.id(),
      database = %tx.database().name(),
      attempt,
      max_attempts = policy.max_attempts,
      error = %err,
      "Retrying transaction after conflict"
   );
}

// ============================================================================
// Cancellation
// ============================================================================

/// Where a dropped scope runs its rollback.
pub(crate) enum Cleanup {
   /// Spawned on the runtime (async scopes).
   Spawn(Handle),
   /// Run to completion on the dropping thread (blocking scopes).
   Block(Handle),
   /// No runtime available.
   Detached,
}

impl Cleanup {
   pub(crate) fn current() -> Self {
      Handle::try_current().map_or(Cleanup::Detached, Cleanup::Spawn)
   }
}

/// Rolls back a scope that is dropped before it finished: a cancelled
/// future, a dropped stream or a panicking blocking body.
pub(crate) struct CancelGuard {
   tx: Option<Arc<Transaction>>,
   kind: ScopeKind,
   cleanup: Cleanup,
}

impl CancelGuard {
   pub(crate) fn new(scope: &Scope, cleanup: Cleanup) -> Self {
      Self {
         tx: Some(Arc::clone(&scope.tx)),
         kind: scope.kind,
         cleanup,
      }
   }

   pub(crate) fn disarm(mut self) {
      self.tx = None;
   }
}

impl Drop for CancelGuard {
   fn drop(&mut self) {
      let Some(tx) = self.tx.take() else {
         return;
      };

      match self.kind {
         ScopeKind::Reused => {}
         ScopeKind::Savepoint => tx.abandon(),
         ScopeKind::TopLevel => {
            warn!(transaction = %tx.id(), "Transaction scope dropped before completion, rolling back");

            let rollback = async move {
               if let Err(e) = tx.rollback_scope().await {
                  error!(transaction = %tx.id(), error = %e, "Rollback of cancelled transaction failed");
               }
               tx.release().await;
            };

            match &self.cleanup {
               Cleanup::Spawn(handle) => {
                  handle.spawn(rollback);
               }
               Cleanup::Block(handle) => {
                  if Handle::try_current().is_ok() {
                     handle.spawn(rollback);
                  } else {
                     handle.block_on(rollback);
                  }
               }
               Cleanup::Detached => {
                  error!("No runtime to roll back a cancelled transaction; its connection is dropped");
               }
            }
         }
      }
   }
}
