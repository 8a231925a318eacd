use std::ops::Deref;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::runtime::Handle;

use super::{CancelGuard, Cleanup, TransactionBuilder, log_retry, open_scope, resolve_database};
use crate::context::{ExecutionContext, ThreadContext, thread};
use crate::statement::{Row, Statement, WriteQueryResult};
use crate::transaction::Transaction;
use crate::{Error, Result};

/// A [`Transaction`] seen from a blocking thread.
///
/// Statement and boundary methods block the calling thread on the database's
/// runtime. Everything else is available through `Deref`.
pub struct SyncTransaction {
   tx: Arc<Transaction>,
   runtime: Handle,
}

impl SyncTransaction {
   pub fn transaction(&self) -> &Arc<Transaction> {
      &self.tx
   }

   pub fn exec<S>(&self, statement: &S) -> Result<S::Output>
   where
      S: Statement + ?Sized,
   {
      self.runtime.block_on(self.tx.exec(statement))
   }

   pub fn execute(&self, query: &str, values: Vec<JsonValue>) -> Result<WriteQueryResult> {
      self.runtime.block_on(self.tx.execute(query, values))
   }

   pub fn fetch_all(&self, query: &str, values: Vec<JsonValue>) -> Result<Vec<Row>> {
      self.runtime.block_on(self.tx.fetch_all(query, values))
   }

   pub fn fetch_one(&self, query: &str, values: Vec<JsonValue>) -> Result<Option<Row>> {
      self.runtime.block_on(self.tx.fetch_one(query, values))
   }

   /// See [`Transaction::commit`].
   pub fn commit(&self) -> Result<()> {
      self.runtime.block_on(self.tx.commit())
   }

   /// See [`Transaction::rollback`].
   pub fn rollback(&self) -> Result<()> {
      self.runtime.block_on(self.tx.rollback())
   }
}

impl Deref for SyncTransaction {
   type Target = Transaction;

   fn deref(&self) -> &Transaction {
      &self.tx
   }
}

impl TransactionBuilder {
   /// Runs `body` in a transaction on the calling thread.
   ///
   /// The database must have been opened for blocking use
   /// ([`Database::connect_blocking`](crate::Database::connect_blocking) or
   /// [`Database::register_blocking`](crate::Database::register_blocking)),
   /// and the calling thread must not be a tokio worker.
   ///
   /// Commit, rollback and retry behave as in
   /// [`run_async`](Self::run_async). If the body panics, the transaction is
   /// rolled back before the panic continues.
   pub fn run<T, F>(self, mut body: F) -> Result<T>
   where
      F: FnMut(&SyncTransaction) -> Result<T>,
   {
      let stack = ThreadContext.stack();
      let database = resolve_database(&stack, self.database.as_ref())?;
      let runtime = database.blocking_handle()?;

      if Handle::try_current().is_ok() {
         return Err(Error::InvalidArgument(
            "blocking transactions cannot run on an async runtime thread".to_string(),
         ));
      }

      let mut attempt = 1;

      loop {
         let scope = open_scope(&stack, &database, &self.options)?;
         let guard = CancelGuard::new(&scope, Cleanup::Block(runtime.clone()));

         if let Err(e) = runtime.block_on(scope.enter()) {
            guard.disarm();
            return Err(e);
         }

         let sync_tx = SyncTransaction {
            tx: Arc::clone(scope.tx()),
            runtime: runtime.clone(),
         };
         let outcome = {
            let _bound = thread::bind(stack.push(Arc::clone(scope.tx())));
            body(&sync_tx)
         };

         let result = runtime.block_on(scope.finish(outcome));
         guard.disarm();

         match result {
            Err(e) if scope.may_retry(&e, attempt) => {
               let policy = scope.retry_policy();
               log_retry(scope.tx(), attempt, &policy, &e);

               let delay = policy.delay(attempt);
               if !delay.is_zero() {
                  std::thread::sleep(delay);
               }
               attempt += 1;
            }
            result => return result,
         }
      }
   }
}
