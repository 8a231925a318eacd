//! Observers notified at transaction boundaries

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::error;

use crate::error::Hook;
use crate::statement::PreparedStatement;
use crate::transaction::Transaction;
use crate::{Error, Result};

/// Hooks fired around a transaction's commit and rollback.
///
/// Every method defaults to a no-op, so implementors only override the
/// points they care about. For one transaction, hooks run in registration
/// order: database-wide interceptors first, then those registered on the
/// transaction itself.
///
/// A hook that fails (or panics) does not stop the remaining hooks, nor the
/// commit or rollback it surrounds. The failure is logged and kept on the
/// transaction; it is returned from the transaction scope only when nothing
/// else went wrong.
#[async_trait]
pub trait Interceptor: Send + Sync {
   /// Name used in logs and in [`Error::Interceptor`].
   fn name(&self) -> &str {
      std::any::type_name::<Self>()
   }

   /// Runs before the database commit, still inside the transaction. Pending
   /// writes flushed here commit together with the rest of the work.
   async fn before_commit(&self, _tx: &Transaction) -> Result<()> {
      Ok(())
   }

   /// Runs after the database commit succeeded.
   async fn after_commit(&self, _tx: &Transaction) -> Result<()> {
      Ok(())
   }

   async fn before_rollback(&self, _tx: &Transaction) -> Result<()> {
      Ok(())
   }

   /// Runs after the database rollback, even when the rollback itself failed.
   async fn after_rollback(&self, _tx: &Transaction) -> Result<()> {
      Ok(())
   }

   async fn on_statement_prepared(
      &self,
      _tx: &Transaction,
      _statement: &PreparedStatement,
   ) -> Result<()> {
      Ok(())
   }
}

#[derive(Default)]
pub(crate) struct InterceptorChain {
   interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
}

impl InterceptorChain {
   pub(crate) fn with(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
      Self {
         interceptors: RwLock::new(interceptors),
      }
   }

   pub(crate) fn push(&self, interceptor: Arc<dyn Interceptor>) {
      self.interceptors.write().push(interceptor);
   }

   /// Adds `interceptor` unless this exact instance is already registered.
   pub(crate) fn push_unique(&self, interceptor: Arc<dyn Interceptor>) -> bool {
      let mut interceptors = self.interceptors.write();
      if interceptors.iter().any(|existing| Arc::ptr_eq(existing, &interceptor)) {
         return false;
      }
      interceptors.push(interceptor);
      true
   }

   pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Interceptor>> {
      self.interceptors.read().clone()
   }

   pub(crate) fn is_empty(&self) -> bool {
      self.interceptors.read().is_empty()
   }

   /// Runs `hook` on every interceptor and returns the failures.
   ///
   /// The list is snapshotted first, so an interceptor registered from inside
   /// a hook only sees later boundaries.
   pub(crate) async fn fire(
      &self,
      hook: Hook,
      tx: &Transaction,
      statement: Option<&PreparedStatement>,
   ) -> Vec<Error> {
      let mut failures = Vec::new();

      for interceptor in self.snapshot() {
         let call = match (hook, statement) {
            (Hook::BeforeCommit, _) => interceptor.before_commit(tx),
            (Hook::AfterCommit, _) => interceptor.after_commit(tx),
            (Hook::BeforeRollback, _) => interceptor.before_rollback(tx),
            (Hook::AfterRollback, _) => interceptor.after_rollback(tx),
            (Hook::StatementPrepared, Some(statement)) => {
               interceptor.on_statement_prepared(tx, statement)
            }
            (Hook::StatementPrepared, None) => continue,
         };

         let failure = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => Error::interceptor(interceptor.name(), hook, e),
            Err(panic) => Error::interceptor(interceptor.name(), hook, panic_message(&*panic)),
         };

         error!(
            transaction = %tx.id(),
            interceptor = interceptor.name(),
            %hook,
            error = %failure,
            "Interceptor failed"
         );
         failures.push(failure);
      }

      failures
   }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
   if let Some(message) = panic.downcast_ref::<&str>() {
      format!("panicked: {message}")
   } else if let Some(message) = panic.downcast_ref::<String>() {
      format!("panicked: {message}")
   } else {
      "panicked".to_string()
   }
}
