use std::future::Future;
use std::sync::Arc;

use super::{CancelGuard, Cleanup, TransactionBuilder, log_retry, open_scope, resolve_database};
use crate::Result;
use crate::context::{ExecutionContext, ThreadContext, TransactionScope};
use crate::transaction::Transaction;

impl TransactionBuilder {
   /// Runs `body` in a transaction from async code.
   ///
   /// The body sees the transaction through
   /// [`current_transaction`](crate::current_transaction) on whatever worker
   /// thread it is resumed. When it returns `Ok` the transaction commits,
   /// otherwise it rolls back and the error is returned. A top-level scope
   /// runs the body again, on a fresh transaction and connection, after a
   /// retryable conflict, up to `max_attempts` times in total.
   ///
   /// Dropping the returned future before it completes rolls the
   /// transaction back.
   ///
   /// # Example
   ///
   /// ```no_run
   /// # async fn example(db: sqlx_txn::Database) -> sqlx_txn::Result<()> {
   /// let count = db
   ///     .transaction()
   ///     .max_attempts(5)
   ///     .run_async(|tx| async move {
   ///         tx.execute("UPDATE counters SET n = n + 1", vec![]).await?;
   ///         let row = tx.fetch_one("SELECT n FROM counters", vec![]).await?;
   ///         Ok(row.and_then(|row| row["n"].as_i64()))
   ///     })
   ///     .await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn run_async<T, F, Fut>(self, mut body: F) -> Result<T>
   where
      F: FnMut(Arc<Transaction>) -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      let stack = ThreadContext.stack();
      let database = resolve_database(&stack, self.database.as_ref())?;
      let mut attempt = 1;

      loop {
         let scope = open_scope(&stack, &database, &self.options)?;
         let guard = CancelGuard::new(&scope, Cleanup::current());

         if let Err(e) = scope.enter().await {
            guard.disarm();
            return Err(e);
         }

         let tx = Arc::clone(scope.tx());
         let outcome = TransactionScope::new(stack.push(Arc::clone(&tx)), async {
            body(tx).await
         })
         .await;

         let result = scope.finish(outcome).await;
         guard.disarm();

         match result {
            Err(e) if scope.may_retry(&e, attempt) => {
               let policy = scope.retry_policy();
               log_retry(scope.tx(), attempt, &policy, &e);

               let delay = policy.delay(attempt);
               if !delay.is_zero() {
                  tokio::time::sleep(delay).await;
               }
               attempt += 1;
            }
            result => return result,
         }
      }
   }
}
