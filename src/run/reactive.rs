use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt, stream};

use super::{
   CancelGuard, Cleanup, Scope, TransactionBuilder, log_retry, open_scope, resolve_database,
};
use crate::context::{ContextStack, ExecutionContext, TxContext};
use crate::database::Database;
use crate::manager::TransactionOptions;
use crate::transaction::Transaction;
use crate::{Error, Result};

/// Items produced by a reactive transaction scope.
pub type TransactionStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

struct Active<S> {
   // Dropped first, so a cancelled statement frees the connection before
   // the guard rolls back.
   items: Pin<Box<S>>,
   guard: Option<CancelGuard>,
   scope: Scope,
}

enum End {
   Retry,
   Fail(Error),
}

struct Flow<F, S> {
   database: Database,
   options: TransactionOptions,
   stack: ContextStack,
   body: F,
   attempt: u32,
   active: Option<Active<S>>,
   emitted: bool,
   done: bool,
}

impl TransactionBuilder {
   /// Runs the stream returned by `body` in a transaction.
   ///
   /// The transaction begins when the returned stream is first polled and
   /// commits when `body`'s stream ends. An `Err` item rolls back, is
   /// forwarded, and ends the stream. A retryable conflict re-runs `body`
   /// only if no item has been emitted yet. Dropping the stream early rolls
   /// the transaction back.
   ///
   /// `context` locates the outer transaction; pass [`TxContext::new`] at the
   /// top of a pipeline. `body` receives the context of the new transaction
   /// to hand to nested scopes.
   pub fn stream<T, F, S>(self, context: &TxContext, body: F) -> TransactionStream<T>
   where
      T: Send + 'static,
      F: FnMut(TxContext, Arc<Transaction>) -> S + Send + 'static,
      S: Stream<Item = Result<T>> + Send + 'static,
   {
      let stack = context.stack();
      let database = match resolve_database(&stack, self.database.as_ref()) {
         Ok(database) => database,
         Err(e) => return Box::pin(stream::once(async move { Err(e) })),
      };

      let flow = Flow {
         database,
         options: self.options,
         stack,
         body,
         attempt: 1,
         active: None,
         emitted: false,
         done: false,
      };

      Box::pin(stream::unfold(flow, |flow| flow.step()))
   }
}

impl<T, F, S> Flow<F, S>
where
   F: FnMut(TxContext, Arc<Transaction>) -> S,
   S: Stream<Item = Result<T>>,
{
   async fn step(mut self) -> Option<(Result<T>, Self)> {
      loop {
         if self.done {
            return None;
         }

         if self.active.is_none()
            && let Err(e) = self.begin().await
         {
            self.done = true;
            return Some((Err(e), self));
         }

         let Some(active) = self.active.as_mut() else {
            continue;
         };

         let outcome = match active.items.next().await {
            Some(Ok(item)) => {
               self.emitted = true;
               return Some((Ok(item), self));
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
         };

         match self.end(outcome).await {
            Ok(()) => {
               self.done = true;
               return None;
            }
            Err(End::Retry) => continue,
            Err(End::Fail(e)) => {
               self.done = true;
               return Some((Err(e), self));
            }
         }
      }
   }

   async fn begin(&mut self) -> Result<()> {
      let scope = open_scope(&self.stack, &self.database, &self.options)?;
      let guard = CancelGuard::new(&scope, Cleanup::current());

      if let Err(e) = scope.enter().await {
         guard.disarm();
         return Err(e);
      }

      let tx = Arc::clone(scope.tx());
      let context = TxContext::from_stack(self.stack.push(Arc::clone(&tx)));
      let items = Box::pin((self.body)(context, tx));

      self.active = Some(Active {
         items,
         guard: Some(guard),
         scope,
      });
      Ok(())
   }

   async fn end(&mut self, outcome: Result<()>) -> std::result::Result<(), End> {
      let Some(mut active) = self.active.take() else {
         return Ok(());
      };
      // The body's stream is finished; release anything it still holds
      drop(active.items);

      let result = active.scope.finish(outcome).await;
      if let Some(guard) = active.guard.take() {
         guard.disarm();
      }

      let e = match result {
         Ok(()) => return Ok(()),
         Err(e) => e,
      };

      if self.emitted || !active.scope.may_retry(&e, self.attempt) {
         return Err(End::Fail(e));
      }

      let policy = active.scope.retry_policy();
      log_retry(active.scope.tx(), self.attempt, &policy, &e);

      let delay = policy.delay(self.attempt);
      if !delay.is_zero() {
         tokio::time::sleep(delay).await;
      }
      self.attempt += 1;
      Err(End::Retry)
   }
}
