//! Context carried by a future across threads

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::thread::{self, ThreadContext};
use super::{ContextStack, ExecutionContext};

/// Future that carries a context stack with it.
///
/// On every poll the stack is installed in the polling thread's slot and the
/// thread's previous stack is put back afterwards, so the body observes its
/// own transactions wherever the runtime resumes it while the worker thread
/// is left untouched between polls. Changes the body makes to the slot during
/// a poll (entering and leaving nested scopes) are carried to the next poll.
pub struct TransactionScope<F> {
   stack: Option<ContextStack>,
   inner: Pin<Box<F>>,
}

impl<F: Future> TransactionScope<F> {
   pub fn new(stack: ContextStack, inner: F) -> Self {
      Self {
         stack: Some(stack),
         inner: Box::pin(inner),
      }
   }
}

// Puts the body's stack back into the scope and restores the thread's
// previous stack, even if the inner poll panics.
struct Rebind<'a> {
   slot: &'a mut Option<ContextStack>,
   previous: Option<ContextStack>,
}

impl Drop for Rebind<'_> {
   fn drop(&mut self) {
      if let Some(previous) = self.previous.take() {
         *self.slot = Some(thread::replace(previous));
      }
   }
}

impl<F: Future> Future for TransactionScope<F> {
   type Output = F::Output;

   fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
      let this = self.get_mut();

      let stack = this.stack.take().unwrap_or_default();
      let _rebind = Rebind {
         previous: Some(thread::replace(stack)),
         slot: &mut this.stack,
      };

      this.inner.as_mut().poll(cx)
   }
}

/// Wraps `future` so it runs with the calling context's transactions, for
/// instance when spawning a task from inside a transaction body.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> sqlx_txn::Result<()> {
/// let handle = tokio::spawn(sqlx_txn::context::scoped(async {
///     let tx = sqlx_txn::current_transaction()?;
///     tx.fetch_all("SELECT * FROM users", vec![]).await
/// }));
/// # Ok(())
/// # }
/// ```
pub fn scoped<F: Future>(future: F) -> TransactionScope<F> {
   TransactionScope::new(ThreadContext.stack(), future)
}
