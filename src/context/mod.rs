//! Where the current transaction is looked up
//!
//! Each execution context keeps a [`ContextStack`] of its active
//! transactions. Blocking code uses the calling thread's slot, async code a
//! [`TransactionScope`] that rebinds that slot around every poll, and
//! reactive streams an explicit [`TxContext`] value. Two contexts never see
//! each other's transactions.

mod reactive;
mod stack;
mod task;
pub(crate) mod thread;

use std::sync::Arc;

pub use reactive::TxContext;
pub use stack::ContextStack;
pub use task::{TransactionScope, scoped};
pub use thread::ThreadContext;

use crate::database::DatabaseId;
use crate::transaction::Transaction;
use crate::{Error, Result};

/// A context that can report its active transactions.
pub trait ExecutionContext {
   /// Snapshot of the context's stack.
   fn stack(&self) -> ContextStack;

   /// Innermost transaction, whatever its database.
   fn current(&self) -> Option<Arc<Transaction>> {
      self.stack().current().cloned()
   }

   /// Innermost transaction on `database`.
   fn current_for(&self, database: DatabaseId) -> Option<Arc<Transaction>> {
      self.stack().current_for(database).cloned()
   }
}

/// The innermost transaction of the calling thread or task.
///
/// Fails with [`Error::NoActiveTransaction`] outside any transaction scope.
/// Inside a reactive stream use [`TxContext::current_transaction`] instead.
pub fn current_transaction() -> Result<Arc<Transaction>> {
   ThreadContext.current().ok_or(Error::NoActiveTransaction)
}
