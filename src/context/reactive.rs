use std::sync::Arc;

use super::{ContextStack, ExecutionContext};
use crate::transaction::Transaction;
use crate::{Error, Result};

/// Immutable context threaded explicitly through reactive pipelines.
///
/// Streams may be polled from any thread and interleave freely, so they do
/// not use the thread slot. A [`stream`](crate::TransactionBuilder::stream)
/// body receives the `TxContext` of its transaction and passes it on to any
/// nested `stream` call.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
   stack: ContextStack,
}

impl TxContext {
   /// An empty context, outside any transaction.
   pub fn new() -> Self {
      Self::default()
   }

   pub(crate) fn from_stack(stack: ContextStack) -> Self {
      Self { stack }
   }

   /// The innermost transaction of this context.
   pub fn current_transaction(&self) -> Result<Arc<Transaction>> {
      self.stack.current().cloned().ok_or(Error::NoActiveTransaction)
   }
}

impl ExecutionContext for TxContext {
   fn stack(&self) -> ContextStack {
      self.stack.clone()
   }
}
