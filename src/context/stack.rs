use std::fmt;
use std::sync::Arc;

use crate::database::DatabaseId;
use crate::transaction::Transaction;

struct Frame {
   tx: Arc<Transaction>,
   below: Option<Arc<Frame>>,
   depth: usize,
}

/// Persistent stack of active transactions, innermost on top.
///
/// Pushing returns a new stack that shares every frame below with the
/// original, so a snapshot taken by one context is never changed by another.
#[derive(Clone, Default)]
pub struct ContextStack {
   head: Option<Arc<Frame>>,
}

impl ContextStack {
   pub fn new() -> Self {
      Self::default()
   }

   #[must_use]
   pub fn push(&self, tx: Arc<Transaction>) -> Self {
      let depth = self.depth() + 1;
      Self {
         head: Some(Arc::new(Frame {
            tx,
            below: self.head.clone(),
            depth,
         })),
      }
   }

   /// The stack without its top frame. Popping an empty stack yields an
   /// empty stack.
   #[must_use]
   pub fn pop(&self) -> Self {
      Self {
         head: self.head.as_ref().and_then(|frame| frame.below.clone()),
      }
   }

   /// Innermost transaction, whatever its database.
   pub fn current(&self) -> Option<&Arc<Transaction>> {
      self.head.as_ref().map(|frame| &frame.tx)
   }

   /// Innermost transaction on `database`.
   pub fn current_for(&self, database: DatabaseId) -> Option<&Arc<Transaction>> {
      self.iter().find(|tx| tx.database().id() == database)
   }

   pub fn depth(&self) -> usize {
      self.head.as_ref().map_or(0, |frame| frame.depth)
   }

   pub fn is_empty(&self) -> bool {
      self.head.is_none()
   }

   /// Whether both stacks share the same top frame.
   pub fn ptr_eq(&self, other: &Self) -> bool {
      match (&self.head, &other.head) {
         (Some(a), Some(b)) => Arc::ptr_eq(a, b),
         (None, None) => true,
         _ => false,
      }
   }

   /// Transactions from innermost to outermost.
   pub fn iter(&self) -> impl Iterator<Item = &Arc<Transaction>> {
      std::iter::successors(self.head.as_deref(), |frame| frame.below.as_deref())
         .map(|frame| &frame.tx)
   }
}

impl fmt::Debug for ContextStack {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_list()
         .entries(self.iter().map(|tx| tx.id()))
         .finish()
   }
}
