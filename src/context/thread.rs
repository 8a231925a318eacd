//! Context slot of the current OS thread

use std::cell::RefCell;

use super::{ContextStack, ExecutionContext};

thread_local! {
   static CURRENT: RefCell<ContextStack> = RefCell::new(ContextStack::new());
}

/// The context of the calling thread.
///
/// Blocking bodies see the stack bound by [`bind`]. Async bodies see the stack
/// a [`TransactionScope`](super::TransactionScope) installs around each poll.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadContext;

impl ExecutionContext for ThreadContext {
   fn stack(&self) -> ContextStack {
      // During thread teardown the slot is gone; report no transaction
      CURRENT
         .try_with(|current| current.borrow().clone())
         .unwrap_or_default()
   }
}

/// Installs `stack` as the thread's context, returning the previous one.
pub(crate) fn replace(stack: ContextStack) -> ContextStack {
   CURRENT
      .try_with(|current| current.replace(stack))
      .unwrap_or_default()
}

/// Restores the thread's previous context when dropped, including when a
/// blocking body unwinds.
#[must_use]
pub(crate) struct ContextGuard {
   previous: Option<ContextStack>,
}

/// Binds `stack` to the calling thread until the guard is dropped.
pub(crate) fn bind(stack: ContextStack) -> ContextGuard {
   ContextGuard {
      previous: Some(replace(stack)),
   }
}

impl Drop for ContextGuard {
   fn drop(&mut self) {
      if let Some(previous) = self.previous.take() {
         let _ = CURRENT.try_with(|current| current.replace(previous));
      }
   }
}
