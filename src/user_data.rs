//! Typed per-transaction key/value storage

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

/// Key into a transaction's user data.
///
/// Keys are identified by their name together with their value type, so two
/// keys with the same name but different types never collide. They are
/// `const`-constructible, which lets collaborators declare them as statics:
///
/// ```
/// use sqlx_txn::UserDataKey;
///
/// static VISITS: UserDataKey<u32> = UserDataKey::new("visits");
/// ```
pub struct UserDataKey<T> {
   name: &'static str,
   _marker: PhantomData<fn() -> T>,
}

impl<T> UserDataKey<T> {
   pub const fn new(name: &'static str) -> Self {
      Self {
         name,
         _marker: PhantomData,
      }
   }

   pub fn name(&self) -> &'static str {
      self.name
   }
}

type Slot = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub(crate) struct UserDataMap {
   entries: Mutex<HashMap<(TypeId, &'static str), Slot>>,
}

impl UserDataMap {
   pub(crate) fn get<T: Send + Sync + 'static>(&self, key: &UserDataKey<T>) -> Option<Arc<T>> {
      let slot = self
         .entries
         .lock()
         .get(&(TypeId::of::<T>(), key.name))
         .cloned()?;
      slot.downcast::<T>().ok()
   }

   pub(crate) fn put<T: Send + Sync + 'static>(
      &self,
      key: &UserDataKey<T>,
      value: T,
   ) -> Option<Arc<T>> {
      let previous = self
         .entries
         .lock()
         .insert((TypeId::of::<T>(), key.name), Arc::new(value))?;
      previous.downcast::<T>().ok()
   }

   pub(crate) fn remove<T: Send + Sync + 'static>(&self, key: &UserDataKey<T>) -> Option<Arc<T>> {
      let previous = self
         .entries
         .lock()
         .remove(&(TypeId::of::<T>(), key.name))?;
      previous.downcast::<T>().ok()
   }

   pub(crate) fn get_or_insert_with<T, F>(&self, key: &UserDataKey<T>, init: F) -> Arc<T>
   where
      T: Send + Sync + 'static,
      F: FnOnce() -> T,
   {
      let mut entries = self.entries.lock();
      let map_key = (TypeId::of::<T>(), key.name);

      if let Some(existing) = entries.get(&map_key).cloned()
         && let Ok(value) = existing.downcast::<T>()
      {
         return value;
      }

      let value = Arc::new(init());
      entries.insert(map_key, value.clone());
      value
   }

   pub(crate) fn len(&self) -> usize {
      self.entries.lock().len()
   }

   pub(crate) fn clear(&self) {
      self.entries.lock().clear();
   }
}
