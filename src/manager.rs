//! Per-database transaction factory and the registry that maps databases to it

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::NestingPolicy;
use crate::connection::AcquireConfig;
use crate::context::ExecutionContext;
use crate::database::{Database, DatabaseId};
use crate::interceptor::Interceptor;
use crate::isolation::IsolationLevel;
use crate::transaction::{ConnectionSlot, Transaction, TransactionParts};
use crate::{Error, Result};

/// Per-call settings. `None` fields fall back to the manager's defaults for a
/// top-level transaction, or to the outer transaction for a nested one.
#[derive(Clone, Default)]
pub struct TransactionOptions {
   pub isolation: Option<IsolationLevel>,
   pub read_only: Option<bool>,
   pub max_attempts: Option<u32>,
   pub query_timeout: Option<Duration>,
   pub interceptors: Vec<Arc<dyn Interceptor>>,
}

#[derive(Default)]
struct Registry {
   managers: HashMap<DatabaseId, Arc<TransactionManager>>,
   // Registration order, most recent last
   order: Vec<DatabaseId>,
   explicit_default: Option<DatabaseId>,
}

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(Registry::default()));

/// Creates the transactions of one database.
///
/// There is exactly one manager per registered database. It lives in a
/// process-wide registry from [`Database::register`] until
/// [`Database::unregister`] (or [`Database::close`]).
pub struct TransactionManager {
   database: Database,
   default_isolation: AtomicU8,
   default_max_attempts: AtomicU32,
   active: AtomicUsize,
}

impl TransactionManager {
   fn new(database: Database) -> Self {
      let isolation = database
         .config()
         .default_isolation
         .unwrap_or_else(|| database.dialect().default_isolation_level());
      let max_attempts = database.config().default_max_attempts.max(1);

      Self {
         database,
         default_isolation: AtomicU8::new(isolation as u8),
         default_max_attempts: AtomicU32::new(max_attempts),
         active: AtomicUsize::new(0),
      }
   }

   pub fn database(&self) -> &Database {
      &self.database
   }

   pub fn default_isolation(&self) -> IsolationLevel {
      IsolationLevel::from_u8(self.default_isolation.load(Ordering::Relaxed))
   }

   /// Changes the isolation level of transactions created from now on, in
   /// every context.
   pub fn set_default_isolation(&self, level: IsolationLevel) {
      self.default_isolation.store(level as u8, Ordering::Relaxed);
   }

   pub fn default_max_attempts(&self) -> u32 {
      self.default_max_attempts.load(Ordering::Relaxed)
   }

   pub fn set_default_max_attempts(&self, attempts: u32) -> Result<()> {
      if attempts == 0 {
         return Err(Error::InvalidArgument(
            "max_attempts must be at least 1".to_string(),
         ));
      }
      self.default_max_attempts.store(attempts, Ordering::Relaxed);
      Ok(())
   }

   /// Number of top-level transactions created and not yet released.
   pub fn active_transactions(&self) -> usize {
      self.active.load(Ordering::SeqCst)
   }

   /// Creates a transaction.
   ///
   /// Without `outer`, a top-level transaction with its own (lazily acquired)
   /// connection. With `outer`, depending on the database's nesting policy:
   /// a savepoint transaction sharing the outer connection, or the outer
   /// transaction itself. Nested requests inherit isolation and read-only
   /// from `outer`; asking for different values is an error.
   pub fn new_transaction(
      self: &Arc<Self>,
      options: &TransactionOptions,
      outer: Option<&Arc<Transaction>>,
   ) -> Result<Arc<Transaction>> {
      if options.max_attempts == Some(0) {
         return Err(Error::InvalidArgument(
            "max_attempts must be at least 1".to_string(),
         ));
      }

      match outer {
         None => Ok(self.new_top_level(options)),
         Some(outer) => {
            check_inherited(outer, options)?;

            match self.database.nesting() {
               NestingPolicy::Shared => {
                  for interceptor in &options.interceptors {
                     outer.join_interceptor(Arc::clone(interceptor));
                  }
                  Ok(Arc::clone(outer))
               }
               NestingPolicy::Savepoint => Ok(self.new_nested(options, outer)),
            }
         }
      }
   }

   fn new_top_level(self: &Arc<Self>, options: &TransactionOptions) -> Arc<Transaction> {
      let config = self.database.config();
      let isolation = options
         .isolation
         .unwrap_or_else(|| self.default_isolation());
      let read_only = options.read_only.unwrap_or(config.default_read_only);

      let connection = ConnectionSlot::new(
         Arc::clone(self.database.source()),
         Arc::clone(self.database.dialect()),
         AcquireConfig {
            database: self.database.id(),
            database_name: self.database.name().to_string(),
            isolation,
            read_only,
         },
      );

      self.active.fetch_add(1, Ordering::SeqCst);

      let tx = Arc::new(Transaction::new(TransactionParts {
         manager: Arc::clone(self),
         isolation,
         read_only,
         max_attempts: options
            .max_attempts
            .unwrap_or_else(|| self.default_max_attempts()),
         query_timeout: options.query_timeout.or(config.query_timeout()),
         outer: None,
         connection: Arc::new(connection),
         interceptors: self.interceptors_for(options),
      }));

      debug!(
         transaction = %tx.id(),
         database = %self.database.name(),
         isolation = %isolation,
         read_only,
         "Created transaction"
      );
      tx
   }

   fn new_nested(
      self: &Arc<Self>,
      options: &TransactionOptions,
      outer: &Arc<Transaction>,
   ) -> Arc<Transaction> {
      let tx = Arc::new(Transaction::new(TransactionParts {
         manager: Arc::clone(self),
         isolation: outer.isolation(),
         read_only: outer.is_read_only(),
         // Nested scopes never retry on their own
         max_attempts: 1,
         query_timeout: options.query_timeout.or(outer.query_timeout()),
         outer: Some(Arc::clone(outer)),
         connection: Arc::clone(outer.connection_slot()),
         interceptors: self.interceptors_for(options),
      }));

      debug!(
         transaction = %tx.id(),
         outer = %outer.id(),
         depth = tx.depth(),
         "Created nested transaction"
      );
      tx
   }

   fn interceptors_for(&self, options: &TransactionOptions) -> Vec<Arc<dyn Interceptor>> {
      let mut interceptors = self.database.interceptors();
      interceptors.extend(options.interceptors.iter().cloned());
      interceptors
   }

   /// The innermost transaction of this database in `context`, if any.
   pub fn current_or_null(&self, context: &impl ExecutionContext) -> Option<Arc<Transaction>> {
      context.current_for(self.database.id())
   }

   pub(crate) fn transaction_finished(&self) {
      self.active.fetch_sub(1, Ordering::SeqCst);
   }

   // ------------------------------------------------------------------------
   // Registry
   // ------------------------------------------------------------------------

   pub(crate) fn register(database: Database) -> Result<Arc<Self>> {
      let mut registry = REGISTRY.write();

      if registry.managers.contains_key(&database.id()) {
         return Err(Error::DatabaseAlreadyRegistered(database.name().to_string()));
      }

      let id = database.id();
      let manager = Arc::new(Self::new(database));
      registry.managers.insert(id, Arc::clone(&manager));
      registry.order.push(id);

      debug!(database = %manager.database.name(), id = %id, "Registered database");
      Ok(manager)
   }

   /// Removes a database from the registry. Fails while top-level
   /// transactions on it are still running.
   pub fn unregister(id: DatabaseId) -> Result<()> {
      let mut registry = REGISTRY.write();

      let Some(manager) = registry.managers.get(&id) else {
         return Err(Error::DatabaseNotRegistered(id.to_string()));
      };

      let count = manager.active_transactions();
      if count > 0 {
         warn!(database = %manager.database.name(), count, "Refusing to unregister database with live transactions");
         return Err(Error::TransactionsStillActive {
            database: manager.database.name().to_string(),
            count,
         });
      }

      registry.managers.remove(&id);
      registry.order.retain(|registered| *registered != id);
      if registry.explicit_default == Some(id) {
         registry.explicit_default = None;
      }

      debug!(id = %id, "Unregistered database");
      Ok(())
   }

   pub fn for_database(id: DatabaseId) -> Result<Arc<Self>> {
      REGISTRY
         .read()
         .managers
         .get(&id)
         .cloned()
         .ok_or_else(|| Error::DatabaseNotRegistered(id.to_string()))
   }

   pub fn is_registered(id: DatabaseId) -> bool {
      REGISTRY.read().managers.contains_key(&id)
   }

   /// The database used when none is given and no transaction is current:
   /// the one set with [`set_default_database`](Self::set_default_database),
   /// else the most recently registered.
   pub fn default_database() -> Result<Database> {
      let registry = REGISTRY.read();
      let id = registry
         .explicit_default
         .or_else(|| registry.order.last().copied())
         .ok_or(Error::NoDefaultDatabase)?;

      registry
         .managers
         .get(&id)
         .map(|manager| manager.database.clone())
         .ok_or(Error::NoDefaultDatabase)
   }

   /// Pins the default database. `None` goes back to "most recently
   /// registered".
   pub fn set_default_database(database: Option<&Database>) -> Result<()> {
      let mut registry = REGISTRY.write();

      if let Some(database) = database
         && !registry.managers.contains_key(&database.id())
      {
         return Err(Error::DatabaseNotRegistered(database.name().to_string()));
      }

      registry.explicit_default = database.map(Database::id);
      Ok(())
   }
}

fn check_inherited(outer: &Transaction, options: &TransactionOptions) -> Result<()> {
   if let Some(requested) = options.isolation
      && requested != outer.isolation()
   {
      return Err(Error::NestedOverride {
         setting: "isolation",
         outer: outer.isolation().to_string(),
         requested: requested.to_string(),
      });
   }

   if let Some(requested) = options.read_only
      && requested != outer.is_read_only()
   {
      return Err(Error::NestedOverride {
         setting: "read_only",
         outer: outer.is_read_only().to_string(),
         requested: requested.to_string(),
      });
   }

   Ok(())
}
