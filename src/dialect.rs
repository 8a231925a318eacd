use std::fmt::Debug;

use crate::isolation::IsolationLevel;

/// What the engine needs to know about a database vendor.
///
/// The engine never renders DML; it only asks the dialect for the default
/// isolation level (once, when the database is registered) and for the text
/// of savepoint statements used to nest transactions.
pub trait Dialect: Send + Sync + Debug {
   fn name(&self) -> &str;

   fn default_isolation_level(&self) -> IsolationLevel;

   fn supports_isolation(&self, level: IsolationLevel) -> bool;

   fn supports_savepoints(&self) -> bool {
      true
   }

   fn savepoint(&self, name: &str) -> String {
      format!("SAVEPOINT {name}")
   }

   fn release_savepoint(&self, name: &str) -> String {
      format!("RELEASE SAVEPOINT {name}")
   }

   fn rollback_to_savepoint(&self, name: &str) -> String {
      format!("ROLLBACK TO SAVEPOINT {name}")
   }
}
