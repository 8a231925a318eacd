use std::fmt;
use std::time::Duration;

use crate::isolation::IsolationLevel;

/// Result type alias for transaction engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle point at which an interceptor hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
   BeforeCommit,
   AfterCommit,
   BeforeRollback,
   AfterRollback,
   StatementPrepared,
}

impl fmt::Display for Hook {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         Hook::BeforeCommit => "before_commit",
         Hook::AfterCommit => "after_commit",
         Hook::BeforeRollback => "before_rollback",
         Hook::AfterRollback => "after_rollback",
         Hook::StatementPrepared => "on_statement_prepared",
      };
      f.write_str(name)
   }
}

/// Error types for the transaction engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// The connection source could not supply a handle.
   #[error("no connection available for database {database}: {reason}")]
   ConnectionUnavailable { database: String, reason: String },

   /// The backend rejected the requested isolation level.
   #[error("isolation level {level} is not supported by {dialect}")]
   IsolationUnsupported {
      level: IsolationLevel,
      dialect: String,
   },

   /// The backend reported a transient conflict (busy, locked, serialization
   /// failure). Top-level transactions re-run their body on this error.
   #[error("retryable conflict: {0}")]
   RetryableConflict(String),

   /// Any other backend execution failure.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Error from the connection manager.
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_sqlite_conn_mgr::Error),

   /// `current_transaction()` was called outside any transaction scope.
   #[error("no active transaction in the current context")]
   NoActiveTransaction,

   /// An interceptor hook returned an error or panicked.
   #[error("interceptor {interceptor} failed in {hook}: {message}")]
   Interceptor {
      interceptor: String,
      hook: Hook,
      message: String,
   },

   /// A statement ran longer than the transaction's query timeout.
   #[error("statement exceeded the query timeout of {0:?}")]
   QueryTimeout(Duration),

   /// The transaction's connection has already been closed.
   #[error("transaction has already been finalized (committed or rolled back)")]
   TransactionAlreadyFinalized,

   /// A nested transaction asked for settings that differ from its outer
   /// transaction.
   #[error("nested transaction cannot change {setting}: outer uses {outer}, requested {requested}")]
   NestedOverride {
      setting: &'static str,
      outer: String,
      requested: String,
   },

   /// No database with this identity is registered.
   #[error("database {0} is not registered")]
   DatabaseNotRegistered(String),

   /// A database with this identity is already registered.
   #[error("database {0} is already registered")]
   DatabaseAlreadyRegistered(String),

   /// The database still has live top-level transactions.
   #[error("database {database} still has {count} active transaction(s)")]
   TransactionsStillActive { database: String, count: usize },

   /// No database was given and none is registered as default.
   #[error("no database given and no default database is registered")]
   NoDefaultDatabase,

   /// A blocking entry point was used on a database without a blocking runtime.
   #[error("database {0} was not connected for blocking use")]
   NoBlockingRuntime(String),

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Multiple rows returned from a fetch-one statement.
   #[error("fetch_one() query returned {0} rows, expected 0 or 1")]
   MultipleRowsReturned(usize),

   /// A caller-supplied argument is out of range.
   #[error("invalid argument: {0}")]
   InvalidArgument(String),

   /// I/O error when accessing database files.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::ConnectionUnavailable { .. } => "CONNECTION_UNAVAILABLE".to_string(),
         Error::IsolationUnsupported { .. } => "ISOLATION_UNSUPPORTED".to_string(),
         Error::RetryableConflict(_) => "RETRYABLE_CONFLICT".to_string(),
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::ConnectionManager(_) => "CONNECTION_ERROR".to_string(),
         Error::NoActiveTransaction => "NO_ACTIVE_TRANSACTION".to_string(),
         Error::Interceptor { .. } => "INTERCEPTOR_FAILURE".to_string(),
         Error::QueryTimeout(_) => "QUERY_TIMEOUT".to_string(),
         Error::TransactionAlreadyFinalized => "TRANSACTION_ALREADY_FINALIZED".to_string(),
         Error::NestedOverride { .. } => "NESTED_OVERRIDE".to_string(),
         Error::DatabaseNotRegistered(_) => "DATABASE_NOT_REGISTERED".to_string(),
         Error::DatabaseAlreadyRegistered(_) => "DATABASE_ALREADY_REGISTERED".to_string(),
         Error::TransactionsStillActive { .. } => "TRANSACTIONS_STILL_ACTIVE".to_string(),
         Error::NoDefaultDatabase => "NO_DEFAULT_DATABASE".to_string(),
         Error::NoBlockingRuntime(_) => "NO_BLOCKING_RUNTIME".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::MultipleRowsReturned(_) => "MULTIPLE_ROWS_RETURNED".to_string(),
         Error::InvalidArgument(_) => "INVALID_ARGUMENT".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }

   /// Whether re-running the whole transaction body may succeed.
   pub fn is_retryable(&self) -> bool {
      matches!(self, Error::RetryableConflict(_))
   }

   pub(crate) fn interceptor(interceptor: &str, hook: Hook, message: impl fmt::Display) -> Self {
      Error::Interceptor {
         interceptor: interceptor.to_string(),
         hook,
         message: message.to_string(),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_error_code_connection_unavailable() {
      let err = Error::ConnectionUnavailable {
         database: "main".into(),
         reason: "pool timed out".into(),
      };
      assert_eq!(err.error_code(), "CONNECTION_UNAVAILABLE");
      assert!(err.to_string().contains("pool timed out"));
      assert!(!err.is_retryable());
   }

   #[test]
   fn test_error_code_isolation_unsupported() {
      let err = Error::IsolationUnsupported {
         level: IsolationLevel::RepeatableRead,
         dialect: "sqlite".into(),
      };
      assert_eq!(err.error_code(), "ISOLATION_UNSUPPORTED");
      assert!(err.to_string().contains("REPEATABLE READ"));
   }

   #[test]
   fn test_only_conflicts_are_retryable() {
      assert!(Error::RetryableConflict("database is locked".into()).is_retryable());
      assert!(!Error::Sqlx(sqlx::Error::RowNotFound).is_retryable());
      assert!(!Error::QueryTimeout(Duration::from_secs(1)).is_retryable());
      assert!(!Error::NoActiveTransaction.is_retryable());
   }

   #[test]
   fn test_error_code_interceptor() {
      let err = Error::interceptor("Audit", Hook::AfterCommit, "boom");
      assert_eq!(err.error_code(), "INTERCEPTOR_FAILURE");
      assert_eq!(
         err.to_string(),
         "interceptor Audit failed in after_commit: boom"
      );
   }

   #[test]
   fn test_error_code_nested_override() {
      let err = Error::NestedOverride {
         setting: "isolation",
         outer: "SERIALIZABLE".into(),
         requested: "READ UNCOMMITTED".into(),
      };
      assert_eq!(err.error_code(), "NESTED_OVERRIDE");
      assert!(err.to_string().contains("READ UNCOMMITTED"));
   }

   #[test]
   fn test_error_code_multiple_rows_returned() {
      let err = Error::MultipleRowsReturned(5);
      assert_eq!(err.error_code(), "MULTIPLE_ROWS_RETURNED");
      assert!(err.to_string().contains("5 rows"));
   }

   #[test]
   fn test_error_code_sqlx_non_database() {
      // RowNotFound is not a database error, so no SQLite code
      let err = Error::Sqlx(sqlx::Error::RowNotFound);
      assert_eq!(err.error_code(), "SQLX_ERROR");
   }

   #[test]
   fn test_error_code_other() {
      let err = Error::Other("something went wrong".into());
      assert_eq!(err.error_code(), "ERROR");
      assert_eq!(err.to_string(), "something went wrong");
   }
}
