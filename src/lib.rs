//! # sqlx-txn
//!
//! Transactions bound to the execution context that runs them. A body asks
//! for a transaction; code it calls, however deep, finds the same
//! transaction through [`current_transaction`] without it being passed down.
//!
//! ## Core Types
//!
//! - **[`Database`]**: A registered database (connection source, dialect, defaults)
//! - **[`TransactionBuilder`]**: Configures one scope and runs its body
//! - **[`Transaction`]**: The unit of work handed to the body
//! - **[`TransactionManager`]**: Per-database factory and the process-wide registry
//! - **[`Interceptor`]**: Hooks around commit, rollback and statement preparation
//! - **[`WriteCache`]**: Interceptor that defers writes to commit time
//!
//! ## Behaviour
//!
//! - **Three context flavours**: blocking threads ([`TransactionBuilder::run`]),
//!   async tasks ([`TransactionBuilder::run_async`]) and streams
//!   ([`TransactionBuilder::stream`]). Contexts never see each other's transactions.
//! - **Nesting**: a scope opened inside another on the same database runs in a
//!   savepoint (or, with [`NestingPolicy::Shared`], in the outer transaction).
//! - **Retry**: a top-level scope re-runs its body on a fresh connection after a
//!   retryable conflict, up to `max_attempts` times.
//! - **Lazy connections**: nothing is acquired until the first statement.
//!
//! ## Usage
//!
//! ```no_run
//! use sqlx_txn::{Database, DatabaseConfig, current_transaction};
//!
//! async fn record_login(user: i64) -> sqlx_txn::Result<()> {
//!     // Joins whatever transaction the caller is running
//!     let tx = current_transaction()?;
//!     tx.execute("INSERT INTO logins (user_id) VALUES (?)", vec![user.into()])
//!         .await?;
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> sqlx_txn::Result<()> {
//!     let db = Database::connect("app.db", DatabaseConfig::default(), None).await?;
//!
//!     db.transaction()
//!         .run_async(|tx| async move {
//!             tx.execute("UPDATE users SET seen = 1 WHERE id = ?", vec![7.into()])
//!                 .await?;
//!             record_login(7).await
//!         })
//!         .await?;
//!
//!     db.close().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
pub mod context;
mod database;
mod dialect;
mod error;
mod interceptor;
mod isolation;
mod manager;
mod run;
mod sqlite;
mod statement;
mod transaction;
mod user_data;
mod write_cache;

pub use config::{DatabaseConfig, NestingPolicy};
pub use connection::{AcquireConfig, ConnectionHandle, ConnectionSource};
pub use context::{ExecutionContext, TxContext, current_transaction};
pub use database::{Database, DatabaseId};
pub use dialect::Dialect;
pub use error::{Error, Hook, Result};
pub use interceptor::Interceptor;
pub use isolation::IsolationLevel;
pub use manager::{TransactionManager, TransactionOptions};
pub use run::{RetryPolicy, SyncTransaction, TransactionBuilder, TransactionStream, transaction};
pub use sqlite::{SqliteConnection, SqliteDialect, SqliteSource};
pub use statement::{
   Execute, FetchAll, FetchOne, PreparedStatement, Row, Statement, StatementKind,
   StatementResult, WriteQueryResult,
};
pub use transaction::Transaction;
pub use user_data::UserDataKey;
pub use write_cache::{CommittedWrite, CommittedWriteStream, WriteCache, WriteCacheConfig};

pub use sqlx_sqlite_conn_mgr::SqliteDatabaseConfig;
