//! # sqlx-sqlite-conn-mgr
//!
//! A minimal wrapper around SQLx that hands out SQLite connections under a
//! single-writer, many-readers policy.
//!
//! ## Core Types
//!
//! - **[`SqliteDatabase`]**: Database with a read-only pool and a single-connection write pool
//! - **[`SqliteDatabaseConfig`]**: Configuration for connection pool settings
//! - **[`PooledConnection`]**: RAII guard for a checked-out reader or the exclusive writer
//! - **[`Error`]**: Error type for database operations
//!
//! ## Architecture
//!
//! - **Connection pooling**: Separate read-only pool and write pool with a max of 1 connection
//! - **Lazy WAL mode**: Write-Ahead Logging enabled automatically on first write
//! - **Exclusive writes**: Holding the writer serializes all write transactions
//! - **Concurrent reads**: Readers run alongside the writer thanks to WAL
//!
//! ## Usage
//!
//! ```no_run
//! use sqlx_sqlite_conn_mgr::SqliteDatabase;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> sqlx_sqlite_conn_mgr::Result<()> {
//!     let db = SqliteDatabase::connect("example.db", None).await?;
//!
//!     // Multiple connects to the same path return the same instance
//!     let db2 = SqliteDatabase::connect("example.db", None).await?;
//!     assert!(Arc::ptr_eq(&db, &db2));
//!
//!     let mut writer = db.acquire_writer().await?;
//!     sqlx::query("INSERT INTO users (name) VALUES (?)")
//!         .bind("Alice")
//!         .execute(&mut *writer)
//!         .await?;
//!     drop(writer);
//!
//!     db.close().await?;
//!     Ok(())
//! }
//! ```
//!
mod config;
mod database;
mod error;
mod guard;
mod registry;

pub use config::SqliteDatabaseConfig;
pub use database::SqliteDatabase;
pub use error::Error;
pub use guard::PooledConnection;

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
