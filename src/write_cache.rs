//! Deferred writes flushed at commit and published once durable
//!
//! Writes staged with [`WriteCache::stage`] are held on the transaction
//! until it commits:
//!
//! ```text
//!   stage() ──► pending ──before_commit──► flushed ──after_commit──┬──► subscribers (top level)
//!                  │                          │                    └──► outer transaction (nested)
//!                  └──────────after_rollback──┴──► discarded
//! ```
//!
//! `before_commit` runs the pending writes inside the committing
//! transaction, so they commit or roll back together with the rest of its
//! work. Subscribers only ever see writes whose top-level transaction
//! committed.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::interceptor::Interceptor;
use crate::statement::{Execute, WriteQueryResult};
use crate::transaction::Transaction;
use crate::user_data::UserDataKey;
use crate::Result;

/// Configuration for a [`WriteCache`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteCacheConfig {
   /// Capacity of the broadcast channel of committed writes. Subscribers
   /// falling further behind miss events.
   ///
   /// Default: 256
   pub channel_capacity: usize,
}

impl Default for WriteCacheConfig {
   fn default() -> Self {
      Self {
         channel_capacity: 256,
      }
   }
}

/// A staged write whose top-level transaction committed.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedWrite {
   /// Top-level transaction that committed the write.
   pub transaction: Uuid,
   pub database: String,
   pub sql: String,
   pub values: Vec<JsonValue>,
   pub result: WriteQueryResult,
}

#[derive(Default)]
struct Staged {
   pending: Mutex<Vec<Execute>>,
   flushed: Mutex<Vec<(Execute, WriteQueryResult)>>,
}

static STAGED: UserDataKey<Staged> = UserDataKey::new("sqlx_txn::write_cache");

/// Interceptor that defers writes to commit time.
///
/// Register one cache per database with
/// [`Database::register_interceptor`](crate::Database::register_interceptor)
/// so nested transactions hand their flushed writes to the outer one.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use sqlx_txn::{Database, WriteCache, WriteCacheConfig};
///
/// # async fn example(db: Database) -> sqlx_txn::Result<()> {
/// let cache = WriteCache::new(WriteCacheConfig::default());
/// db.register_interceptor(Arc::clone(&cache) as _);
///
/// let mut committed = cache.subscribe();
///
/// let staged = Arc::clone(&cache);
/// db.transaction()
///     .run_async(move |tx| {
///         let cache = Arc::clone(&staged);
///         async move {
///             cache.stage(&tx, ("INSERT INTO audit (event) VALUES (?)", vec!["login".into()]));
///             Ok(())
///         }
///     })
///     .await?;
///
/// let write = committed.recv().await.expect("committed write");
/// assert_eq!(write.result.rows_affected, 1);
/// # Ok(())
/// # }
/// ```
pub struct WriteCache {
   committed_tx: broadcast::Sender<CommittedWrite>,
}

impl WriteCache {
   pub fn new(config: WriteCacheConfig) -> Arc<Self> {
      let (committed_tx, _) = broadcast::channel(config.channel_capacity.max(1));
      Arc::new(Self { committed_tx })
   }

   /// Defers `statement` until `tx` commits.
   pub fn stage(&self, tx: &Transaction, statement: impl Into<Execute>) {
      let statement = statement.into();
      trace!(transaction = %tx.id(), sql = %statement.query, "Staging write");
      staged(tx).pending.lock().push(statement);
   }

   /// Number of writes staged on `tx` and not flushed yet.
   pub fn pending(&self, tx: &Transaction) -> usize {
      tx.get_user_data(&STAGED)
         .map_or(0, |staged| staged.pending.lock().len())
   }

   pub fn subscribe(&self) -> broadcast::Receiver<CommittedWrite> {
      self.committed_tx.subscribe()
   }

   pub fn stream(&self) -> CommittedWriteStream {
      CommittedWriteStream::new(self.subscribe())
   }
}

fn staged(tx: &Transaction) -> Arc<Staged> {
   tx.get_or_create_user_data(&STAGED, Staged::default)
}

#[async_trait]
impl Interceptor for WriteCache {
   fn name(&self) -> &str {
      "write_cache"
   }

   async fn before_commit(&self, tx: &Transaction) -> Result<()> {
      let Some(staged) = tx.get_user_data(&STAGED) else {
         return Ok(());
      };

      let pending = std::mem::take(&mut *staged.pending.lock());
      if pending.is_empty() {
         return Ok(());
      }

      debug!(transaction = %tx.id(), writes = pending.len(), "Flushing staged writes");
      for statement in pending {
         let result = tx.exec(&statement).await?;
         staged.flushed.lock().push((statement, result));
      }

      Ok(())
   }

   async fn after_commit(&self, tx: &Transaction) -> Result<()> {
      let Some(own) = tx.get_user_data(&STAGED) else {
         return Ok(());
      };

      let flushed = std::mem::take(&mut *own.flushed.lock());
      if flushed.is_empty() {
         return Ok(());
      }

      // Not durable until the top-level transaction commits
      if let Some(outer) = tx.outer() {
         staged(outer).flushed.lock().extend(flushed);
         return Ok(());
      }

      for (statement, result) in flushed {
         // No receivers is fine
         let _ = self.committed_tx.send(CommittedWrite {
            transaction: tx.id(),
            database: tx.database().name().to_string(),
            sql: statement.query,
            values: statement.values,
            result,
         });
      }

      Ok(())
   }

   async fn after_rollback(&self, tx: &Transaction) -> Result<()> {
      if let Some(staged) = tx.get_user_data(&STAGED) {
         let discarded = staged.pending.lock().len() + staged.flushed.lock().len();
         staged.pending.lock().clear();
         staged.flushed.lock().clear();

         if discarded > 0 {
            debug!(transaction = %tx.id(), writes = discarded, "Discarded staged writes");
         }
      }
      Ok(())
   }
}

/// Stream of committed writes.
///
/// A subscriber that falls behind the channel capacity skips the missed
/// writes with a warning.
pub struct CommittedWriteStream {
   inner: BroadcastStream<CommittedWrite>,
}

impl CommittedWriteStream {
   pub fn new(rx: broadcast::Receiver<CommittedWrite>) -> Self {
      Self {
         inner: BroadcastStream::new(rx),
      }
   }
}

impl Stream for CommittedWriteStream {
   type Item = CommittedWrite;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      loop {
         match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(write))) => return Poll::Ready(Some(write)),
            Poll::Ready(Some(Err(err))) => {
               warn!(error = %err, "Committed write stream lagged; increase channel_capacity");
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
         }
      }
   }
}
