//! One unit of work and the connection it runs on

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::connection::{AcquireConfig, ConnectionHandle, ConnectionSource};
use crate::database::Database;
use crate::dialect::Dialect;
use crate::error::Hook;
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::isolation::IsolationLevel;
use crate::manager::TransactionManager;
use crate::statement::{
   Execute, FetchAll, FetchOne, PreparedStatement, Row, Statement, WriteQueryResult,
};
use crate::user_data::{UserDataKey, UserDataMap};
use crate::{Error, Result};

// ============================================================================
// Connection slot
// ============================================================================

enum SlotState {
   Idle,
   Open(Box<dyn ConnectionHandle>),
   Closed,
}

/// The connection of one top-level transaction, shared with every savepoint
/// transaction nested inside it.
///
/// The handle is acquired on first use and released once, when the top-level
/// transaction is released. Nested transactions run to completion before the
/// outer body resumes, so the lock is never contended in correct use.
pub(crate) struct ConnectionSlot {
   source: Arc<dyn ConnectionSource>,
   dialect: Arc<dyn Dialect>,
   config: AcquireConfig,
   state: tokio::sync::Mutex<SlotState>,
   handle_id: Mutex<Option<Uuid>>,
   // Savepoints of nested scopes that were dropped mid-flight
   abandoned: Mutex<Vec<String>>,
}

pub(crate) struct ConnectionLease<'a> {
   state: tokio::sync::MutexGuard<'a, SlotState>,
}

impl ConnectionLease<'_> {
   pub(crate) fn handle(&mut self) -> Result<&mut dyn ConnectionHandle> {
      match &mut *self.state {
         SlotState::Open(handle) => Ok(handle.as_mut()),
         _ => Err(Error::TransactionAlreadyFinalized),
      }
   }
}

impl ConnectionSlot {
   pub(crate) fn new(
      source: Arc<dyn ConnectionSource>,
      dialect: Arc<dyn Dialect>,
      config: AcquireConfig,
   ) -> Self {
      Self {
         source,
         dialect,
         config,
         state: tokio::sync::Mutex::new(SlotState::Idle),
         handle_id: Mutex::new(None),
         abandoned: Mutex::new(Vec::new()),
      }
   }

   /// Locks the slot, acquiring and configuring a handle if none is open yet.
   pub(crate) async fn lease(&self) -> Result<ConnectionLease<'_>> {
      let mut state = self.state.lock().await;

      if matches!(*state, SlotState::Closed) {
         return Err(Error::TransactionAlreadyFinalized);
      }
      if matches!(*state, SlotState::Idle) {
         *state = SlotState::Open(self.open().await?);
      }

      let mut lease = ConnectionLease { state };
      self.drain_abandoned(&mut lease).await?;
      Ok(lease)
   }

   /// Locks the slot only if a handle is already open. Commit and rollback
   /// use this: a transaction that never ran a statement has nothing to end.
   pub(crate) async fn lease_if_open(&self) -> Result<Option<ConnectionLease<'_>>> {
      let state = self.state.lock().await;

      if matches!(*state, SlotState::Closed) {
         return Err(Error::TransactionAlreadyFinalized);
      }
      if matches!(*state, SlotState::Idle) {
         return Ok(None);
      }

      let mut lease = ConnectionLease { state };
      self.drain_abandoned(&mut lease).await?;
      Ok(Some(lease))
   }

   async fn open(&self) -> Result<Box<dyn ConnectionHandle>> {
      let mut handle = self.source.acquire(&self.config).await?;

      if let Err(e) = handle
         .configure(self.config.isolation, self.config.read_only)
         .await
      {
         if let Err(release_err) = self.source.release(handle).await {
            warn!(
               database = %self.config.database_name,
               error = %release_err,
               "Failed to release connection after configure error"
            );
         }
         return Err(e);
      }

      debug!(
         database = %self.config.database_name,
         connection = %handle.id(),
         isolation = %self.config.isolation,
         read_only = self.config.read_only,
         "Acquired connection"
      );
      *self.handle_id.lock() = Some(handle.id());

      Ok(handle)
   }

   fn abandon_savepoint(&self, name: String) {
      self.abandoned.lock().push(name);
   }

   async fn drain_abandoned(&self, lease: &mut ConnectionLease<'_>) -> Result<()> {
      let names = std::mem::take(&mut *self.abandoned.lock());
      if names.is_empty() {
         return Ok(());
      }

      let handle = lease.handle()?;
      for name in names {
         warn!(
            database = %self.config.database_name,
            savepoint = %name,
            "Rolling back savepoint of an abandoned nested transaction"
         );
         handle
            .execute(&PreparedStatement::control(
               self.dialect.rollback_to_savepoint(&name),
            ))
            .await?;
         handle
            .execute(&PreparedStatement::control(self.dialect.release_savepoint(&name)))
            .await?;
      }

      Ok(())
   }

   /// Releases the handle back to its source. Later leases fail.
   pub(crate) async fn close(&self) -> Result<()> {
      let mut state = self.state.lock().await;

      match std::mem::replace(&mut *state, SlotState::Closed) {
         SlotState::Open(handle) => {
            let id = handle.id();
            self.source.release(handle).await?;
            debug!(database = %self.config.database_name, connection = %id, "Released connection");
            Ok(())
         }
         SlotState::Idle | SlotState::Closed => Ok(()),
      }
   }

   pub(crate) fn handle_id(&self) -> Option<Uuid> {
      *self.handle_id.lock()
   }
}

// ============================================================================
// Transaction
// ============================================================================

pub(crate) struct TransactionParts {
   pub(crate) manager: Arc<TransactionManager>,
   pub(crate) isolation: IsolationLevel,
   pub(crate) read_only: bool,
   pub(crate) max_attempts: u32,
   pub(crate) query_timeout: Option<Duration>,
   pub(crate) outer: Option<Arc<Transaction>>,
   pub(crate) connection: Arc<ConnectionSlot>,
   pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
}

/// One unit of work against one database.
///
/// A top-level transaction owns its connection. A nested transaction (only
/// created under [`NestingPolicy::Savepoint`](crate::NestingPolicy)) shares
/// the connection of its outer transaction and guards its own work with a
/// savepoint.
///
/// Transactions are created by the `run*` entry points of
/// [`TransactionBuilder`](crate::TransactionBuilder) and handed to the body;
/// inside the body, [`current_transaction`](crate::current_transaction)
/// returns the same instance.
pub struct Transaction {
   id: Uuid,
   manager: Arc<TransactionManager>,
   isolation: IsolationLevel,
   read_only: bool,
   max_attempts: u32,
   query_timeout: Option<Duration>,
   outer: Option<Arc<Transaction>>,
   depth: usize,
   savepoint: Option<String>,
   connection: Arc<ConnectionSlot>,
   user_data: UserDataMap,
   interceptors: InterceptorChain,
   failures: Mutex<Vec<Error>>,
   current_statement: Mutex<Option<String>>,
   statement_count: AtomicU64,
   started_at: Instant,
   released: AtomicBool,
   shared_scopes: AtomicUsize,
}

impl Transaction {
   pub(crate) fn new(parts: TransactionParts) -> Self {
      let depth = parts.outer.as_ref().map_or(0, |outer| outer.depth + 1);
      let savepoint = parts.outer.as_ref().map(|_| format!("sqlx_txn_sp_{depth}"));

      Self {
         id: Uuid::new_v4(),
         manager: parts.manager,
         isolation: parts.isolation,
         read_only: parts.read_only,
         max_attempts: parts.max_attempts,
         query_timeout: parts.query_timeout,
         outer: parts.outer,
         depth,
         savepoint,
         connection: parts.connection,
         user_data: UserDataMap::default(),
         interceptors: InterceptorChain::with(parts.interceptors),
         failures: Mutex::new(Vec::new()),
         current_statement: Mutex::new(None),
         statement_count: AtomicU64::new(0),
         started_at: Instant::now(),
         released: AtomicBool::new(false),
         shared_scopes: AtomicUsize::new(0),
      }
   }

   pub fn id(&self) -> Uuid {
      self.id
   }

   pub fn database(&self) -> &Database {
      self.manager.database()
   }

   pub fn manager(&self) -> &Arc<TransactionManager> {
      &self.manager
   }

   pub fn isolation(&self) -> IsolationLevel {
      self.isolation
   }

   pub fn is_read_only(&self) -> bool {
      self.read_only
   }

   pub fn max_attempts(&self) -> u32 {
      self.max_attempts
   }

   pub fn query_timeout(&self) -> Option<Duration> {
      self.query_timeout
   }

   /// The transaction this one is nested in. Fixed at creation.
   pub fn outer(&self) -> Option<&Arc<Transaction>> {
      self.outer.as_ref()
   }

   pub fn is_top_level(&self) -> bool {
      self.outer.is_none()
   }

   /// Nesting depth, 0 for a top-level transaction.
   pub fn depth(&self) -> usize {
      self.depth
   }

   pub fn savepoint_name(&self) -> Option<&str> {
      self.savepoint.as_deref()
   }

   /// Id of the underlying connection handle, once one has been acquired.
   pub fn connection_id(&self) -> Option<Uuid> {
      self.connection.handle_id()
   }

   /// Number of statements run through [`exec`](Self::exec) so far.
   pub fn statement_count(&self) -> u64 {
      self.statement_count.load(Ordering::Relaxed)
   }

   /// SQL of the statement currently executing, if any.
   pub fn current_statement(&self) -> Option<String> {
      self.current_statement.lock().clone()
   }

   pub fn elapsed(&self) -> Duration {
      self.started_at.elapsed()
   }

   // ------------------------------------------------------------------------
   // User data
   // ------------------------------------------------------------------------

   pub fn get_user_data<T: Send + Sync + 'static>(&self, key: &UserDataKey<T>) -> Option<Arc<T>> {
      self.user_data.get(key)
   }

   /// Stores `value` under `key`, returning the previous value.
   pub fn put_user_data<T: Send + Sync + 'static>(
      &self,
      key: &UserDataKey<T>,
      value: T,
   ) -> Option<Arc<T>> {
      self.user_data.put(key, value)
   }

   pub fn remove_user_data<T: Send + Sync + 'static>(
      &self,
      key: &UserDataKey<T>,
   ) -> Option<Arc<T>> {
      self.user_data.remove(key)
   }

   pub fn get_or_create_user_data<T, F>(&self, key: &UserDataKey<T>, init: F) -> Arc<T>
   where
      T: Send + Sync + 'static,
      F: FnOnce() -> T,
   {
      self.user_data.get_or_insert_with(key, init)
   }

   /// Registers an interceptor for this transaction only. It runs after the
   /// database-wide interceptors.
   pub fn register_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
      self.interceptors.push(interceptor);
   }

   /// Registers an interceptor brought by a nested scope that shares this
   /// transaction. Instances already registered are not added twice.
   pub(crate) fn join_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
      if !self.interceptors.push_unique(interceptor) {
         trace!(transaction = %self.id, "Interceptor already registered on shared transaction");
      }
   }

   // ------------------------------------------------------------------------
   // Statements
   // ------------------------------------------------------------------------

   /// Prepares and runs `statement` on this transaction's connection.
   ///
   /// The connection is acquired on the first call. The transaction's query
   /// timeout, if any, bounds the execution.
   pub async fn exec<S>(&self, statement: &S) -> Result<S::Output>
   where
      S: Statement + ?Sized,
   {
      let prepared = statement.prepare(self)?;
      self.fire(Hook::StatementPrepared, Some(&prepared)).await;

      self.statement_count.fetch_add(1, Ordering::Relaxed);
      *self.current_statement.lock() = Some(prepared.sql.clone());

      let started = Instant::now();
      let result = self.run_prepared(statement, &prepared).await;
      let elapsed = started.elapsed();

      *self.current_statement.lock() = None;

      debug!(
         transaction = %self.id,
         elapsed_ms = elapsed.as_millis() as u64,
         ok = result.is_ok(),
         sql = %prepared.sql,
         "Executed statement"
      );
      if let Some(threshold) = self.database().config().long_query_threshold()
         && elapsed >= threshold
      {
         warn!(
            transaction = %self.id,
            elapsed_ms = elapsed.as_millis() as u64,
            sql = %prepared.sql,
            "Long running statement"
         );
      }

      result
   }

   async fn run_prepared<S>(&self, statement: &S, prepared: &PreparedStatement) -> Result<S::Output>
   where
      S: Statement + ?Sized,
   {
      let mut lease = self.connection.lease().await?;
      let conn = lease.handle()?;

      match self.query_timeout {
         Some(limit) => tokio::time::timeout(limit, statement.execute(conn, prepared))
            .await
            .map_err(|_| Error::QueryTimeout(limit))?,
         None => statement.execute(conn, prepared).await,
      }
   }

   pub async fn execute(&self, query: &str, values: Vec<JsonValue>) -> Result<WriteQueryResult> {
      self.exec(&Execute::new(query, values)).await
   }

   pub async fn fetch_all(&self, query: &str, values: Vec<JsonValue>) -> Result<Vec<Row>> {
      self.exec(&FetchAll::new(query, values)).await
   }

   pub async fn fetch_one(&self, query: &str, values: Vec<JsonValue>) -> Result<Option<Row>> {
      self.exec(&FetchOne::new(query, values)).await
   }

   async fn control(&self, sql: String) -> Result<()> {
      trace!(transaction = %self.id, sql = %sql, "Transaction control");
      let mut lease = self.connection.lease().await?;
      lease
         .handle()?
         .execute(&PreparedStatement::control(sql))
         .await?;
      Ok(())
   }

   // ------------------------------------------------------------------------
   // Boundaries
   // ------------------------------------------------------------------------

   /// Commits the work done so far without ending the scope.
   ///
   /// For a top-level transaction the next statement starts a new database
   /// transaction. For a nested transaction the savepoint is released and a
   /// fresh one is set. Hooks fire as for the final commit.
   ///
   /// Called from a nested scope that shares this transaction
   /// ([`NestingPolicy::Shared`](crate::NestingPolicy)), the commit is left
   /// to the outermost scope and this is a no-op.
   pub async fn commit(&self) -> Result<()> {
      if self.in_shared_scope() {
         debug!(transaction = %self.id, "Commit inside a shared nested scope deferred to the outer scope");
         return Ok(());
      }
      self.commit_boundary(true).await
   }

   /// Rolls back the work done so far without ending the scope.
   ///
   /// A nested transaction rolls back to its savepoint and keeps it. A
   /// top-level transaction rolls back everything, including work done in
   /// nested scopes that already completed.
   pub async fn rollback(&self) -> Result<()> {
      self.rollback_boundary(false).await
   }

   /// Marks the start of a nested scope that runs inside this transaction.
   pub(crate) fn enter_shared_scope(&self) {
      self.shared_scopes.fetch_add(1, Ordering::SeqCst);
   }

   pub(crate) fn exit_shared_scope(&self) {
      self.shared_scopes.fetch_sub(1, Ordering::SeqCst);
   }

   fn in_shared_scope(&self) -> bool {
      self.shared_scopes.load(Ordering::SeqCst) > 0
   }

   /// Sets the savepoint of a nested transaction. No-op at top level, where
   /// the connection is acquired lazily.
   pub(crate) async fn begin_scope(&self) -> Result<()> {
      match &self.savepoint {
         Some(name) => self.control(self.dialect().savepoint(name)).await,
         None => Ok(()),
      }
   }

   pub(crate) async fn commit_scope(&self) -> Result<()> {
      self.commit_boundary(false).await
   }

   pub(crate) async fn rollback_scope(&self) -> Result<()> {
      self.rollback_boundary(true).await
   }

   /// Rolls back after `primary` and returns it. A failing rollback is
   /// logged; it never replaces the error that caused it.
   pub(crate) async fn rollback_after(&self, primary: Error) -> Error {
      if let Err(rollback_err) = self.rollback_scope().await {
         error!(
            transaction = %self.id,
            error = %primary,
            rollback_error = %rollback_err,
            "Rollback failed"
         );
      }
      primary
   }

   async fn commit_boundary(&self, reopen: bool) -> Result<()> {
      self.fire(Hook::BeforeCommit, None).await;

      match &self.savepoint {
         Some(name) => {
            self.control(self.dialect().release_savepoint(name)).await?;
            if reopen {
               self.control(self.dialect().savepoint(name)).await?;
            }
         }
         None => {
            if let Some(mut lease) = self.connection.lease_if_open().await? {
               lease.handle()?.commit().await?;
            }
         }
      }

      debug!(transaction = %self.id, depth = self.depth, "Committed");
      self.fire(Hook::AfterCommit, None).await;

      Ok(())
   }

   async fn rollback_boundary(&self, release_savepoint: bool) -> Result<()> {
      self.fire(Hook::BeforeRollback, None).await;

      let result = match &self.savepoint {
         Some(name) => {
            let rolled_back = self.control(self.dialect().rollback_to_savepoint(name)).await;
            if release_savepoint && rolled_back.is_ok() {
               self.control(self.dialect().release_savepoint(name)).await
            } else {
               rolled_back
            }
         }
         None => self.rollback_connection().await,
      };

      debug!(transaction = %self.id, depth = self.depth, ok = result.is_ok(), "Rolled back");
      self.fire(Hook::AfterRollback, None).await;

      result
   }

   async fn rollback_connection(&self) -> Result<()> {
      if let Some(mut lease) = self.connection.lease_if_open().await? {
         lease.handle()?.rollback().await?;
      }
      Ok(())
   }

   /// Ends the transaction's life: the connection goes back to its source if
   /// this is the top-level transaction. Safe to call more than once.
   pub(crate) async fn release(&self) {
      if self.released.swap(true, Ordering::SeqCst) {
         return;
      }

      if let Some(sql) = self.current_statement.lock().take() {
         warn!(transaction = %self.id, sql = %sql, "Releasing transaction with a statement still open");
      }

      if self.is_top_level() {
         if let Err(e) = self.connection.close().await {
            error!(transaction = %self.id, error = %e, "Failed to release connection");
         }
         self.manager.transaction_finished();
      }

      // Anything still cached for this transaction dies with it
      let user_data = self.user_data.len();
      self.user_data.clear();

      debug!(
         transaction = %self.id,
         depth = self.depth,
         statements = self.statement_count(),
         user_data,
         elapsed_ms = self.elapsed().as_millis() as u64,
         "Transaction finished"
      );
   }

   /// Marks a nested transaction whose scope was dropped mid-flight. Its
   /// savepoint is rolled back before the next statement on the connection.
   pub(crate) fn abandon(&self) {
      if self.released.swap(true, Ordering::SeqCst) {
         return;
      }
      if let Some(name) = &self.savepoint {
         self.connection.abandon_savepoint(name.clone());
      }
   }

   pub(crate) async fn fire(&self, hook: Hook, statement: Option<&PreparedStatement>) {
      if self.interceptors.is_empty() {
         return;
      }

      let failures = self.interceptors.fire(hook, self, statement).await;
      if !failures.is_empty() {
         self.failures.lock().extend(failures);
      }
   }

   /// First interceptor failure recorded on this transaction, if any.
   pub(crate) fn take_failure(&self) -> Option<Error> {
      let mut failures = self.failures.lock();
      if failures.is_empty() {
         return None;
      }
      let first = failures.remove(0);
      failures.clear();
      Some(first)
   }

   pub(crate) fn connection_slot(&self) -> &Arc<ConnectionSlot> {
      &self.connection
   }

   fn dialect(&self) -> &dyn Dialect {
      self.connection.dialect.as_ref()
   }
}

impl fmt::Debug for Transaction {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Transaction")
         .field("id", &self.id)
         .field("database", &self.database().name())
         .field("isolation", &self.isolation)
         .field("read_only", &self.read_only)
         .field("depth", &self.depth)
         .field("savepoint", &self.savepoint)
         .finish()
   }
}

impl Drop for Transaction {
   fn drop(&mut self) {
      if !self.released.load(Ordering::SeqCst) {
         debug!(
            "Dropping transaction {} for db {} without release",
            self.id,
            self.database().name()
         );
      }
   }
}
