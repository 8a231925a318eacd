//! Recording connection source and interceptor shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sqlx_txn::{
   AcquireConfig, ConnectionHandle, ConnectionSource, Database, DatabaseConfig, Dialect, Error,
   Hook, Interceptor, IsolationLevel, PreparedStatement, Result, Row, StatementKind,
   StatementResult, Transaction, WriteQueryResult,
};
use uuid::Uuid;

pub fn init_tracing() {
   let _ = tracing_subscriber::fmt()
      .with_max_level(tracing::Level::DEBUG)
      .with_test_writer()
      .try_init();
}

/// What a mock connection was asked to do. Handles are numbered from 1 in
/// acquisition order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
   Acquire(usize),
   Configure(usize, IsolationLevel, bool),
   Execute(usize, String),
   Commit(usize),
   Rollback(usize),
   Close(usize),
}

/// Failures and delays the mock injects.
#[derive(Debug, Default)]
pub struct Script {
   /// Number of upcoming DML statements that fail with a retryable conflict
   pub conflicts: usize,
   /// Number of upcoming commits that fail with a retryable conflict
   pub commit_conflicts: usize,
   /// Statements containing this text fail with a non-retryable error
   pub fail_sql: Option<String>,
   pub fail_acquire: bool,
   pub fail_rollback: bool,
   /// Applied to every DML statement, after it is logged
   pub delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MockSource {
   log: Arc<Mutex<Vec<Event>>>,
   script: Arc<Mutex<Script>>,
   acquired: Arc<AtomicUsize>,
}

impl MockSource {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn script(&self) -> parking_lot::MutexGuard<'_, Script> {
      self.script.lock()
   }

   pub fn events(&self) -> Vec<Event> {
      self.log.lock().clone()
   }

   /// SQL of every executed statement, in order.
   pub fn statements(&self) -> Vec<String> {
      self
         .events()
         .into_iter()
         .filter_map(|event| match event {
            Event::Execute(_, sql) => Some(sql),
            _ => None,
         })
         .collect()
   }

   pub fn acquired(&self) -> usize {
      self.acquired.load(Ordering::SeqCst)
   }

   pub fn count(&self, wanted: fn(&Event) -> bool) -> usize {
      self.events().iter().filter(|event| wanted(event)).count()
   }

   pub fn clear(&self) {
      self.log.lock().clear();
   }
}

#[async_trait]
impl ConnectionSource for MockSource {
   async fn acquire(&self, config: &AcquireConfig) -> Result<Box<dyn ConnectionHandle>> {
      if self.script.lock().fail_acquire {
         return Err(Error::ConnectionUnavailable {
            database: config.database_name.clone(),
            reason: "scripted acquire failure".into(),
         });
      }

      let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
      self.log.lock().push(Event::Acquire(n));

      Ok(Box::new(MockHandle {
         id: Uuid::new_v4(),
         n,
         log: Arc::clone(&self.log),
         script: Arc::clone(&self.script),
      }))
   }
}

struct MockHandle {
   id: Uuid,
   n: usize,
   log: Arc<Mutex<Vec<Event>>>,
   script: Arc<Mutex<Script>>,
}

impl MockHandle {
   fn push(&self, event: Event) {
      self.log.lock().push(event);
   }
}

#[async_trait]
impl ConnectionHandle for MockHandle {
   fn id(&self) -> Uuid {
      self.id
   }

   async fn configure(&mut self, isolation: IsolationLevel, read_only: bool) -> Result<()> {
      self.push(Event::Configure(self.n, isolation, read_only));
      Ok(())
   }

   async fn execute(&mut self, statement: &PreparedStatement) -> Result<StatementResult> {
      self.push(Event::Execute(self.n, statement.sql.clone()));

      if statement.kind != StatementKind::Control {
         let delay = self.script.lock().delay;
         if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
         }

         let mut script = self.script.lock();
         if script.conflicts > 0 {
            script.conflicts -= 1;
            return Err(Error::RetryableConflict("database is locked".into()));
         }
         if let Some(fragment) = &script.fail_sql
            && statement.sql.contains(fragment.as_str())
         {
            return Err(Error::Other(format!("scripted failure: {}", statement.sql)));
         }
      }

      match statement.kind {
         StatementKind::Query => {
            let mut row = Row::new();
            row.insert("handle".into(), json!(self.n));
            row.insert("sql".into(), json!(statement.sql));
            Ok(StatementResult::Rows(vec![row]))
         }
         StatementKind::Write | StatementKind::Control => {
            Ok(StatementResult::Write(WriteQueryResult {
               rows_affected: 1,
               last_insert_id: self.n as i64,
            }))
         }
      }
   }

   async fn commit(&mut self) -> Result<()> {
      self.push(Event::Commit(self.n));

      let mut script = self.script.lock();
      if script.commit_conflicts > 0 {
         script.commit_conflicts -= 1;
         return Err(Error::RetryableConflict("database is busy".into()));
      }
      Ok(())
   }

   async fn rollback(&mut self) -> Result<()> {
      self.push(Event::Rollback(self.n));

      if self.script.lock().fail_rollback {
         return Err(Error::Other("scripted rollback failure".into()));
      }
      Ok(())
   }

   async fn close(&mut self) -> Result<()> {
      self.push(Event::Close(self.n));
      Ok(())
   }
}

#[derive(Debug, Clone, Copy)]
pub struct MockDialect {
   pub savepoints: bool,
}

impl Dialect for MockDialect {
   fn name(&self) -> &str {
      "mock"
   }

   fn default_isolation_level(&self) -> IsolationLevel {
      IsolationLevel::Serializable
   }

   fn supports_isolation(&self, _level: IsolationLevel) -> bool {
      true
   }

   fn supports_savepoints(&self) -> bool {
      self.savepoints
   }
}

pub fn mock_database(config: DatabaseConfig) -> (Database, MockSource) {
   mock_database_with(config, MockDialect { savepoints: true })
}

pub fn mock_database_with(config: DatabaseConfig, dialect: MockDialect) -> (Database, MockSource) {
   init_tracing();
   let source = MockSource::new();
   let db = Database::register(Arc::new(source.clone()), Arc::new(dialect), config)
      .expect("register mock database");
   (db, source)
}

pub fn blocking_mock_database(config: DatabaseConfig) -> (Database, MockSource) {
   init_tracing();
   let source = MockSource::new();
   let db = Database::register_blocking(
      Arc::new(source.clone()),
      Arc::new(MockDialect { savepoints: true }),
      config,
   )
   .expect("register blocking mock database");
   (db, source)
}

/// Interceptor that records every hook as `"{name}.{hook}@{depth}"`.
pub struct RecordingInterceptor {
   name: String,
   log: Arc<Mutex<Vec<String>>>,
   fail_on: Option<Hook>,
   panic_on: Option<Hook>,
}

impl RecordingInterceptor {
   pub fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
      Self::build(name, log, None, None)
   }

   pub fn failing(name: &str, log: &Arc<Mutex<Vec<String>>>, hook: Hook) -> Arc<Self> {
      Self::build(name, log, Some(hook), None)
   }

   pub fn panicking(name: &str, log: &Arc<Mutex<Vec<String>>>, hook: Hook) -> Arc<Self> {
      Self::build(name, log, None, Some(hook))
   }

   fn build(
      name: &str,
      log: &Arc<Mutex<Vec<String>>>,
      fail_on: Option<Hook>,
      panic_on: Option<Hook>,
   ) -> Arc<Self> {
      Arc::new(Self {
         name: name.to_string(),
         log: Arc::clone(log),
         fail_on,
         panic_on,
      })
   }

   fn record(&self, hook: Hook, tx: &Transaction) -> Result<()> {
      self
         .log
         .lock()
         .push(format!("{}.{}@{}", self.name, hook, tx.depth()));

      if self.panic_on == Some(hook) {
         panic!("{} exploded in {}", self.name, hook);
      }
      if self.fail_on == Some(hook) {
         return Err(Error::Other(format!("{} refused {}", self.name, hook)));
      }
      Ok(())
   }
}

#[async_trait]
impl Interceptor for RecordingInterceptor {
   fn name(&self) -> &str {
      &self.name
   }

   async fn before_commit(&self, tx: &Transaction) -> Result<()> {
      self.record(Hook::BeforeCommit, tx)
   }

   async fn after_commit(&self, tx: &Transaction) -> Result<()> {
      self.record(Hook::AfterCommit, tx)
   }

   async fn before_rollback(&self, tx: &Transaction) -> Result<()> {
      self.record(Hook::BeforeRollback, tx)
   }

   async fn after_rollback(&self, tx: &Transaction) -> Result<()> {
      self.record(Hook::AfterRollback, tx)
   }
}

pub fn hook_log() -> Arc<Mutex<Vec<String>>> {
   Arc::new(Mutex::new(Vec::new()))
}
