//! Statements the engine sequences without interpreting
//!
//! A [`Statement`] is prepared against the transaction it runs in, then
//! executed against that transaction's connection. The engine only times,
//! counts and logs it.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::connection::ConnectionHandle;
use crate::transaction::Transaction;
use crate::{Error, Result};

/// A decoded row, columns in select order.
pub type Row = IndexMap<String, JsonValue>;

/// What the backend should return for a prepared statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
   /// Returns rows.
   Query,
   /// Returns rows affected and the last insert id.
   Write,
   /// Transaction control (savepoints). Returns nothing of interest.
   Control,
}

/// SQL text plus bind values, ready to run on a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
   pub sql: String,
   pub values: Vec<JsonValue>,
   pub kind: StatementKind,
}

impl PreparedStatement {
   pub fn query(sql: impl Into<String>, values: Vec<JsonValue>) -> Self {
      Self {
         sql: sql.into(),
         values,
         kind: StatementKind::Query,
      }
   }

   pub fn write(sql: impl Into<String>, values: Vec<JsonValue>) -> Self {
      Self {
         sql: sql.into(),
         values,
         kind: StatementKind::Write,
      }
   }

   pub fn control(sql: impl Into<String>) -> Self {
      Self {
         sql: sql.into(),
         values: Vec::new(),
         kind: StatementKind::Control,
      }
   }
}

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID). Zero when not applicable.
   pub last_insert_id: i64,
}

/// Raw outcome of running a [`PreparedStatement`] on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementResult {
   Write(WriteQueryResult),
   Rows(Vec<Row>),
}

impl StatementResult {
   pub fn into_write(self) -> WriteQueryResult {
      match self {
         StatementResult::Write(result) => result,
         StatementResult::Rows(_) => WriteQueryResult::default(),
      }
   }

   pub fn into_rows(self) -> Vec<Row> {
      match self {
         StatementResult::Rows(rows) => rows,
         StatementResult::Write(_) => Vec::new(),
      }
   }
}

/// An opaque unit of work the engine runs inside a transaction.
#[async_trait]
pub trait Statement: Send + Sync {
   type Output: Send;

   fn prepare(&self, tx: &Transaction) -> Result<PreparedStatement>;

   async fn execute(
      &self,
      conn: &mut dyn ConnectionHandle,
      prepared: &PreparedStatement,
   ) -> Result<Self::Output>;
}

/// INSERT / UPDATE / DELETE (or any statement whose rows are not needed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execute {
   pub query: String,
   pub values: Vec<JsonValue>,
}

impl Execute {
   pub fn new(query: impl Into<String>, values: Vec<JsonValue>) -> Self {
      Self {
         query: query.into(),
         values,
      }
   }
}

impl From<(&str, Vec<JsonValue>)> for Execute {
   fn from((query, values): (&str, Vec<JsonValue>)) -> Self {
      Self::new(query, values)
   }
}

impl From<(String, Vec<JsonValue>)> for Execute {
   fn from((query, values): (String, Vec<JsonValue>)) -> Self {
      Self { query, values }
   }
}

#[async_trait]
impl Statement for Execute {
   type Output = WriteQueryResult;

   fn prepare(&self, _tx: &Transaction) -> Result<PreparedStatement> {
      Ok(PreparedStatement::write(&self.query, self.values.clone()))
   }

   async fn execute(
      &self,
      conn: &mut dyn ConnectionHandle,
      prepared: &PreparedStatement,
   ) -> Result<WriteQueryResult> {
      Ok(conn.execute(prepared).await?.into_write())
   }
}

/// SELECT returning every row
#[derive(Debug, Clone, PartialEq)]
pub struct FetchAll {
   pub query: String,
   pub values: Vec<JsonValue>,
}

impl FetchAll {
   pub fn new(query: impl Into<String>, values: Vec<JsonValue>) -> Self {
      Self {
         query: query.into(),
         values,
      }
   }
}

#[async_trait]
impl Statement for FetchAll {
   type Output = Vec<Row>;

   fn prepare(&self, _tx: &Transaction) -> Result<PreparedStatement> {
      Ok(PreparedStatement::query(&self.query, self.values.clone()))
   }

   async fn execute(
      &self,
      conn: &mut dyn ConnectionHandle,
      prepared: &PreparedStatement,
   ) -> Result<Vec<Row>> {
      Ok(conn.execute(prepared).await?.into_rows())
   }
}

/// SELECT returning zero or one row. More than one row is an error.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOne {
   pub query: String,
   pub values: Vec<JsonValue>,
}

impl FetchOne {
   pub fn new(query: impl Into<String>, values: Vec<JsonValue>) -> Self {
      Self {
         query: query.into(),
         values,
      }
   }
}

#[async_trait]
impl Statement for FetchOne {
   type Output = Option<Row>;

   fn prepare(&self, _tx: &Transaction) -> Result<PreparedStatement> {
      Ok(PreparedStatement::query(&self.query, self.values.clone()))
   }

   async fn execute(
      &self,
      conn: &mut dyn ConnectionHandle,
      prepared: &PreparedStatement,
   ) -> Result<Option<Row>> {
      let mut rows = conn.execute(prepared).await?.into_rows();

      match rows.len() {
         0 => Ok(None),
         1 => Ok(rows.pop()),
         count => Err(Error::MultipleRowsReturned(count)),
      }
   }
}
