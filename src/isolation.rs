use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level, named as in the SQL standard.
///
/// Backends may support only some of these; asking for an unsupported level
/// fails with [`Error::IsolationUnsupported`](crate::Error::IsolationUnsupported)
/// instead of silently running at a different level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum IsolationLevel {
   ReadUncommitted = 0,
   ReadCommitted = 1,
   RepeatableRead = 2,
   Serializable = 3,
}

impl IsolationLevel {
   pub(crate) fn from_u8(value: u8) -> Self {
      match value {
         0 => IsolationLevel::ReadUncommitted,
         1 => IsolationLevel::ReadCommitted,
         2 => IsolationLevel::RepeatableRead,
         _ => IsolationLevel::Serializable,
      }
   }
}

impl fmt::Display for IsolationLevel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
         IsolationLevel::ReadCommitted => "READ COMMITTED",
         IsolationLevel::RepeatableRead => "REPEATABLE READ",
         IsolationLevel::Serializable => "SERIALIZABLE",
      };
      f.write_str(name)
   }
}
