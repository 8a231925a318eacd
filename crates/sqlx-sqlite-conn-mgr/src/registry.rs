//! Process-wide cache of open databases, keyed by canonical file path

use crate::Result;
use crate::database::SqliteDatabase;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Weak};
use tokio::sync::Mutex;
use tracing::debug;

// Weak so that dropping the last Arc frees the pools even without close()
static DATABASES: LazyLock<Mutex<HashMap<PathBuf, Weak<SqliteDatabase>>>> =
   LazyLock::new(|| Mutex::new(HashMap::new()));

/// In-memory databases are private to the connection that opened them, so
/// they are never shared through the cache.
pub(crate) fn is_memory_database(path: &Path) -> bool {
   let path = path.to_string_lossy();
   path == ":memory:" || path.starts_with("file::memory:") || path.contains("mode=memory")
}

/// Resolves `path` to the key used in the cache. The file may not exist yet,
/// in which case only its parent directory is canonicalized.
fn cache_key(path: &Path) -> Result<PathBuf> {
   if path.exists() {
      return Ok(path.canonicalize()?);
   }

   match (path.parent(), path.file_name()) {
      (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
         Ok(parent.canonicalize()?.join(name))
      }
      _ => Ok(std::env::current_dir()?.join(path)),
   }
}

/// Returns the cached database for `path`, or runs `open` and caches the
/// result. The cache lock is held across `open` so concurrent connects to
/// the same file cannot race each other into two instances.
pub(crate) async fn get_or_open_database<F, Fut>(
   path: &Path,
   open: F,
) -> Result<Arc<SqliteDatabase>>
where
   F: FnOnce() -> Fut,
   Fut: Future<Output = Result<SqliteDatabase>>,
{
   if is_memory_database(path) {
      return Ok(Arc::new(open().await?));
   }

   let key = cache_key(path)?;
   let mut databases = DATABASES.lock().await;

   if let Some(existing) = databases.get(&key).and_then(Weak::upgrade) {
      debug!("Reusing cached database for {}", key.display());
      return Ok(existing);
   }

   let db = Arc::new(open().await?);
   databases.insert(key, Arc::downgrade(&db));

   Ok(db)
}

/// Removes `path` from the cache. Missing entries are not an error.
pub(crate) async fn uncache_database(path: &Path) -> Result<()> {
   if is_memory_database(path) {
      return Ok(());
   }

   let key = cache_key(path)?;
   DATABASES.lock().await.remove(&key);

   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_memory_database_detection() {
      assert!(is_memory_database(Path::new(":memory:")));
      assert!(is_memory_database(Path::new("file::memory:?cache=shared")));
      assert!(is_memory_database(Path::new("file:test?mode=memory")));
      assert!(!is_memory_database(Path::new("app.db")));
   }

   #[test]
   fn test_cache_key_for_missing_file_uses_parent() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("missing.db");

      let key = cache_key(&path).unwrap();

      assert_eq!(key, dir.path().canonicalize().unwrap().join("missing.db"));
   }
}
