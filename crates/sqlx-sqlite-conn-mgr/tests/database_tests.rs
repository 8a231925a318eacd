use sqlx_sqlite_conn_mgr::{Error, SqliteDatabase, SqliteDatabaseConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

async fn create_test_db(name: &str) -> (Arc<SqliteDatabase>, TempDir) {
   let temp_dir = TempDir::new().unwrap();
   let db = SqliteDatabase::connect(temp_dir.path().join(name), None)
      .await
      .unwrap();

   let mut writer = db.acquire_writer().await.unwrap();
   sqlx::query("CREATE TABLE data (id INTEGER PRIMARY KEY, value INTEGER)")
      .execute(&mut *writer)
      .await
      .unwrap();
   drop(writer);

   (db, temp_dir)
}

#[tokio::test]
async fn test_concurrent_readers() {
   let (db, _temp) = create_test_db("readers.db").await;

   let mut readers = Vec::new();
   for _ in 0..3 {
      readers.push(db.acquire_reader().await.unwrap());
   }

   // Three readers checked out at once, all usable
   for reader in readers.iter_mut() {
      let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM data")
         .fetch_one(&mut **reader)
         .await
         .unwrap();
      assert_eq!(count, 0);
   }

   drop(readers);
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_reader_cannot_write() {
   let (db, _temp) = create_test_db("reader_write.db").await;

   let mut reader = db.acquire_reader().await.unwrap();
   let result = sqlx::query("INSERT INTO data (id, value) VALUES (1, 1)")
      .execute(&mut *reader)
      .await;

   assert!(result.is_err(), "read pool connections must be read-only");

   drop(reader);
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_wal_mode_initialization() {
   let (db, _temp) = create_test_db("wal.db").await;
   let mut writer = db.acquire_writer().await.unwrap();

   let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
      .fetch_one(&mut *writer)
      .await
      .unwrap();
   assert_eq!(mode.to_lowercase(), "wal");

   let (sync,): (i32,) = sqlx::query_as("PRAGMA synchronous")
      .fetch_one(&mut *writer)
      .await
      .unwrap();
   assert_eq!(sync, 1, "Sync mode should be NORMAL after first acquire_writer");

   drop(writer);
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_wal_checkpoint_on_close() {
   let (db, temp) = create_test_db("checkpoint.db").await;

   let mut writer = db.acquire_writer().await.unwrap();
   sqlx::query("INSERT INTO data (id, value) VALUES (1, 10)")
      .execute(&mut *writer)
      .await
      .unwrap();
   drop(writer);

   let wal_path = temp.path().join("checkpoint.db-wal");
   assert!(wal_path.exists(), "WAL file should exist after write");

   db.close().await.unwrap();

   if wal_path.exists() {
      let wal_size = std::fs::metadata(&wal_path).unwrap().len();
      assert_eq!(wal_size, 0, "WAL file should be 0 bytes after checkpoint");
   }
}

#[tokio::test]
async fn test_remove_deletes_all_files() {
   let (db, temp) = create_test_db("remove.db").await;
   let db_path = temp.path().join("remove.db");

   assert!(db_path.exists());
   db.remove().await.unwrap();

   assert!(!db_path.exists(), "Database file should be removed");
   assert!(!temp.path().join("remove.db-wal").exists());
   assert!(!temp.path().join("remove.db-shm").exists());
}

#[tokio::test]
async fn test_db_instance_caching() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("cached.db");

   let db1 = SqliteDatabase::connect(&path, None).await.unwrap();
   let db2 = SqliteDatabase::connect(&path, None).await.unwrap();
   assert!(Arc::ptr_eq(&db1, &db2), "Same path should return cached instance");

   drop(db1);
   Arc::clone(&db2).close().await.unwrap();

   // After close the path is uncached and a fresh instance is opened
   let db3 = SqliteDatabase::connect(&path, None).await.unwrap();
   assert!(!Arc::ptr_eq(&db2, &db3));
   db3.remove().await.unwrap();
}

#[tokio::test]
async fn test_write_serialization() {
   let (db, _temp) = create_test_db("serial.db").await;

   let mut writer = db.acquire_writer().await.unwrap();
   sqlx::query("INSERT INTO data (id, value) VALUES (1, 0)")
      .execute(&mut *writer)
      .await
      .unwrap();
   drop(writer);

   let start = Instant::now();
   let mut handles = vec![];

   for _ in 0..3 {
      let db = Arc::clone(&db);
      handles.push(tokio::spawn(async move {
         let mut writer = db.acquire_writer().await.unwrap();
         tokio::time::sleep(Duration::from_millis(10)).await;
         sqlx::query("UPDATE data SET value = value + 1 WHERE id = 1")
            .execute(&mut *writer)
            .await
            .unwrap();
      }));
   }

   for handle in handles {
      handle.await.unwrap();
   }

   let mut reader = db.acquire_reader().await.unwrap();
   let (value,): (i64,) = sqlx::query_as("SELECT value FROM data WHERE id = 1")
      .fetch_one(&mut *reader)
      .await
      .unwrap();
   drop(reader);

   assert_eq!(value, 3, "All 3 writes should have been serialized");
   assert!(
      start.elapsed().as_millis() >= 25,
      "Serialized writes took {}ms, expected at least 25ms",
      start.elapsed().as_millis()
   );

   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_writer_acquire_timeout() {
   let temp_dir = TempDir::new().unwrap();
   let config = SqliteDatabaseConfig {
      acquire_timeout_secs: 1,
      ..Default::default()
   };
   let db = SqliteDatabase::connect(temp_dir.path().join("timeout.db"), Some(config))
      .await
      .unwrap();

   let held = db.acquire_writer().await.unwrap();
   let second = db.acquire_writer().await;

   assert!(matches!(second.unwrap_err(), Error::AcquireTimeout("write")));

   drop(held);
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_discarded_writer_is_not_reused() {
   let (db, _temp) = create_test_db("discard.db").await;

   let mut writer = db.acquire_writer().await.unwrap();
   sqlx::query("BEGIN IMMEDIATE")
      .execute(&mut *writer)
      .await
      .unwrap();
   sqlx::query("INSERT INTO data (value) VALUES (1)")
      .execute(&mut *writer)
      .await
      .unwrap();
   writer.discard().await.unwrap();

   // A fresh writer: the open transaction died with the discarded connection
   let mut writer = db.acquire_writer().await.unwrap();
   sqlx::query("BEGIN IMMEDIATE")
      .execute(&mut *writer)
      .await
      .unwrap();
   let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM data")
      .fetch_one(&mut *writer)
      .await
      .unwrap();
   assert_eq!(count, 0);
   sqlx::query("ROLLBACK").execute(&mut *writer).await.unwrap();
   drop(writer);

   db.remove().await.unwrap();
}
