mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Event, mock_database};
use futures::StreamExt;
use serde_json::json;
use sqlx_txn::{
   DatabaseConfig, Error, Hook, WriteCache, WriteCacheConfig, WriteQueryResult, transaction,
};
use tokio::sync::broadcast::error::TryRecvError;

fn cache_for(db: &sqlx_txn::Database) -> Arc<WriteCache> {
   let cache = WriteCache::new(WriteCacheConfig::default());
   db.register_interceptor(Arc::clone(&cache) as _);
   cache
}

#[tokio::test]
async fn test_staged_writes_flush_before_commit_and_publish_after() {
   let (db, source) = mock_database(DatabaseConfig::default());
   let cache = cache_for(&db);
   let mut committed = cache.subscribe();

   let tx_id = db
      .transaction()
      .run_async(|tx| {
         let cache = Arc::clone(&cache);
         async move {
            tx.execute("UPDATE accounts SET balance = 0", vec![]).await?;
            cache.stage(&tx, ("INSERT INTO audit VALUES (?)", vec![json!("a")]));
            cache.stage(&tx, ("INSERT INTO audit VALUES (?)", vec![json!("b")]));
            assert_eq!(cache.pending(&tx), 2);

            // Nothing staged reaches the connection before commit
            assert_eq!(tx.statement_count(), 1);
            Ok(tx.id())
         }
      })
      .await
      .unwrap();

   assert_eq!(
      &source.events()[2..],
      &[
         Event::Execute(1, "UPDATE accounts SET balance = 0".into()),
         Event::Execute(1, "INSERT INTO audit VALUES (?)".into()),
         Event::Execute(1, "INSERT INTO audit VALUES (?)".into()),
         Event::Commit(1),
         Event::Close(1),
      ]
   );

   let first = committed.recv().await.unwrap();
   let second = committed.recv().await.unwrap();
   assert_eq!(first.transaction, tx_id);
   assert_eq!(first.database, db.name());
   assert_eq!(first.values, vec![json!("a")]);
   assert_eq!(second.values, vec![json!("b")]);
   assert_eq!(
      first.result,
      WriteQueryResult {
         rows_affected: 1,
         last_insert_id: 1,
      }
   );
   assert!(matches!(committed.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_rollback_discards_staged_writes() {
   let (db, source) = mock_database(DatabaseConfig::default());
   let cache = cache_for(&db);
   let mut committed = cache.subscribe();

   let result = db
      .transaction()
      .run_async(|tx| {
         let cache = Arc::clone(&cache);
         async move {
            tx.execute("UPDATE accounts SET balance = 0", vec![]).await?;
            cache.stage(&tx, ("INSERT INTO audit VALUES (1)", vec![]));
            Err::<(), _>(Error::Other("changed my mind".into()))
         }
      })
      .await;

   assert!(result.is_err());
   assert_eq!(source.statements(), vec!["UPDATE accounts SET balance = 0"]);
   assert!(matches!(committed.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_nested_writes_publish_with_outer_commit() {
   let (db, source) = mock_database(DatabaseConfig::default());
   let cache = cache_for(&db);
   let mut committed = cache.subscribe();

   let outer_id = db
      .transaction()
      .run_async(|outer| {
         let cache = Arc::clone(&cache);
         async move {
            let staging = Arc::clone(&cache);
            transaction()
               .run_async(move |inner| {
                  let cache = Arc::clone(&staging);
                  async move {
                     cache.stage(&inner, ("INSERT INTO audit VALUES (1)", vec![]));
                     Ok(())
                  }
               })
               .await?;

            // Flushed inside the savepoint, held by the outer transaction
            assert_eq!(cache.pending(&outer), 0);
            Ok(outer.id())
         }
      })
      .await
      .unwrap();

   assert_eq!(
      source.statements(),
      vec![
         "SAVEPOINT sqlx_txn_sp_1",
         "INSERT INTO audit VALUES (1)",
         "RELEASE SAVEPOINT sqlx_txn_sp_1",
      ]
   );

   let write = committed.recv().await.unwrap();
   assert_eq!(write.transaction, outer_id);
   assert_eq!(write.sql, "INSERT INTO audit VALUES (1)");
   assert!(matches!(committed.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_outer_rollback_discards_nested_writes() {
   let (db, _source) = mock_database(DatabaseConfig::default());
   let cache = cache_for(&db);
   let mut committed = cache.subscribe();

   let result = db
      .transaction()
      .run_async(|_outer| {
         let cache = Arc::clone(&cache);
         async move {
            transaction()
               .run_async(move |inner| {
                  let cache = Arc::clone(&cache);
                  async move {
                     cache.stage(&inner, ("INSERT INTO audit VALUES (1)", vec![]));
                     Ok(())
                  }
               })
               .await?;
            Err::<(), _>(Error::Other("outer failed".into()))
         }
      })
      .await;

   assert!(result.is_err());
   assert!(matches!(committed.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_failed_flush_is_reported() {
   let (db, source) = mock_database(DatabaseConfig::default());
   source.script().fail_sql = Some("audit".into());
   let cache = cache_for(&db);
   let mut committed = cache.subscribe();

   let result = db
      .transaction()
      .run_async(|tx| {
         let cache = Arc::clone(&cache);
         async move {
            cache.stage(&tx, ("INSERT INTO audit VALUES (1)", vec![]));
            Ok(())
         }
      })
      .await;

   match result {
      Err(Error::Interceptor {
         interceptor, hook, ..
      }) => {
         assert_eq!(interceptor, "write_cache");
         assert_eq!(hook, Hook::BeforeCommit);
      }
      other => panic!("expected flush failure, got {other:?}"),
   }
   assert!(matches!(committed.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_committed_write_stream() {
   let (db, _source) = mock_database(DatabaseConfig::default());
   let cache = cache_for(&db);
   let mut stream = cache.stream();

   for n in 0..3 {
      db.transaction()
         .run_async(|tx| {
            let cache = Arc::clone(&cache);
            async move {
               cache.stage(&tx, (format!("INSERT INTO audit VALUES ({n})"), vec![]));
               Ok(())
            }
         })
         .await
         .unwrap();
   }

   for n in 0..3 {
      let write = tokio::time::timeout(Duration::from_secs(1), stream.next())
         .await
         .unwrap()
         .unwrap();
      assert_eq!(write.sql, format!("INSERT INTO audit VALUES ({n})"));
   }
}
