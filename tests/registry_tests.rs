mod common;

use std::sync::Arc;

use common::mock_database;
use sqlx_txn::context::ThreadContext;
use sqlx_txn::{DatabaseConfig, Error, TransactionManager};

#[tokio::test]
async fn test_registered_database_has_manager() {
   let (db, _source) = mock_database(DatabaseConfig::default().with_name("inventory"));

   assert_eq!(db.name(), "inventory");
   assert!(TransactionManager::is_registered(db.id()));

   let manager = db.manager().unwrap();
   assert_eq!(manager.database(), &db);
   assert!(Arc::ptr_eq(
      &manager,
      &TransactionManager::for_database(db.id()).unwrap()
   ));
}

#[tokio::test]
async fn test_unnamed_database_uses_id() {
   let (db, _source) = mock_database(DatabaseConfig::default());
   assert_eq!(db.name(), db.id().to_string());
}

#[tokio::test]
async fn test_unregister_refused_while_transaction_active() {
   let (db, _source) = mock_database(DatabaseConfig::default());

   db.transaction()
      .run_async(|tx| async move {
         let db = tx.database().clone();
         assert_eq!(tx.manager().active_transactions(), 1);

         // Nested scopes do not count as separate transactions
         sqlx_txn::transaction()
            .run_async(|inner| async move {
               assert_eq!(inner.manager().active_transactions(), 1);
               Ok(())
            })
            .await?;

         match db.unregister() {
            Err(Error::TransactionsStillActive { count, .. }) => assert_eq!(count, 1),
            other => panic!("expected TransactionsStillActive, got {other:?}"),
         }
         Ok(())
      })
      .await
      .unwrap();

   assert_eq!(db.manager().unwrap().active_transactions(), 0);
   db.unregister().unwrap();
   assert!(!TransactionManager::is_registered(db.id()));
}

#[tokio::test]
async fn test_unregistered_database_rejects_transactions() {
   let (db, _source) = mock_database(DatabaseConfig::default());
   db.unregister().unwrap();

   let result = db.transaction().run_async(|_tx| async move { Ok(()) }).await;
   assert!(matches!(result, Err(Error::DatabaseNotRegistered(_))));
   assert!(matches!(db.unregister(), Err(Error::DatabaseNotRegistered(_))));
   assert!(matches!(
      TransactionManager::for_database(db.id()),
      Err(Error::DatabaseNotRegistered(_))
   ));
}

#[tokio::test]
async fn test_close_unregisters() {
   let (db, _source) = mock_database(DatabaseConfig::default());
   let id = db.id();

   db.close().await.unwrap();
   assert!(!TransactionManager::is_registered(id));
}

#[tokio::test]
async fn test_current_or_null_per_database() {
   let (first, _a) = mock_database(DatabaseConfig::default());
   let (second, _b) = mock_database(DatabaseConfig::default());

   let first_manager = first.manager().unwrap();
   let second_manager = second.manager().unwrap();
   assert!(first_manager.current_or_null(&ThreadContext).is_none());

   let second_db = second.clone();
   first
      .transaction()
      .run_async(|tx| {
         let first_manager = Arc::clone(&first_manager);
         let second_manager = Arc::clone(&second_manager);
         let second_db = second_db.clone();
         async move {
            let found = first_manager.current_or_null(&ThreadContext).unwrap();
            assert_eq!(found.id(), tx.id());
            assert!(second_manager.current_or_null(&ThreadContext).is_none());

            second_db
               .transaction()
               .run_async(|other| {
                  let first_manager = Arc::clone(&first_manager);
                  let second_manager = Arc::clone(&second_manager);
                  let outer_id = tx.id();
                  async move {
                     // Each database keeps its own innermost transaction
                     assert_eq!(
                        first_manager.current_or_null(&ThreadContext).unwrap().id(),
                        outer_id
                     );
                     assert_eq!(
                        second_manager.current_or_null(&ThreadContext).unwrap().id(),
                        other.id()
                     );
                     Ok(())
                  }
               })
               .await
         }
      })
      .await
      .unwrap();
}

#[test]
fn test_database_debug_names_database() {
   let (db, _source) = mock_database(DatabaseConfig::default().with_name("debuggable"));
   let rendered = format!("{db:?}");
   assert!(rendered.contains("debuggable"), "{rendered}");
}
