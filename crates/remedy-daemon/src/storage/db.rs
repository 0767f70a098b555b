//! Database connection and initialization.

pub use remedy_core::db::DatabaseError;

remedy_core::define_database!(Database, "Task store migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn reopen_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remedy.db");
        drop(Database::open(&path).await.unwrap());
        let db = Database::open(&path).await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM repositories")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}
