// Shared fixtures: a fresh file-backed SQLite store per test

#![allow(dead_code)]

use marketpost_core::domain::Subject;
use marketpost_core::port::{Collection, VersionedStore, Write};
use marketpost_infra_sqlite::{create_pool, run_migrations, SqliteRecordStore};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

pub struct TestDb {
    pub pool: SqlitePool,
    pub store: Arc<SqliteRecordStore>,
    path: PathBuf,
}

impl TestDb {
    /// File-backed so several pooled connections really contend
    pub async fn new() -> Self {
        let path = std::env::temp_dir().join(format!("marketpost_it_{}.db", uuid::Uuid::new_v4()));
        let pool = create_pool(&format!("sqlite://{}", path.display()))
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        Self {
            store: Arc::new(SqliteRecordStore::new(pool.clone())),
            pool,
            path,
        }
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", self.path.display(), suffix));
        }
    }
}

pub async fn insert_subject(store: &dyn VersionedStore, id: &str, destinations: &[&str]) -> Subject {
    let subject = Subject::new(
        id,
        format!("Listing {}", id),
        destinations.iter().map(|d| d.to_string()).collect(),
        serde_json::json!({ "sku": id }),
        0,
    )
    .unwrap();
    store
        .commit(vec![Write::insert(Collection::Subjects, id, &subject).unwrap()])
        .await
        .unwrap();
    subject
}
