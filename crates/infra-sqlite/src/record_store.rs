// SQLite VersionedStore Implementation
//
// Each write is a conditional statement; a commit is one transaction that
// rolls back as soon as any statement matches zero rows. Deletes leave a
// tombstone row so versions never repeat for a key.

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use marketpost_core::error::{AppError, Result};
use marketpost_core::port::{
    Collection, CommitOutcome, Expected, FieldFilter, Versioned, VersionedStore, Write,
};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    key: String,
    version: i64,
    body: String,
}

impl RecordRow {
    fn into_versioned(self) -> Result<Versioned<serde_json::Value>> {
        let value = serde_json::from_str(&self.body).map_err(|e| {
            AppError::Store(format!("Corrupt record body for key {}: {}", self.key, e))
        })?;
        Ok(Versioned {
            key: self.key,
            version: self.version as u64,
            value,
        })
    }
}

/// `last_error.code` -> `$.last_error.code`
fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

#[async_trait]
impl VersionedStore for SqliteRecordStore {
    async fn read(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<Versioned<serde_json::Value>>> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT key, version, body FROM records WHERE collection = ? AND key = ? AND deleted = 0",
        )
        .bind(collection.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(RecordRow::into_versioned).transpose()
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        for write in &writes {
            let affected = match write {
                Write::Put {
                    collection,
                    key,
                    expected: Expected::Absent,
                    value,
                } => sqlx::query(
                    r#"
                    INSERT INTO records (collection, key, version, body)
                    VALUES (?, ?, 1, ?)
                    ON CONFLICT (collection, key) DO UPDATE
                    SET version = records.version + 1, body = excluded.body, deleted = 0
                    WHERE records.deleted = 1
                    "#,
                )
                .bind(collection.as_str())
                .bind(key)
                .bind(value.to_string())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected(),

                Write::Put {
                    collection,
                    key,
                    expected: Expected::Version(version),
                    value,
                } => sqlx::query(
                    r#"
                    UPDATE records SET version = version + 1, body = ?
                    WHERE collection = ? AND key = ? AND version = ? AND deleted = 0
                    "#,
                )
                .bind(value.to_string())
                .bind(collection.as_str())
                .bind(key)
                .bind(*version as i64)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected(),

                Write::Delete {
                    collection,
                    key,
                    version,
                } => sqlx::query(
                    r#"
                    UPDATE records SET version = version + 1, body = 'null', deleted = 1
                    WHERE collection = ? AND key = ? AND version = ? AND deleted = 0
                    "#,
                )
                .bind(collection.as_str())
                .bind(key)
                .bind(*version as i64)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected(),
            };

            if affected == 0 {
                let (collection, key) = write.target();
                debug!(%collection, key, "Commit precondition failed; rolling back");
                tx.rollback().await.map_err(map_sqlx_error)?;
                return Ok(CommitOutcome::Conflict);
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(CommitOutcome::Committed)
    }

    async fn scan(
        &self,
        collection: Collection,
        filters: &[FieldFilter],
    ) -> Result<Vec<Versioned<serde_json::Value>>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT key, version, body FROM records WHERE collection = ");
        query.push_bind(collection.as_str()).push(" AND deleted = 0");
        for filter in filters {
            query
                .push(" AND json_extract(body, ")
                .push_bind(json_path(&filter.field))
                .push(") = ")
                .push_bind(filter.equals.clone());
        }
        query.push(" ORDER BY key");

        let rows = query
            .build_query_as::<RecordRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(RecordRow::into_versioned).collect()
    }
}
