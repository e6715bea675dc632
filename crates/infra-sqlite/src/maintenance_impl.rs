// SQLite Maintenance Implementation
use async_trait::async_trait;
use marketpost_core::domain::JobStatus;
use marketpost_core::error::{AppError, Result};
use marketpost_core::port::{Collection, Maintenance, MaintenanceStats, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// SQLite maintenance implementation
pub struct SqliteMaintenance {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteMaintenance {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    async fn pragma(&self, name: &str) -> Result<i64> {
        sqlx::query_scalar(&format!("PRAGMA {}", name))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to read {}: {}", name, e)))
    }

    /// Get DB file size in MB
    async fn get_db_size(&self) -> Result<f64> {
        let size_bytes = self.pragma("page_count").await? * self.pragma("page_size").await?;
        Ok(size_bytes as f64 / (1024.0 * 1024.0))
    }

    /// Jobs, optionally only terminal ones
    async fn count_jobs(&self, finished_only: bool) -> Result<i64> {
        let sql = if finished_only {
            "SELECT COUNT(*) FROM records WHERE collection = ? AND deleted = 0 AND json_extract(body, '$.status') IN (?, ?)"
        } else {
            "SELECT COUNT(*) FROM records WHERE collection = ? AND deleted = 0"
        };
        let mut query = sqlx::query_scalar(sql).bind(Collection::Jobs.as_str());
        if finished_only {
            query = query
                .bind(JobStatus::Succeeded.as_str())
                .bind(JobStatus::Failed.as_str());
        }
        query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to count jobs: {}", e)))
    }
}

#[async_trait]
impl Maintenance for SqliteMaintenance {
    async fn vacuum(&self) -> Result<f64> {
        info!("Running VACUUM to optimize database...");

        let size_before = self.get_db_size().await?;

        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("VACUUM failed: {}", e)))?;

        let size_after = self.get_db_size().await?;
        let reclaimed = (size_before - size_after).max(0.0);

        info!(
            size_before_mb = size_before,
            size_after_mb = size_after,
            reclaimed_mb = reclaimed,
            "VACUUM completed"
        );

        Ok(reclaimed)
    }

    async fn gc_finished_jobs(&self, retention_days: i64) -> Result<i64> {
        let cutoff_time = self.time_provider.now_millis() - retention_days * DAY_MS;

        info!(
            retention_days = retention_days,
            cutoff_time = cutoff_time,
            "Running finished job GC"
        );

        let result = sqlx::query(
            r#"
            DELETE FROM records
            WHERE collection = ?
            AND json_extract(body, '$.status') IN (?, ?)
            AND json_extract(body, '$.finished_at') IS NOT NULL
            AND json_extract(body, '$.finished_at') < ?
            AND key NOT IN (
                SELECT json_extract(body, '$.active_job_id') FROM records
                WHERE collection = ?
                AND json_extract(body, '$.active_job_id') IS NOT NULL
            )
            "#,
        )
        .bind(Collection::Jobs.as_str())
        .bind(JobStatus::Succeeded.as_str())
        .bind(JobStatus::Failed.as_str())
        .bind(cutoff_time)
        .bind(Collection::Subjects.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("Job GC failed: {}", e)))?;

        let deleted = result.rows_affected() as i64;
        info!(deleted_jobs = deleted, "Finished job GC completed");
        Ok(deleted)
    }

    async fn prune_posting_history(&self, retention_days: i64) -> Result<i64> {
        let cutoff_time = self.time_provider.now_millis() - retention_days * DAY_MS;

        let result = sqlx::query(
            r#"
            DELETE FROM records
            WHERE collection = ?
            AND json_extract(body, '$.posted_at') < ?
            "#,
        )
        .bind(Collection::PostingHistory.as_str())
        .bind(cutoff_time)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("Posting history prune failed: {}", e)))?;

        let deleted = result.rows_affected() as i64;
        info!(deleted_records = deleted, "Posting history prune completed");
        Ok(deleted)
    }

    async fn get_stats(&self) -> Result<MaintenanceStats> {
        let db_size_mb = self.get_db_size().await?;
        let db_size_bytes = self.pragma("page_count").await? * self.pragma("page_size").await?;

        let job_count = self.count_jobs(false).await?;
        let finished_job_count = self.count_jobs(true).await?;

        let posting_history_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE collection = ? AND deleted = 0")
                .bind(Collection::PostingHistory.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to count history: {}", e)))?;

        let page_count = self.pragma("page_count").await?;
        let freelist_count = self.pragma("freelist_count").await?;
        let fragmentation_percent = if page_count > 0 {
            (freelist_count as f64 / page_count as f64) * 100.0
        } else {
            0.0
        };

        Ok(MaintenanceStats {
            db_size_mb,
            db_size_bytes,
            job_count,
            finished_job_count,
            posting_history_count,
            fragmentation_percent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations, SqliteRecordStore};
    use marketpost_core::domain::{Job, JobOutcome, PostingHistoryRecord, Subject};
    use marketpost_core::port::time_provider::mocks::ManualTimeProvider;
    use marketpost_core::port::{VersionedStore, Write};
    use serde_json::json;

    const NOW: i64 = 100 * DAY_MS;

    async fn setup() -> (SqliteRecordStore, SqliteMaintenance) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let time_provider = Arc::new(ManualTimeProvider::new(NOW));
        (
            SqliteRecordStore::new(pool.clone()),
            SqliteMaintenance::new(pool, time_provider),
        )
    }

    fn finished_job(id: &str, finished_at: i64) -> Job {
        let mut job = Job::new(id, "inv-1", finished_at - 1_000);
        job.claim("worker-1", finished_at - 500, 60_000).unwrap();
        job.finish(
            "worker-1",
            JobOutcome::Succeeded { result: None },
            finished_at,
        )
        .unwrap();
        job
    }

    #[tokio::test]
    async fn test_maintenance_stats() {
        let (store, maintenance) = setup().await;
        store
            .commit(vec![
                Write::insert(Collection::Jobs, "job-1", &finished_job("job-1", NOW)).unwrap(),
                Write::insert(Collection::Jobs, "job-2", &Job::new("job-2", "inv-1", NOW)).unwrap(),
            ])
            .await
            .unwrap();

        let stats = maintenance.get_stats().await.unwrap();
        assert!(stats.db_size_mb > 0.0);
        assert_eq!(stats.job_count, 2);
        assert_eq!(stats.finished_job_count, 1);
        assert_eq!(stats.posting_history_count, 0);
    }

    #[tokio::test]
    async fn test_vacuum() {
        let (_store, maintenance) = setup().await;
        let reclaimed = maintenance.vacuum().await.unwrap();
        assert!(reclaimed >= 0.0);
    }

    #[tokio::test]
    async fn test_gc_finished_jobs_keeps_recent_and_referenced() {
        let (store, maintenance) = setup().await;
        let ten_days_ago = NOW - 10 * DAY_MS;

        let mut subject = Subject::new("inv-1", "Lamp", vec![], json!({}), 0).unwrap();
        subject.attach_job("job-held", 0);

        store
            .commit(vec![
                Write::insert(Collection::Jobs, "job-old", &finished_job("job-old", ten_days_ago))
                    .unwrap(),
                Write::insert(Collection::Jobs, "job-held", &finished_job("job-held", ten_days_ago))
                    .unwrap(),
                Write::insert(Collection::Jobs, "job-new", &finished_job("job-new", NOW)).unwrap(),
                Write::insert(Collection::Subjects, "inv-1", &subject).unwrap(),
            ])
            .await
            .unwrap();

        let deleted = maintenance.gc_finished_jobs(7).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.read(Collection::Jobs, "job-old").await.unwrap().is_none());
        assert!(store.read(Collection::Jobs, "job-held").await.unwrap().is_some());
        assert!(store.read(Collection::Jobs, "job-new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_prune_posting_history() {
        let (store, maintenance) = setup().await;
        let old = PostingHistoryRecord::new("Lamp", "facebook", "inv-1", NOW - 40 * DAY_MS);
        let recent = PostingHistoryRecord::new("Lamp", "facebook", "inv-1", NOW - DAY_MS);
        store
            .commit(vec![
                Write::insert(Collection::PostingHistory, "post-1", &old).unwrap(),
                Write::insert(Collection::PostingHistory, "post-2", &recent).unwrap(),
            ])
            .await
            .unwrap();

        assert_eq!(maintenance.prune_posting_history(30).await.unwrap(), 1);
        assert_eq!(maintenance.get_stats().await.unwrap().posting_history_count, 1);
    }
}
