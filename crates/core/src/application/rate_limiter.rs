// Rate Limiter & Duplicate Detector
//
// Limits are recomputed from raw timestamps on every call, so the rolling
// window heals itself after downtime without a reset job.

use crate::domain::{
    normalize_title, DestinationLimits, DuplicateCheck, PostDecision, PostReason,
    PostingHistoryRecord, RateLimitRecord, RateLimitStatus, DEFAULT_DUPLICATE_WINDOW_MS,
};
use crate::error::Result;
use crate::port::store::{conflict_exhausted, read_as, scan_as};
use crate::port::{
    Collection, CommitOutcome, FieldFilter, IdProvider, TimeProvider, VersionedStore, Write,
    MAX_CONFLICT_RETRIES,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct RateLimiter {
    store: Arc<dyn VersionedStore>,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
    limits: HashMap<String, DestinationLimits>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn VersionedStore>,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
        limits: HashMap<String, DestinationLimits>,
    ) -> Self {
        Self {
            store,
            time_provider,
            id_provider,
            limits,
        }
    }

    pub fn limits(&self, destination: &str) -> Option<DestinationLimits> {
        self.limits.get(destination).copied()
    }

    /// Configured destinations, sorted
    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<_> = self.limits.keys().cloned().collect();
        names.sort();
        names
    }

    async fn load(&self, destination: &str, worker_id: &str) -> Result<Option<RateLimitRecord>> {
        let key = RateLimitRecord::key(destination, worker_id);
        Ok(
            read_as::<RateLimitRecord>(self.store.as_ref(), Collection::RateLimits, &key)
                .await?
                .map(|r| r.value),
        )
    }

    /// Whether `worker_id` may post to `destination` right now
    pub async fn can_post(&self, destination: &str, worker_id: &str) -> Result<PostDecision> {
        let Some(limits) = self.limits(destination) else {
            return Ok(PostDecision::allow(PostReason::Unconfigured, 0));
        };
        let record = self.load(destination, worker_id).await?;
        let decision = limits.evaluate(record.as_ref(), self.time_provider.now_millis());
        if !decision.allowed {
            debug!(
                destination,
                worker_id,
                wait_ms = decision.wait_ms,
                reason = %decision.reason,
                "Post denied by rate limiter"
            );
        }
        Ok(decision)
    }

    /// Append a post timestamp; concurrent writers on the same key are serialized by version checks
    pub async fn record_post(&self, destination: &str, worker_id: &str) -> Result<RateLimitRecord> {
        let key = RateLimitRecord::key(destination, worker_id);
        for _ in 0..MAX_CONFLICT_RETRIES {
            let existing =
                read_as::<RateLimitRecord>(self.store.as_ref(), Collection::RateLimits, &key)
                    .await?;
            let version = existing.as_ref().map(|r| r.version);
            let mut record = existing
                .map(|r| r.value)
                .unwrap_or_else(|| RateLimitRecord::new(destination, worker_id));

            record.record(self.time_provider.now_millis());

            let write = Write::put(Collection::RateLimits, key.clone(), version, &record)?;
            match self.store.commit(vec![write]).await? {
                CommitOutcome::Committed => {
                    info!(
                        destination,
                        worker_id,
                        daily_count = record.daily_count,
                        "Rate limiter: post recorded"
                    );
                    return Ok(record);
                }
                CommitOutcome::Conflict => continue,
            }
        }
        Err(conflict_exhausted(format!("record_post for {}", key)))
    }

    /// Was the same (normalized) title posted to `destination` within the window?
    pub async fn check_duplicate(
        &self,
        title: &str,
        destination: &str,
        window_ms: Option<i64>,
    ) -> Result<DuplicateCheck> {
        let normalized = normalize_title(title);
        let window_ms = window_ms.unwrap_or(DEFAULT_DUPLICATE_WINDOW_MS);
        let now = self.time_provider.now_millis();

        let history = scan_as::<PostingHistoryRecord>(
            self.store.as_ref(),
            Collection::PostingHistory,
            &[
                FieldFilter::eq("normalized_title", normalized.as_str()),
                FieldFilter::eq("destination", destination),
            ],
        )
        .await?;

        Ok(DuplicateCheck::from_matches(
            history
                .iter()
                .map(|r| &r.value)
                .filter(|r| r.matches(&normalized, destination, now, window_ms)),
        ))
    }

    /// Append to the duplicate-detection history
    pub async fn record_posting(
        &self,
        title: &str,
        destination: &str,
        subject_id: &str,
    ) -> Result<PostingHistoryRecord> {
        let record = PostingHistoryRecord::new(
            title,
            destination,
            subject_id,
            self.time_provider.now_millis(),
        );
        let key = self.id_provider.generate_id();
        let write = Write::insert(Collection::PostingHistory, key.clone(), &record)?;
        match self.store.commit(vec![write]).await? {
            CommitOutcome::Committed => Ok(record),
            CommitOutcome::Conflict => Err(crate::error::AppError::Conflict(format!(
                "posting history key {} already exists",
                key
            ))),
        }
    }

    /// Monitoring snapshot for one (destination, worker) pair
    pub async fn status(&self, destination: &str, worker_id: &str) -> Result<RateLimitStatus> {
        let limits = self.limits(destination);
        let record = self.load(destination, worker_id).await?;
        let now = self.time_provider.now_millis();

        let (daily_count, last_post_at, next_available_at) = match &record {
            Some(record) => {
                let in_window = record.in_window(now);
                (
                    in_window.len() as u32,
                    record.last_post_at,
                    limits.map(|l| l.next_available_at(record, now)),
                )
            }
            None => (0, None, None),
        };

        Ok(RateLimitStatus {
            destination: destination.to_string(),
            worker_id: worker_id.to_string(),
            daily_count,
            max_per_day: limits.map(|l| l.max_per_day),
            min_gap_ms: limits.map(|l| l.min_gap_ms),
            last_post_at,
            next_available_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ROLLING_WINDOW_MS;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::time_provider::mocks::ManualTimeProvider;
    use crate::port::InMemoryStore;
    use tokio_test::assert_ok;

    const MINUTE: i64 = 60_000;
    const HOUR: i64 = 60 * MINUTE;
    const START: i64 = 1_000 * HOUR;

    fn limiter() -> (Arc<RateLimiter>, Arc<ManualTimeProvider>) {
        let clock = Arc::new(ManualTimeProvider::new(START));
        let mut limits = HashMap::new();
        limits.insert("facebook".to_string(), DestinationLimits::new(10, 15 * MINUTE));
        limits.insert(
            "craigslist".to_string(),
            DestinationLimits::new(20, 30 * MINUTE),
        );
        let limiter = RateLimiter::new(
            Arc::new(InMemoryStore::new()),
            clock.clone(),
            Arc::new(SequentialIdProvider::new("post")),
            limits,
        );
        (Arc::new(limiter), clock)
    }

    #[tokio::test]
    async fn test_record_then_can_post_within_gap_is_denied() {
        let (limiter, clock) = limiter();

        let before = limiter.can_post("facebook", "w1").await.unwrap();
        assert!(before.allowed);
        assert_eq!(before.reason, PostReason::NoHistory);

        assert_ok!(limiter.record_post("facebook", "w1").await);
        clock.advance(MINUTE);

        let after = limiter.can_post("facebook", "w1").await.unwrap();
        assert_eq!(after.daily_count, before.daily_count + 1);
        assert!(!after.allowed);
        assert_eq!(after.wait_ms, 14 * MINUTE);
    }

    #[tokio::test]
    async fn test_ten_posts_in_two_hours_hits_daily_cap() {
        let (limiter, clock) = limiter();
        let first = START;
        for _ in 0..10 {
            limiter.record_post("facebook", "w1").await.unwrap();
            clock.advance(12 * MINUTE);
        }
        // now = first + 120 min; last post at first + 108 min
        clock.set(first + 2 * HOUR);

        let decision = limiter.can_post("facebook", "w1").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, PostReason::DailyLimit { count: 10, max: 10 });
        assert_eq!(decision.wait_ms, first + ROLLING_WINDOW_MS - (first + 2 * HOUR));
        assert!(decision.reason.to_string().contains("Daily limit"));
    }

    #[tokio::test]
    async fn test_window_self_heals_after_downtime() {
        let (limiter, clock) = limiter();
        for _ in 0..10 {
            limiter.record_post("facebook", "w1").await.unwrap();
            clock.advance(MINUTE);
        }
        clock.advance(ROLLING_WINDOW_MS);

        let decision = limiter.can_post("facebook", "w1").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.daily_count, 0);

        // The next write prunes the stale timestamps
        let record = limiter.record_post("facebook", "w1").await.unwrap();
        assert_eq!(record.post_timestamps.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_record_post_loses_nothing() {
        let (limiter, _clock) = limiter();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.record_post("craigslist", "w1").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let status = limiter.status("craigslist", "w1").await.unwrap();
        assert_eq!(status.daily_count, 8);
    }

    #[tokio::test]
    async fn test_workers_are_limited_independently() {
        let (limiter, _clock) = limiter();
        limiter.record_post("facebook", "w1").await.unwrap();
        assert!(limiter.can_post("facebook", "w2").await.unwrap().allowed);
        assert!(!limiter.can_post("facebook", "w1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unconfigured_destination_is_allowed() {
        let (limiter, _clock) = limiter();
        let decision = limiter.can_post("ebay", "w1").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.reason, PostReason::Unconfigured);
    }

    #[tokio::test]
    async fn test_duplicate_detection() {
        let (limiter, clock) = limiter();
        limiter
            .record_posting("  Oak Dresser ", "facebook", "inv-1")
            .await
            .unwrap();
        clock.advance(HOUR);

        let dup = limiter
            .check_duplicate("oak dresser", "facebook", None)
            .await
            .unwrap();
        assert!(dup.is_duplicate);
        assert_eq!(dup.last_posted_at, Some(START));

        let other_destination = limiter
            .check_duplicate("Oak Dresser", "craigslist", None)
            .await
            .unwrap();
        assert!(!other_destination.is_duplicate);

        let short_window = limiter
            .check_duplicate("Oak Dresser", "facebook", Some(30 * MINUTE))
            .await
            .unwrap();
        assert!(!short_window.is_duplicate);
    }

    #[tokio::test]
    async fn test_status_reports_next_available() {
        let (limiter, clock) = limiter();
        let empty = limiter.status("facebook", "w1").await.unwrap();
        assert_eq!(empty.next_available_at, None);
        assert_eq!(empty.max_per_day, Some(10));

        limiter.record_post("facebook", "w1").await.unwrap();
        clock.advance(5 * MINUTE);

        let status = limiter.status("facebook", "w1").await.unwrap();
        assert_eq!(status.daily_count, 1);
        assert_eq!(status.last_post_at, Some(START));
        assert_eq!(status.next_available_at, Some(START + 15 * MINUTE));
    }
}
