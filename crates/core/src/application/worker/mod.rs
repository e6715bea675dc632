// Worker - discover, claim, execute, complete

pub mod constants;
mod shutdown;

use constants::*;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::lease::{max_attempts_failure, LeaseManager};
use crate::application::retry::AttemptPolicy;
use crate::domain::{Job, JobFailure, JobId, JobOutcome, JobStatus, WorkerId};
use crate::error::{AppError, Result};
use crate::port::ListingAutomation;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick of this worker was still running
    Skipped,
    /// Nothing claimable (or every claim was lost)
    Idle,
    /// The job was executed but the lease was gone by completion time
    LeaseLost(JobId),
    Completed { job_id: JobId, status: JobStatus },
}

/// Resets the in-flight flag when the tick ends, however it ends
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Worker {
    worker_id: WorkerId,
    leases: Arc<LeaseManager>,
    automation: Arc<dyn ListingAutomation>,
    attempt_policy: AttemptPolicy,
    poll_interval: Duration,
    in_flight: AtomicBool,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        leases: Arc<LeaseManager>,
        automation: Arc<dyn ListingAutomation>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            leases,
            automation,
            attempt_policy: AttemptPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_attempt_policy(mut self, policy: AttemptPolicy) -> Self {
        self.attempt_policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run ticks until shutdown. Busy ticks are followed immediately by another.
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<()> {
        info!(
            worker_id = %self.worker_id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Worker started"
        );
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            let pause = match self.tick().await {
                Ok(TickOutcome::Completed { .. }) | Ok(TickOutcome::LeaseLost(_)) => None,
                Ok(TickOutcome::Idle) | Ok(TickOutcome::Skipped) => Some(self.poll_interval),
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Worker tick failed");
                    Some(ERROR_RECOVERY_SLEEP_DURATION)
                }
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = sleep(pause) => {},
                    _ = shutdown.wait() => {
                        info!(worker_id = %self.worker_id, "Worker interrupted while idle");
                        break;
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "Worker stopped");
        Ok(())
    }

    /// One discover -> claim -> execute -> complete cycle
    ///
    /// Single-flight per worker: a tick that starts while another is running
    /// returns `Skipped` without touching the store.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let Some(_guard) = TickGuard::acquire(&self.in_flight) else {
            debug!(worker_id = %self.worker_id, "Previous tick still running; skipping");
            return Ok(TickOutcome::Skipped);
        };

        for _ in 0..MAX_CLAIM_ATTEMPTS_PER_TICK {
            let Some(candidate) = self.leases.find_claimable().await? else {
                return Ok(TickOutcome::Idle);
            };
            match self.leases.claim(&candidate.id, &self.worker_id).await? {
                Some(job) => return self.process(job).await,
                None => {
                    debug!(job_id = %candidate.id, "Lost claim race; rediscovering");
                }
            }
        }
        Ok(TickOutcome::Idle)
    }

    async fn process(&self, job: Job) -> Result<TickOutcome> {
        if self.attempt_policy.is_exhausted(&job) {
            let failure = max_attempts_failure(&job);
            return self.finish(&job, JobOutcome::failed(failure)).await;
        }

        // The job is already claimed, so every exit from here goes through `finish`
        let subject = match self.leases.subject(&job.subject_id).await {
            Ok(Some(subject)) => subject,
            Ok(None) => {
                let failure = JobFailure::new(
                    "SUBJECT_MISSING",
                    format!("subject {} no longer exists", job.subject_id),
                );
                return self.finish(&job, JobOutcome::failed(failure)).await;
            }
            Err(e) => {
                warn!(job_id = %job.id, subject_id = %job.subject_id, error = %e, "Subject load failed");
                let failure = JobFailure::new(
                    "SUBJECT_LOAD_FAILED",
                    format!("loading subject {}: {}", job.subject_id, e),
                );
                return self.finish(&job, JobOutcome::failed(failure)).await;
            }
        };

        info!(
            job_id = %job.id,
            subject_id = %subject.id,
            attempts = job.attempts,
            "Executing job"
        );

        // Spawned so a panicking delegate is contained in its JoinHandle
        let automation = Arc::clone(&self.automation);
        let job_for_exec = job.clone();
        let handle =
            tokio::task::spawn(async move { automation.run(&job_for_exec, &subject).await });

        let outcome = match handle.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "Execution failed");
                JobOutcome::failed(JobFailure::from(&e))
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "execution task was cancelled".to_string()
                };
                error!(job_id = %job.id, panic = %message, "Execution panicked");
                JobOutcome::failed(JobFailure::new("EXECUTION_PANICKED", message))
            }
        };

        self.finish(&job, outcome).await
    }

    async fn finish(&self, job: &Job, outcome: JobOutcome) -> Result<TickOutcome> {
        match self.leases.complete(&job.id, &self.worker_id, outcome).await {
            Ok(done) => Ok(TickOutcome::Completed {
                job_id: done.id,
                status: done.status,
            }),
            Err(AppError::LeaseLost { job_id }) => {
                warn!(job_id = %job_id, worker_id = %self.worker_id, "Lease lost before completion");
                Ok(TickOutcome::LeaseLost(job_id))
            }
            Err(e) => Err(e),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "execution panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Subject, SubjectStatus};
    use crate::port::automation::mocks::{MockAutomation, MockBehavior};
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::time_provider::mocks::ManualTimeProvider;
    use crate::port::{
        Collection, CommitOutcome, FieldFilter, InMemoryStore, Versioned, VersionedStore, Write,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const LEASE_MS: i64 = 60_000;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualTimeProvider>,
        leases: Arc<LeaseManager>,
    }

    async fn fixture_with_subject() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualTimeProvider::new(1_000));
        let leases = Arc::new(
            LeaseManager::new(
                store.clone(),
                clock.clone(),
                Arc::new(SequentialIdProvider::default()),
            )
            .with_lease_duration(LEASE_MS),
        );
        let subject =
            Subject::new("inv-1", "Lamp", vec!["facebook".into()], json!({}), 0).unwrap();
        store
            .commit(vec![Write::insert(Collection::Subjects, "inv-1", &subject).unwrap()])
            .await
            .unwrap();
        leases.enqueue("inv-1").await.unwrap();
        Fixture {
            store,
            clock,
            leases,
        }
    }

    fn worker(f: &Fixture, id: &str, automation: Arc<MockAutomation>) -> Arc<Worker> {
        Arc::new(Worker::new(id, f.leases.clone(), automation))
    }

    #[tokio::test]
    async fn test_tick_runs_job_to_success() {
        let f = fixture_with_subject().await;
        let automation = Arc::new(MockAutomation::new_success());
        let worker = worker(&f, "worker-a", automation.clone());

        let outcome = worker.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Completed {
                job_id: "job-0001".into(),
                status: JobStatus::Succeeded
            }
        );
        assert_eq!(automation.call_count(), 1);

        let subject = f.leases.subject("inv-1").await.unwrap().unwrap();
        assert_eq!(subject.status, SubjectStatus::Active);
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_panicking_delegate_fails_job_and_clears_lease() {
        let f = fixture_with_subject().await;
        let worker = worker(
            &f,
            "worker-a",
            Arc::new(MockAutomation::new_panic_inducing("selector not found")),
        );

        let outcome = worker.tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Completed {
                status: JobStatus::Failed,
                ..
            }
        ));

        let job = f.leases.job("job-0001").await.unwrap().unwrap();
        let failure = job.last_error.unwrap();
        assert_eq!(failure.code, "EXECUTION_PANICKED");
        assert_eq!(failure.message, "selector not found");
        assert_eq!(job.lease_owner, None);
        assert_eq!(job.lease_expires_at, None);
    }

    /// Fails the next `failures` reads of the Subjects collection
    struct FlakySubjectReads {
        inner: Arc<InMemoryStore>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl VersionedStore for FlakySubjectReads {
        async fn read(
            &self,
            collection: Collection,
            key: &str,
        ) -> Result<Option<Versioned<serde_json::Value>>> {
            if collection == Collection::Subjects
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(AppError::Store("database is locked".into()));
            }
            self.inner.read(collection, key).await
        }

        async fn commit(&self, writes: Vec<Write>) -> Result<CommitOutcome> {
            self.inner.commit(writes).await
        }

        async fn scan(
            &self,
            collection: Collection,
            filters: &[FieldFilter],
        ) -> Result<Vec<Versioned<serde_json::Value>>> {
            self.inner.scan(collection, filters).await
        }
    }

    #[tokio::test]
    async fn test_subject_load_error_fails_claimed_job() {
        let f = fixture_with_subject().await;
        let flaky = Arc::new(FlakySubjectReads {
            inner: f.store.clone(),
            failures: AtomicUsize::new(1),
        });
        let leases = Arc::new(LeaseManager::new(
            flaky,
            f.clock.clone(),
            Arc::new(SequentialIdProvider::default()),
        ));
        let automation = Arc::new(MockAutomation::new_success());
        let worker = Worker::new("worker-a", leases, automation.clone());

        let outcome = worker.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Completed {
                job_id: "job-0001".into(),
                status: JobStatus::Failed
            }
        );
        assert_eq!(automation.call_count(), 0);

        let job = f.leases.job("job-0001").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.unwrap().code, "SUBJECT_LOAD_FAILED");
        assert_eq!(job.lease_owner, None);

        let subject = f.leases.subject("inv-1").await.unwrap().unwrap();
        assert_eq!(subject.status, SubjectStatus::Error);
        assert_eq!(subject.active_job_id, None);
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_execution_error_fails_job() {
        let f = fixture_with_subject().await;
        let worker = worker(&f, "worker-a", Arc::new(MockAutomation::new_error("boom")));

        worker.tick().await.unwrap();
        let job = f.leases.job("job-0001").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.unwrap().code, "EXECUTION_FAILED");
    }

    #[tokio::test]
    async fn test_attempt_policy_dead_letters_without_executing() {
        let f = fixture_with_subject().await;
        // First worker claims and "crashes"
        f.leases.claim("job-0001", "crashed").await.unwrap();
        f.clock.advance(LEASE_MS);

        let automation = Arc::new(MockAutomation::new_success());
        let worker = Worker::new("worker-b", f.leases.clone(), automation.clone())
            .with_attempt_policy(AttemptPolicy::MaxAttempts(1));

        worker.tick().await.unwrap();
        assert_eq!(automation.call_count(), 0);
        let job = f.leases.job("job-0001").await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.unwrap().code, "MAX_ATTEMPTS_EXCEEDED");
    }

    #[tokio::test]
    async fn test_missing_subject_fails_job() {
        let f = fixture_with_subject().await;
        let record = f.store.read(Collection::Subjects, "inv-1").await.unwrap().unwrap();
        f.store
            .commit(vec![Write::delete(Collection::Subjects, "inv-1", record.version)])
            .await
            .unwrap();

        let worker = worker(&f, "worker-a", Arc::new(MockAutomation::new_success()));
        worker.tick().await.unwrap();
        let job = f.leases.job("job-0001").await.unwrap().unwrap();
        assert_eq!(job.last_error.unwrap().code, "SUBJECT_MISSING");
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let f = fixture_with_subject().await;
        let automation = Arc::new(MockAutomation::new(MockBehavior::Slow(
            Duration::from_millis(50),
        )));
        let worker = worker(&f, "worker-a", automation);

        let background = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.tick().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Skipped);
        assert!(matches!(
            background.await.unwrap().unwrap(),
            TickOutcome::Completed { .. }
        ));
        // Guard released
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_lease_stolen_during_execution_reports_lease_lost() {
        let f = fixture_with_subject().await;
        let automation = Arc::new(MockAutomation::new(MockBehavior::Slow(
            Duration::from_millis(50),
        )));
        let slow = worker(&f, "worker-a", automation);

        let background = {
            let slow = slow.clone();
            tokio::spawn(async move { slow.tick().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Lease expires mid-run and another worker reclaims it
        f.clock.advance(LEASE_MS);
        let stolen = f.leases.claim("job-0001", "worker-b").await.unwrap();
        assert!(stolen.is_some());

        assert_eq!(
            background.await.unwrap().unwrap(),
            TickOutcome::LeaseLost("job-0001".into())
        );
        let job = f.leases.job("job-0001").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.lease_owner.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture_with_subject().await;
        let worker = Arc::new(
            Worker::new(
                "worker-a",
                f.leases.clone(),
                Arc::new(MockAutomation::new_success()),
            )
            .with_poll_interval(Duration::from_millis(10)),
        );
        let (sender, token) = shutdown_channel();

        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(token).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        sender.shutdown();
        running.await.unwrap().unwrap();

        let job = f.leases.job("job-0001").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }
}
