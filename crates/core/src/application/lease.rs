// Lease Manager: enqueue, discovery, claim and completion of jobs
//
// Every operation is a read-check-commit loop over the VersionedStore, so
// correctness across worker processes rests on the store's version checks
// alone. No in-process locks are taken here.

use crate::domain::{Job, JobFailure, JobId, JobOutcome, JobStatus, Subject, SubjectStatus};
use crate::error::{AppError, Result};
use crate::port::store::{conflict_exhausted, read_as, scan_as, Versioned};
use crate::port::{
    Collection, CommitOutcome, FieldFilter, IdProvider, TimeProvider, VersionedStore, Write,
    MAX_CONFLICT_RETRIES,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default lease duration (15 minutes): longer than one posting run
pub const DEFAULT_LEASE_DURATION_MS: i64 = 15 * 60 * 1000;

/// Result of an enqueue request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new queued job was created
    Enqueued(JobId),
    /// The subject already has a live job
    AlreadyActive(JobId),
    /// The subject is not in the triggering state
    NotTriggered(SubjectStatus),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::AlreadyActive(id) => Some(id),
            EnqueueOutcome::NotTriggered(_) => None,
        }
    }
}

pub struct LeaseManager {
    store: Arc<dyn VersionedStore>,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
    lease_duration_ms: i64,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn VersionedStore>,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            store,
            time_provider,
            id_provider,
            lease_duration_ms: DEFAULT_LEASE_DURATION_MS,
        }
    }

    pub fn with_lease_duration(mut self, lease_duration_ms: i64) -> Self {
        self.lease_duration_ms = lease_duration_ms;
        self
    }

    pub fn lease_duration_ms(&self) -> i64 {
        self.lease_duration_ms
    }

    /// Turn a pending subject into a queued job (idempotent under concurrent triggers)
    ///
    /// # Errors
    /// - AppError::NotFound if the subject does not exist
    /// - AppError::Conflict if the loop kept losing races
    pub async fn enqueue(&self, subject_id: &str) -> Result<EnqueueOutcome> {
        self.enqueue_inner(subject_id, false).await
    }

    async fn enqueue_inner(&self, subject_id: &str, force: bool) -> Result<EnqueueOutcome> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Versioned {
                version,
                value: mut subject,
                ..
            } = read_as::<Subject>(self.store.as_ref(), Collection::Subjects, subject_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("subject {}", subject_id)))?;

            if let Some(live) = self.live_job_of(&subject).await? {
                debug!(subject_id, job_id = %live, "Subject already has a live job");
                return Ok(EnqueueOutcome::AlreadyActive(live));
            }

            if !force && !subject.is_triggered() {
                return Ok(EnqueueOutcome::NotTriggered(subject.status));
            }

            if let Some(dangling) = &subject.active_job_id {
                warn!(subject_id, job_id = %dangling, "Overwriting dangling active job reference");
            }

            let now = self.time_provider.now_millis();
            let job = Job::new(self.id_provider.generate_id(), subject_id, now);
            subject.attach_job(&job.id, now);

            let writes = vec![
                Write::insert(Collection::Jobs, job.id.clone(), &job)?,
                Write::update(Collection::Subjects, subject_id, version, &subject)?,
            ];
            match self.store.commit(writes).await? {
                CommitOutcome::Committed => {
                    info!(subject_id, job_id = %job.id, "Job enqueued");
                    return Ok(EnqueueOutcome::Enqueued(job.id));
                }
                CommitOutcome::Conflict => {
                    debug!(subject_id, "Enqueue lost a race, retrying");
                }
            }
        }
        Err(conflict_exhausted(format!("enqueue of subject {}", subject_id)))
    }

    /// Id of the subject's live job; a reference to a missing or terminal job counts as none
    async fn live_job_of(&self, subject: &Subject) -> Result<Option<JobId>> {
        let Some(job_id) = &subject.active_job_id else {
            return Ok(None);
        };
        let job = self.job(job_id).await?;
        Ok(job.filter(Job::is_live).map(|j| j.id))
    }

    /// Oldest queued job, else the running job whose lease expired first
    pub async fn find_claimable(&self) -> Result<Option<Job>> {
        let queued = self.jobs_with_status(JobStatus::Queued).await?;
        if let Some(job) = queued
            .into_iter()
            .min_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
        {
            return Ok(Some(job));
        }

        let now = self.time_provider.now_millis();
        let expired = self
            .jobs_with_status(JobStatus::Running)
            .await?
            .into_iter()
            .filter(|job| job.is_lease_expired(now))
            .min_by(|a, b| {
                (a.lease_expires_at.unwrap_or(i64::MIN), &a.id)
                    .cmp(&(b.lease_expires_at.unwrap_or(i64::MIN), &b.id))
            });
        if let Some(job) = &expired {
            info!(
                job_id = %job.id,
                previous_owner = ?job.lease_owner,
                attempts = job.attempts,
                "Found job with expired lease"
            );
        }
        Ok(expired)
    }

    /// Take the lease on `job_id` for `owner`
    ///
    /// Returns `None` if the job is no longer claimable (another worker won).
    pub async fn claim(&self, job_id: &str, owner: &str) -> Result<Option<Job>> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(Versioned {
                version,
                value: mut job,
                ..
            }) = read_as::<Job>(self.store.as_ref(), Collection::Jobs, job_id).await?
            else {
                return Ok(None);
            };

            let now = self.time_provider.now_millis();
            if !job.is_claimable(now) {
                debug!(job_id, status = %job.status, "Job no longer claimable");
                return Ok(None);
            }
            job.claim(owner, now, self.lease_duration_ms)?;

            let write = Write::update(Collection::Jobs, job_id, version, &job)?;
            match self.store.commit(vec![write]).await? {
                CommitOutcome::Committed => {
                    info!(
                        job_id,
                        worker_id = owner,
                        attempts = job.attempts,
                        lease_expires_at = ?job.lease_expires_at,
                        "Job claimed"
                    );
                    return Ok(Some(job));
                }
                CommitOutcome::Conflict => continue,
            }
        }
        Err(conflict_exhausted(format!("claim of job {}", job_id)))
    }

    /// Record the terminal outcome and release the lease
    ///
    /// The subject's back-reference is cleared in the same commit and its
    /// status becomes `active` or `error`.
    ///
    /// # Errors
    /// - AppError::LeaseLost if `owner` no longer holds the lease
    pub async fn complete(&self, job_id: &str, owner: &str, outcome: JobOutcome) -> Result<Job> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Versioned {
                version,
                value: mut job,
                ..
            } = read_as::<Job>(self.store.as_ref(), Collection::Jobs, job_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;

            if !job.is_held_by(owner) {
                return Err(AppError::LeaseLost {
                    job_id: job_id.to_string(),
                });
            }

            let now = self.time_provider.now_millis();
            job.finish(owner, outcome.clone(), now)?;

            let mut writes = vec![Write::update(Collection::Jobs, job_id, version, &job)?];

            let subject_status = match job.status {
                JobStatus::Succeeded => SubjectStatus::Active,
                _ => SubjectStatus::Error,
            };
            if let Some(mut subject) =
                read_as::<Subject>(self.store.as_ref(), Collection::Subjects, &job.subject_id)
                    .await?
            {
                if subject.value.detach_job(job_id, subject_status, now) {
                    writes.push(Write::update(
                        Collection::Subjects,
                        subject.key,
                        subject.version,
                        &subject.value,
                    )?);
                }
            }

            match self.store.commit(writes).await? {
                CommitOutcome::Committed => {
                    info!(
                        job_id,
                        status = %job.status,
                        error_code = job.last_error.as_ref().map(|e| e.code.as_str()),
                        "Job completed"
                    );
                    return Ok(job);
                }
                CommitOutcome::Conflict => continue,
            }
        }
        Err(conflict_exhausted(format!("completion of job {}", job_id)))
    }

    /// Re-enqueue subjects whose latest job failed with `code`
    ///
    /// Returns the ids of the new jobs.
    pub async fn requeue_failed(&self, code: &str) -> Result<Vec<JobId>> {
        let failed = scan_as::<Job>(
            self.store.as_ref(),
            Collection::Jobs,
            &[
                FieldFilter::eq("status", JobStatus::Failed.as_str()),
                FieldFilter::eq("last_error.code", code),
            ],
        )
        .await?;

        let failed_ids: BTreeSet<JobId> = failed.iter().map(|r| r.value.id.clone()).collect();
        let subject_ids: BTreeSet<String> =
            failed.into_iter().map(|r| r.value.subject_id).collect();

        let mut requeued = Vec::new();
        for subject_id in subject_ids {
            // Only the subject's most recent job counts; older failures were already retried
            let latest = self
                .jobs_for_subject(&subject_id)
                .await?
                .into_iter()
                .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            match latest {
                Some(job) if failed_ids.contains(&job.id) => {}
                _ => continue,
            }

            match self.enqueue_inner(&subject_id, true).await {
                Ok(EnqueueOutcome::Enqueued(job_id)) => {
                    info!(subject_id = %subject_id, job_id = %job_id, code, "Requeued failed subject");
                    requeued.push(job_id);
                }
                Ok(_) => {}
                Err(AppError::NotFound(_)) => {
                    warn!(subject_id = %subject_id, "Failed job references a missing subject");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(requeued)
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(read_as::<Job>(self.store.as_ref(), Collection::Jobs, job_id)
            .await?
            .map(|r| r.value))
    }

    pub async fn subject(&self, subject_id: &str) -> Result<Option<Subject>> {
        Ok(
            read_as::<Subject>(self.store.as_ref(), Collection::Subjects, subject_id)
                .await?
                .map(|r| r.value),
        )
    }

    /// Jobs, optionally filtered by status, oldest first
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut jobs = match status {
            Some(status) => self.jobs_with_status(status).await?,
            None => scan_as::<Job>(self.store.as_ref(), Collection::Jobs, &[])
                .await?
                .into_iter()
                .map(|r| r.value)
                .collect(),
        };
        jobs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(jobs)
    }

    /// Job counts keyed by status
    pub async fn count_by_status(&self) -> Result<HashMap<JobStatus, usize>> {
        let mut counts = HashMap::new();
        for job in self.list_jobs(None).await? {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        Ok(scan_as::<Job>(
            self.store.as_ref(),
            Collection::Jobs,
            &[FieldFilter::eq("status", status.as_str())],
        )
        .await?
        .into_iter()
        .map(|r| r.value)
        .collect())
    }

    async fn jobs_for_subject(&self, subject_id: &str) -> Result<Vec<Job>> {
        Ok(scan_as::<Job>(
            self.store.as_ref(),
            Collection::Jobs,
            &[FieldFilter::eq("subject_id", subject_id)],
        )
        .await?
        .into_iter()
        .map(|r| r.value)
        .collect())
    }
}

/// Failure recorded when a claimed job is refused by the attempt policy
pub fn max_attempts_failure(job: &Job) -> JobFailure {
    JobFailure::new(
        "MAX_ATTEMPTS_EXCEEDED",
        format!("job {} exceeded its attempt limit ({} attempts)", job.id, job.attempts),
    )
}
