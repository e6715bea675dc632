// Job Domain Model: a durable, leasable unit of posting work

use crate::domain::error::{DomainError, Result};
use crate::domain::subject::SubjectId;
use crate::error::{excerpt, ExternalError};
use serde::{Deserialize, Serialize};

/// Job ID (UUID v4)
pub type JobId = String;

/// Identity of a worker process; doubles as the lease owner
pub type WorkerId = String;

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Stored representation, used by store filters
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::ValidationError(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }
}

/// Structured failure stored as `last_error` on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub code: String,
    pub status: Option<u16>,
    /// Excerpt of the external payload, if any
    pub raw: Option<String>,
}

impl JobFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            status: None,
            raw: None,
        }
    }

    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }

    pub fn with_raw(mut self, raw: Option<&str>) -> Self {
        self.raw = raw.map(excerpt);
        self
    }
}

impl From<&ExternalError> for JobFailure {
    fn from(err: &ExternalError) -> Self {
        JobFailure::new(err.code(), err.to_string())
            .with_status(err.status())
            .with_raw(err.raw_excerpt())
    }
}

/// Terminal outcome handed to `complete`
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded {
        result: Option<serde_json::Value>,
    },
    Failed {
        error: JobFailure,
        result: Option<serde_json::Value>,
    },
}

impl JobOutcome {
    pub fn failed(error: JobFailure) -> Self {
        JobOutcome::Failed {
            error,
            result: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded { .. } => JobStatus::Succeeded,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Job Entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub subject_id: SubjectId,
    pub status: JobStatus,
    pub attempts: u32,

    pub created_at: i64, // epoch ms
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,

    // Lease
    pub lease_owner: Option<WorkerId>,
    pub lease_expires_at: Option<i64>,

    pub last_error: Option<JobFailure>,
    pub result: Option<serde_json::Value>,
}

impl Job {
    /// Create a queued job
    ///
    /// # Arguments
    ///
    /// * `id` - Unique job ID (injected, not generated)
    /// * `subject_id` - Subject this job posts
    /// * `created_at` - Creation timestamp in epoch ms (injected, not system time)
    pub fn new(id: impl Into<String>, subject_id: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            subject_id: subject_id.into(),
            status: JobStatus::Queued,
            attempts: 0,
            created_at,
            started_at: None,
            finished_at: None,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
            result: None,
        }
    }

    /// Queued or running
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Running with a lease that has run out (a missing expiry counts as expired)
    pub fn is_lease_expired(&self, now_millis: i64) -> bool {
        self.status == JobStatus::Running
            && self.lease_expires_at.map_or(true, |at| at <= now_millis)
    }

    pub fn is_claimable(&self, now_millis: i64) -> bool {
        self.status == JobStatus::Queued || self.is_lease_expired(now_millis)
    }

    pub fn is_held_by(&self, owner: &str) -> bool {
        self.status == JobStatus::Running && self.lease_owner.as_deref() == Some(owner)
    }

    /// Take the lease: queued, or running with an expired lease
    pub fn claim(&mut self, owner: &str, now_millis: i64, lease_duration_ms: i64) -> Result<()> {
        if !self.is_claimable(now_millis) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }
        self.attempts += 1;
        self.status = JobStatus::Running;
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = Some(now_millis + lease_duration_ms);
        if self.started_at.is_none() {
            self.started_at = Some(now_millis);
        }
        Ok(())
    }

    /// Move to a terminal status and release the lease
    pub fn finish(&mut self, owner: &str, outcome: JobOutcome, now_millis: i64) -> Result<()> {
        if !self.is_held_by(owner) {
            return Err(DomainError::NotLeaseHolder {
                job_id: self.id.clone(),
                holder: self.lease_owner.clone(),
                caller: owner.to_string(),
            });
        }
        self.status = outcome.status();
        match outcome {
            JobOutcome::Succeeded { result } => {
                self.result = result;
                self.last_error = None;
            }
            JobOutcome::Failed { error, result } => {
                self.result = result;
                self.last_error = Some(error);
            }
        }
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.finished_at = Some(now_millis);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE_MS: i64 = 60_000;

    #[test]
    fn test_claim_sets_lease_and_started_at_once() {
        let mut job = Job::new("job-1", "subject-1", 1_000);

        job.claim("worker-a", 2_000, LEASE_MS).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.lease_owner.as_deref(), Some("worker-a"));
        assert_eq!(job.lease_expires_at, Some(2_000 + LEASE_MS));
        assert_eq!(job.started_at, Some(2_000));

        // Reclaim after expiry keeps the original start time
        let later = 2_000 + LEASE_MS + 1;
        job.claim("worker-b", later, LEASE_MS).unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.lease_owner.as_deref(), Some("worker-b"));
        assert_eq!(job.started_at, Some(2_000));
    }

    #[test]
    fn test_claim_rejected_while_lease_alive() {
        let mut job = Job::new("job-1", "subject-1", 1_000);
        job.claim("worker-a", 2_000, LEASE_MS).unwrap();

        let err = job.claim("worker-b", 3_000, LEASE_MS).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn test_finish_requires_lease_holder() {
        let mut job = Job::new("job-1", "subject-1", 1_000);
        job.claim("worker-a", 2_000, LEASE_MS).unwrap();

        let err = job
            .finish("worker-b", JobOutcome::Succeeded { result: None }, 3_000)
            .unwrap_err();
        assert!(matches!(err, DomainError::NotLeaseHolder { .. }));

        job.finish(
            "worker-a",
            JobOutcome::failed(JobFailure::new("EXECUTION_FAILED", "boom")),
            3_000,
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.lease_owner, None);
        assert_eq!(job.lease_expires_at, None);
        assert_eq!(job.finished_at, Some(3_000));
        assert_eq!(job.last_error.as_ref().unwrap().code, "EXECUTION_FAILED");
    }

    #[test]
    fn test_terminal_jobs_are_not_claimable() {
        let mut job = Job::new("job-1", "subject-1", 1_000);
        job.claim("worker-a", 2_000, LEASE_MS).unwrap();
        job.finish("worker-a", JobOutcome::Succeeded { result: None }, 2_500)
            .unwrap();

        assert!(!job.is_live());
        assert!(!job.is_claimable(i64::MAX));
    }

    #[test]
    fn test_failure_from_external_error_keeps_status_and_raw() {
        let err = ExternalError::Permanent {
            status: 400,
            message: "invalid sku".into(),
            raw: Some("{\"errors\":[]}".into()),
        };
        let failure = JobFailure::from(&err);
        assert_eq!(failure.code, "PERMANENT_EXTERNAL");
        assert_eq!(failure.status, Some(400));
        assert_eq!(failure.raw.as_deref(), Some("{\"errors\":[]}"));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.as_str())
            );
        }
    }
}
