// Subject Domain Model: the inventory listing a job posts

use crate::domain::error::{DomainError, Result};
use crate::domain::job::JobId;
use serde::{Deserialize, Serialize};

pub type SubjectId = String;

/// Subject lifecycle. `Pending` is the state that triggers an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectStatus {
    Pending,
    Running,
    Active,
    Error,
}

impl SubjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectStatus::Pending => "pending",
            SubjectStatus::Running => "running",
            SubjectStatus::Active => "active",
            SubjectStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SubjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub status: SubjectStatus,
    /// Back-reference to the live job, if any
    pub active_job_id: Option<JobId>,

    pub title: String,
    /// Destination names, posted in order
    pub destinations: Vec<String>,
    /// Opaque listing data handed to publishers
    #[serde(default)]
    pub payload: serde_json::Value,

    pub updated_at: i64,
}

impl Subject {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        destinations: Vec<String>,
        payload: serde_json::Value,
        now_millis: i64,
    ) -> Result<Self> {
        let id = id.into();
        let title = title.into();
        if id.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "subject id must not be empty".to_string(),
            ));
        }
        if title.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "subject title must not be empty".to_string(),
            ));
        }
        Ok(Self {
            id,
            status: SubjectStatus::Pending,
            active_job_id: None,
            title,
            destinations,
            payload,
            updated_at: now_millis,
        })
    }

    pub fn is_triggered(&self) -> bool {
        self.status == SubjectStatus::Pending
    }

    pub fn attach_job(&mut self, job_id: &str, now_millis: i64) {
        self.active_job_id = Some(job_id.to_string());
        self.status = SubjectStatus::Running;
        self.updated_at = now_millis;
    }

    /// Clear the back-reference if it still points at `job_id`; returns whether it did
    pub fn detach_job(&mut self, job_id: &str, status: SubjectStatus, now_millis: i64) -> bool {
        if self.active_job_id.as_deref() != Some(job_id) {
            return false;
        }
        self.active_job_id = None;
        self.status = status;
        self.updated_at = now_millis;
        true
    }
}
