// Posting Dispatcher: the ListingAutomation the daemon wires into the worker
//
// For each destination of a subject, in order: rate limit, duplicate check,
// publish, then record. One destination's failure does not stop the others.

use crate::application::rate_limiter::RateLimiter;
use crate::domain::{Job, JobFailure, JobOutcome, Subject, DEFAULT_DUPLICATE_WINDOW_MS};
use crate::port::{DestinationPublisher, ExecutionError, ListingAutomation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What happened on one destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DestinationOutcome {
    Posted { data: serde_json::Value },
    RateLimited { wait_ms: i64, reason: String },
    Duplicate { last_posted_at: Option<i64> },
    Skipped { reason: String },
    Failed { error: JobFailure },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationResult {
    pub destination: String,
    #[serde(flatten)]
    pub outcome: DestinationOutcome,
}

pub struct PostingDispatcher {
    rate_limiter: Arc<RateLimiter>,
    publishers: HashMap<String, Arc<dyn DestinationPublisher>>,
    duplicate_window_ms: i64,
}

impl PostingDispatcher {
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            rate_limiter,
            publishers: HashMap::new(),
            duplicate_window_ms: DEFAULT_DUPLICATE_WINDOW_MS,
        }
    }

    pub fn with_publisher(
        mut self,
        destination: impl Into<String>,
        publisher: Arc<dyn DestinationPublisher>,
    ) -> Self {
        self.publishers.insert(destination.into(), publisher);
        self
    }

    pub fn with_duplicate_window_ms(mut self, window_ms: i64) -> Self {
        self.duplicate_window_ms = window_ms;
        self
    }

    async fn post_one(
        &self,
        destination: &str,
        worker_id: &str,
        subject: &Subject,
    ) -> DestinationOutcome {
        let decision = match self.rate_limiter.can_post(destination, worker_id).await {
            Ok(decision) => decision,
            Err(e) => return bookkeeping_failure("rate limit check", &e),
        };
        if !decision.allowed {
            info!(
                subject_id = %subject.id,
                destination,
                wait_ms = decision.wait_ms,
                reason = %decision.reason,
                "Destination rate limited"
            );
            return DestinationOutcome::RateLimited {
                wait_ms: decision.wait_ms,
                reason: decision.reason.to_string(),
            };
        }

        let duplicate = match self
            .rate_limiter
            .check_duplicate(&subject.title, destination, Some(self.duplicate_window_ms))
            .await
        {
            Ok(check) => check,
            Err(e) => return bookkeeping_failure("duplicate check", &e),
        };
        if duplicate.is_duplicate {
            info!(subject_id = %subject.id, destination, "Duplicate title; not posting");
            return DestinationOutcome::Duplicate {
                last_posted_at: duplicate.last_posted_at,
            };
        }

        let Some(publisher) = self.publishers.get(destination) else {
            warn!(subject_id = %subject.id, destination, "No publisher registered");
            return DestinationOutcome::Skipped {
                reason: format!("no publisher registered for {}", destination),
            };
        };

        match publisher.publish(subject).await {
            Ok(data) => {
                if let Err(e) = self.rate_limiter.record_post(destination, worker_id).await {
                    error!(destination, error = %e, "Posted but failed to record post");
                }
                if let Err(e) = self
                    .rate_limiter
                    .record_posting(&subject.title, destination, &subject.id)
                    .await
                {
                    error!(destination, error = %e, "Posted but failed to record posting history");
                }
                info!(subject_id = %subject.id, destination, "Posted");
                DestinationOutcome::Posted { data }
            }
            Err(e) => {
                warn!(
                    subject_id = %subject.id,
                    destination,
                    code = e.code(),
                    error = %e,
                    "Publish failed"
                );
                DestinationOutcome::Failed {
                    error: JobFailure::from(&e),
                }
            }
        }
    }
}

fn bookkeeping_failure(step: &str, err: &crate::error::AppError) -> DestinationOutcome {
    DestinationOutcome::Failed {
        error: JobFailure::new("DESTINATION_FAILED", format!("{} failed: {}", step, err)),
    }
}

#[async_trait]
impl ListingAutomation for PostingDispatcher {
    async fn run(&self, job: &Job, subject: &Subject) -> Result<JobOutcome, ExecutionError> {
        let worker_id = job
            .lease_owner
            .as_deref()
            .ok_or_else(|| ExecutionError::Failed(format!("job {} has no lease owner", job.id)))?;

        let mut results = Vec::with_capacity(subject.destinations.len());
        for destination in &subject.destinations {
            let outcome = self.post_one(destination, worker_id, subject).await;
            results.push(DestinationResult {
                destination: destination.clone(),
                outcome,
            });
        }

        let first_failure = results.iter().find_map(|r| match &r.outcome {
            DestinationOutcome::Failed { error } => Some(JobFailure {
                message: format!("{}: {}", r.destination, error.message),
                ..error.clone()
            }),
            _ => None,
        });
        let result = Some(serde_json::json!({ "destinations": results }));

        Ok(match first_failure {
            Some(error) => JobOutcome::Failed { error, result },
            None => JobOutcome::Succeeded { result },
        })
    }
}
