// Listing Automation Port
// The execution delegate a claimed job is handed to. The worker only looks at
// success/failure and the optional structured result.

use crate::domain::{Job, JobFailure, JobOutcome, Subject};
use crate::error::ExternalError;
use async_trait::async_trait;
use thiserror::Error;

/// Execution errors
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("Execution failed: {0}")]
    Failed(String),

    #[error(transparent)]
    External(#[from] ExternalError),
}

impl From<&ExecutionError> for JobFailure {
    fn from(err: &ExecutionError) -> Self {
        match err {
            ExecutionError::Failed(message) => JobFailure::new("EXECUTION_FAILED", message.clone()),
            ExecutionError::External(external) => JobFailure::from(external),
        }
    }
}

/// Listing Automation trait
///
/// Implementations:
/// - PostingDispatcher: rate-limited fan-out to destination publishers
#[async_trait]
pub trait ListingAutomation: Send + Sync {
    /// Run the automation for `subject` under the lease held on `job`
    ///
    /// # Errors
    /// Any error completes the job as failed; it is never retried in-tick
    async fn run(&self, job: &Job, subject: &Subject) -> Result<JobOutcome, ExecutionError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Mock automation behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Always succeed
        Success,
        /// Return a failed outcome with this code
        FailOutcome(String),
        /// Return an execution error
        Error(String),
        /// Panic with message (for panic isolation testing)
        Panic(String),
        /// Succeed after sleeping
        Slow(Duration),
    }

    /// Mock Listing Automation for testing
    pub struct MockAutomation {
        behavior: Arc<Mutex<MockBehavior>>,
        call_count: Arc<Mutex<usize>>,
    }

    impl MockAutomation {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Arc::new(Mutex::new(behavior)),
                call_count: Arc::new(Mutex::new(0)),
            }
        }

        pub fn new_success() -> Self {
            Self::new(MockBehavior::Success)
        }

        pub fn new_panic_inducing(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Panic(message.into()))
        }

        pub fn new_error(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Error(message.into()))
        }

        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn call_count(&self) -> usize {
            *self.call_count.lock().unwrap()
        }
    }

    #[async_trait]
    impl ListingAutomation for MockAutomation {
        async fn run(&self, _job: &Job, subject: &Subject) -> Result<JobOutcome, ExecutionError> {
            *self.call_count.lock().unwrap() += 1;

            let behavior = self.behavior.lock().unwrap().clone();

            match behavior {
                MockBehavior::Success => Ok(JobOutcome::Succeeded {
                    result: Some(serde_json::json!({ "subject": subject.id })),
                }),
                MockBehavior::FailOutcome(code) => Ok(JobOutcome::failed(JobFailure::new(
                    code,
                    "mock failure",
                ))),
                MockBehavior::Error(msg) => Err(ExecutionError::Failed(msg)),
                MockBehavior::Panic(msg) => {
                    panic!("{}", msg);
                }
                MockBehavior::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(JobOutcome::Succeeded { result: None })
                }
            }
        }
    }
}
