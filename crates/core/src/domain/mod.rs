// Domain Layer - Pure business logic and entities

pub mod error;
pub mod job;
pub mod posting_history;
pub mod rate_limit;
pub mod subject;
pub mod token;

// Re-exports
pub use error::DomainError;
pub use job::{Job, JobFailure, JobId, JobOutcome, JobStatus, WorkerId};
pub use posting_history::{
    normalize_title, DuplicateCheck, PostingHistoryRecord, DEFAULT_DUPLICATE_WINDOW_MS,
};
pub use rate_limit::{
    DestinationLimits, PostDecision, PostReason, RateLimitRecord, RateLimitStatus,
    ROLLING_WINDOW_MS,
};
pub use subject::{Subject, SubjectId, SubjectStatus};
pub use token::{ApiEnvironment, TokenGrant, TokenRecord, DEFAULT_TOKEN_EXPIRY_BUFFER_MS};
