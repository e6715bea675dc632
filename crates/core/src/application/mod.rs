// Application Layer - Use Cases and Business Logic

pub mod client;
pub mod dispatch;
pub mod lease;
pub mod maintenance;
pub mod rate_limiter;
pub mod recovery;
pub mod retry;
pub mod subjects;
pub mod worker;

// Re-exports
pub use client::{ApiResponse, ClientConfig, ResilientClient, TokenManager};
pub use dispatch::{DestinationOutcome, DestinationResult, PostingDispatcher};
pub use lease::{EnqueueOutcome, LeaseManager};
pub use maintenance::MaintenanceScheduler;
pub use rate_limiter::RateLimiter;
pub use recovery::RecoveryService;
pub use retry::{AttemptPolicy, BackoffPolicy};
pub use subjects::{SubjectDraft, SubjectService};
pub use worker::{shutdown_channel, ShutdownSender, ShutdownToken, TickOutcome, Worker};
