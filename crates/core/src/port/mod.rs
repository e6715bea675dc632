// Port Layer - Interfaces for external dependencies

pub mod automation;
pub mod http_transport;
pub mod id_provider; // For deterministic testing
pub mod maintenance;
pub mod publisher;
pub mod sleeper;
pub mod store;
pub mod time_provider;
pub mod token_endpoint;

// Re-exports
pub use automation::{ExecutionError, ListingAutomation};
pub use http_transport::{ApiRequest, HttpMethod, HttpTransport, RawResponse, TransportError};
pub use id_provider::{IdProvider, UuidProvider};
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceStats};
pub use publisher::DestinationPublisher;
pub use sleeper::{Sleeper, TokioSleeper};
pub use store::{
    Collection, CommitOutcome, Expected, FieldFilter, InMemoryStore, Version, Versioned,
    VersionedStore, Write, MAX_CONFLICT_RETRIES,
};
pub use time_provider::{SystemTimeProvider, TimeProvider};
pub use token_endpoint::TokenEndpoint;
