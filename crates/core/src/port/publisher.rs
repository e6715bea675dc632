// Destination Publisher Port: posts one subject to one marketplace

use crate::domain::Subject;
use crate::error::ExternalError;
use async_trait::async_trait;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DestinationPublisher: Send + Sync {
    /// Publish and return the destination's response data (listing id, URL, ...)
    async fn publish(&self, subject: &Subject) -> Result<serde_json::Value, ExternalError>;
}
