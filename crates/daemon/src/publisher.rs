// DestinationPublisher over the resilient marketplace client

use async_trait::async_trait;
use marketpost_core::application::ResilientClient;
use marketpost_core::domain::Subject;
use marketpost_core::error::ExternalError;
use marketpost_core::port::{ApiRequest, DestinationPublisher, HttpMethod};
use std::sync::Arc;
use tracing::debug;

/// Sends the subject payload to one API path per destination
pub struct ApiPublisher {
    client: Arc<ResilientClient>,
    method: HttpMethod,
    path_template: String,
}

impl ApiPublisher {
    pub fn new(
        client: Arc<ResilientClient>,
        method: HttpMethod,
        path_template: impl Into<String>,
    ) -> Self {
        Self {
            client,
            method,
            path_template: path_template.into(),
        }
    }

    fn request_for(&self, subject: &Subject) -> ApiRequest {
        let path = self.path_template.replace("{id}", &subject.id);
        let request = ApiRequest::new(self.method, path);
        match self.method {
            HttpMethod::Get | HttpMethod::Delete => request,
            _ => request.with_body(subject.payload.clone()),
        }
    }
}

#[async_trait]
impl DestinationPublisher for ApiPublisher {
    async fn publish(&self, subject: &Subject) -> Result<serde_json::Value, ExternalError> {
        let request = self.request_for(subject);
        debug!(subject_id = %subject.id, path = %request.path, "Publishing subject");
        let response = self.client.execute(&request).await?;
        Ok(serde_json::json!({
            "status": response.status,
            "data": response.data,
        }))
    }
}
