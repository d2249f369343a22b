//! Alt-text generation as a queue job.

use std::sync::Arc;

use async_trait::async_trait;
use optti_client::{ApiClient, GenerateRequest, HttpTransport, extract_alt_text};
use optti_queue::queue::REGENERATE_SOURCE;
use optti_queue::{Job, JobOutcome, JobProcessor};
use tracing::{debug, info, warn};

use crate::media::MediaLibrary;

pub struct AltTextProcessor<T, M> {
    client: Arc<ApiClient<T>>,
    media: M,
}

impl<T, M> AltTextProcessor<T, M> {
    pub fn new(client: Arc<ApiClient<T>>, media: M) -> Self {
        Self { client, media }
    }
}

#[async_trait]
impl<T, M> JobProcessor for AltTextProcessor<T, M>
where
    T: HttpTransport + 'static,
    M: MediaLibrary,
{
    async fn process(&self, job: &Job) -> JobOutcome {
        let image = match self.media.image_payload(job.entity_id).await {
            Ok(Some(image)) => image,
            Ok(None) => return JobOutcome::Failed(format!("image {} not found", job.entity_id)),
            Err(err) => {
                warn!(
                    source = "worker",
                    entity_id = %job.entity_id,
                    error = %err,
                    "media lookup failed"
                );
                return JobOutcome::Retry(format!("media lookup failed: {err:#}"));
            }
        };

        let request = GenerateRequest::new(job.entity_id, image)
            .regenerate(job.source == REGENERATE_SOURCE);

        match self.client.generate_alt_text(&request).await {
            Ok(response) => {
                let Some(alt_text) = extract_alt_text(&response) else {
                    return JobOutcome::Failed("backend returned no alt text".to_string());
                };
                if let Err(err) = self.media.save_alt_text(job.entity_id, alt_text).await {
                    return JobOutcome::Retry(format!("saving alt text failed: {err:#}"));
                }
                info!(source = "worker", entity_id = %job.entity_id, "alt text generated");
                JobOutcome::Completed
            }
            Err(err) if err.is_retryable() => {
                debug!(
                    source = "worker",
                    entity_id = %job.entity_id,
                    error = %err,
                    "generation will be retried"
                );
                JobOutcome::Retry(err.message().to_string())
            }
            Err(err) => JobOutcome::Failed(err.message().to_string()),
        }
    }
}
