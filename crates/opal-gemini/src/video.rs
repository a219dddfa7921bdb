//! Long-running video generation jobs: submit once, re-fetch the operation
//! handle by reference until its done flag is set.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use opal_core::error::{OpalError, Result};
use opal_core::types::Blob;

use crate::GeminiClient;

/// Fixed wait between status fetches.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Ceiling on status fetches (~10 minutes at the default interval). The
/// remote job has its own bounded lifetime; this just keeps a dead handle
/// from being polled forever.
pub const DEFAULT_MAX_POLLS: u32 = 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoOperation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<OperationError>,
    #[serde(default)]
    pub response: Option<OperationResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    #[serde(default)]
    pub generate_video_response: Option<GenerateVideoResponse>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateVideoResponse {
    #[serde(default)]
    pub generated_samples: Vec<GeneratedSample>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedSample {
    #[serde(default)]
    pub video: Option<VideoRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoRef {
    #[serde(default)]
    pub uri: String,
}

impl VideoOperation {
    /// The generated sample's fetchable URI, once the operation settled.
    pub fn video_uri(&self) -> Option<&str> {
        self.response
            .as_ref()?
            .generate_video_response
            .as_ref()?
            .generated_samples
            .first()?
            .video
            .as_ref()
            .map(|v| v.uri.as_str())
    }
}

/// Fetches an operation handle by reference. Abstracted so the polling loop
/// can be driven by a mock in tests.
#[async_trait]
pub trait OperationPoller {
    async fn fetch(&self, name: &str) -> Result<VideoOperation>;
}

#[async_trait]
impl OperationPoller for GeminiClient {
    async fn fetch(&self, name: &str) -> Result<VideoOperation> {
        let url = format!("{}/v1beta/{}?key={}", self.base_url, name, self.api_key());
        let response = self
            .http()
            .get(&url)
            .send()
            .await
            .map_err(|e| OpalError::Provider(format!("operation fetch failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OpalError::Provider(format!("Gemini API error {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| OpalError::Provider(format!("malformed operation: {e}")))
    }
}

impl GeminiClient {
    /// Submit a video generation job from a prompt and an optional source
    /// image. Returns the operation handle to poll.
    pub async fn start_video(
        &self,
        model: &str,
        prompt: &str,
        image: Option<&Blob>,
    ) -> Result<VideoOperation> {
        let mut instance = json!({ "prompt": prompt });
        if let Some(blob) = image {
            instance["image"] = json!({
                "bytesBase64Encoded": blob.data,
                "mimeType": blob.mime_type,
            });
        }

        let url = format!(
            "{}/v1beta/models/{}:predictLongRunning?key={}",
            self.base_url,
            model,
            self.api_key()
        );

        debug!(model, "Submitting video generation job");

        let response = self
            .http()
            .post(&url)
            .header("content-type", "application/json")
            .json(&json!({ "instances": [instance] }))
            .send()
            .await
            .map_err(|e| OpalError::Provider(format!("video submit failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OpalError::Provider(format!("Gemini API error {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| OpalError::Provider(format!("malformed operation: {e}")))
    }

    /// Download the generated video bytes from a credentialed result URI.
    pub async fn download(&self, uri: &str) -> Result<Vec<u8>> {
        let response = self
            .http()
            .get(self.credentialed_url(uri))
            .send()
            .await
            .map_err(|e| OpalError::Provider(format!("download failed: {e}")))?;

        if !response.status().is_success() {
            return Err(OpalError::Provider(format!(
                "download failed with status {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| OpalError::Provider(format!("download read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Poll an operation until terminal: wait `interval`, re-fetch the handle,
/// repeat. A terminal remote failure surfaces the remote message verbatim.
/// `max_polls` bounds the loop.
pub async fn poll_until_done<P: OperationPoller + Sync>(
    poller: &P,
    mut op: VideoOperation,
    interval: Duration,
    max_polls: u32,
    mut on_status: impl FnMut(&str),
) -> Result<VideoOperation> {
    let mut polls = 0u32;

    while !op.done {
        if polls >= max_polls {
            return Err(OpalError::Job(format!(
                "video job did not settle after {polls} status fetches"
            )));
        }
        tokio::time::sleep(interval).await;
        op = poller.fetch(&op.name).await?;
        polls += 1;
        on_status(&format!("waiting for video job ({polls})"));
    }

    if let Some(err) = &op.error {
        return Err(OpalError::Job(err.message.clone()));
    }

    on_status("video job settled");
    Ok(op)
}
