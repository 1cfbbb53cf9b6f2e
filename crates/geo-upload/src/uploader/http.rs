use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use reqwest::multipart::{Form, Part};
use tokio::sync::broadcast;

use super::{
    BackgroundCompletion, COMPLETION_CHANNEL_CAPACITY, UploadMetadata, UploadResult, Uploader,
};
use crate::config::UploaderConfig;
use crate::error::{Error, Result, UploadError};

const FILE_FIELD: &str = "file";
const FILE_NAME: &str = "image.jpg";
const FILE_MIME: &str = "image/jpeg";
const CANDIDATE_FIELD: &str = "candidateName";

/// Multipart HTTP transport.
///
/// Background uploads run on a detached tokio task with their own bounded
/// retry, outliving the drain pass that registered them.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    url: Url,
    completions: broadcast::Sender<BackgroundCompletion>,
    background_attempts: u32,
    background_delay: Duration,
}

impl HttpUploader {
    pub fn new(base_url: &str, path: &str, timeout: Duration) -> Result<Self> {
        let raw = format!(
            "{}/{}",
            base_url.trim().trim_end_matches('/'),
            path.trim().trim_start_matches('/')
        );
        let url = Url::parse(&raw)
            .map_err(|e| Error::msg(format!("invalid upload url '{raw}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);
        Ok(Self {
            client,
            url,
            completions,
            background_attempts: 3,
            background_delay: Duration::from_secs(1),
        })
    }

    pub fn from_config(cfg: &UploaderConfig) -> Result<Self> {
        let base = cfg.resolve_base_url()?;
        Ok(Self::new(&base, &cfg.path, cfg.timeout())?
            .with_background_retry(cfg.background_attempts, cfg.background_retry_delay()))
    }

    pub fn with_background_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.background_attempts = attempts.max(1);
        self.background_delay = delay;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn request_url(&self, candidate_name: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair(CANDIDATE_FIELD, candidate_name);
        url
    }

    async fn send(
        client: &reqwest::Client,
        url: Url,
        artifact: Vec<u8>,
        candidate_name: &str,
    ) -> std::result::Result<UploadResult, UploadError> {
        let part = Part::bytes(artifact)
            .file_name(FILE_NAME)
            .mime_str(FILE_MIME)
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        let form = Form::new()
            .text(CANDIDATE_FIELD, candidate_name.to_string())
            .part(FILE_FIELD, part);

        let res = client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(UploadError::from)?;
        let status = res.status();
        if !status.is_success() {
            return Err(UploadError::Status(status.as_u16()));
        }
        let body = res.bytes().await.map_err(UploadError::from)?;
        serde_json::from_slice::<UploadResult>(&body).map_err(|e| UploadError::Decoding(e.to_string()))
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload_foreground(
        &self,
        artifact: &[u8],
        metadata: &UploadMetadata,
    ) -> std::result::Result<UploadResult, UploadError> {
        let url = self.request_url(&metadata.candidate_name);
        Self::send(&self.client, url, artifact.to_vec(), &metadata.candidate_name).await
    }

    fn upload_background(
        &self,
        artifact: Vec<u8>,
        metadata: UploadMetadata,
    ) -> std::result::Result<(), UploadError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| UploadError::Transport(format!("no async runtime for background upload: {e}")))?;
        let client = self.client.clone();
        let url = self.request_url(&metadata.candidate_name);
        let tx = self.completions.clone();
        let attempts = self.background_attempts;
        let delay = self.background_delay;

        handle.spawn(async move {
            for attempt in 1..=attempts {
                match Self::send(&client, url.clone(), artifact.clone(), &metadata.candidate_name)
                    .await
                {
                    Ok(result) => {
                        tracing::info!(
                            artifact = %metadata.artifact.display(),
                            url = %result.remote_locator,
                            "background upload finished"
                        );
                        let done = BackgroundCompletion {
                            artifact: metadata.artifact,
                            result,
                        };
                        if let Err(lost) = tx.send(done) {
                            tracing::warn!(
                                artifact = %lost.0.artifact.display(),
                                "no listener for background completion; progress will be reconciled on restart"
                            );
                        }
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            artifact = %metadata.artifact.display(),
                            attempt,
                            error = %e,
                            "background upload attempt failed"
                        );
                    }
                }
                if attempt < attempts {
                    tokio::time::sleep(delay.saturating_mul(1 << (attempt - 1).min(6))).await;
                }
            }
            tracing::error!(
                artifact = %metadata.artifact.display(),
                "background upload abandoned; artifact stays queued on disk"
            );
        });
        Ok(())
    }

    fn completions(&self) -> broadcast::Receiver<BackgroundCompletion> {
        self.completions.subscribe()
    }
}
