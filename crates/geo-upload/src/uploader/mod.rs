use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::artifact_store::Location;
use crate::error::UploadError;

pub mod http;

pub use http::HttpUploader;

/// Capacity of the process-wide background completion channel.
pub const COMPLETION_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    #[serde(rename = "downloadUrl")]
    pub remote_locator: String,
}

/// Attached to every upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub candidate_name: String,
    /// Queue entry the bytes were read from; echoed back on background completion.
    pub artifact: Location,
}

/// Emitted by the transport when a background upload finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundCompletion {
    pub artifact: Location,
    pub result: UploadResult,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Suspends until the remote call completes or fails.
    async fn upload_foreground(
        &self,
        artifact: &[u8],
        metadata: &UploadMetadata,
    ) -> Result<UploadResult, UploadError>;

    /// Registers a fire-and-forget upload. `Ok` only means the transfer was
    /// handed to the transport; the outcome arrives on `completions()`.
    fn upload_background(
        &self,
        artifact: Vec<u8>,
        metadata: UploadMetadata,
    ) -> Result<(), UploadError>;

    fn completions(&self) -> broadcast::Receiver<BackgroundCompletion>;
}
