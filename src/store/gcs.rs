use async_trait::async_trait;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use google_cloud_storage::http::Error as GcsError;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tracing::{debug, info, instrument};

use super::{BlobStore, ObjectKey};
use crate::error::PipelineError;

/// GCS-backed [`BlobStore`] using application-default credentials.
pub struct GcsStore {
    client: Client,
}

impl GcsStore {
    pub async fn new() -> Result<Self, PipelineError> {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| PipelineError::store("auth", "gcs", e))?;
        Ok(Self {
            client: Client::new(config),
        })
    }
}

#[async_trait]
impl BlobStore for GcsStore {
    #[instrument(level = "debug", skip(self), fields(key = %key))]
    async fn exists(&self, key: &ObjectKey) -> Result<bool, PipelineError> {
        let request = GetObjectRequest {
            bucket: key.bucket.clone(),
            object: key.path.clone(),
            ..Default::default()
        };
        match self.client.get_object(&request).await {
            Ok(_) => {
                debug!(key = %key, "object present");
                Ok(true)
            }
            Err(GcsError::Response(resp)) if resp.code == 404 => {
                debug!(key = %key, "object absent");
                Ok(false)
            }
            Err(e) => Err(PipelineError::store("stat", key.gs_uri(), e)),
        }
    }

    #[instrument(level = "info", skip(self, local), fields(src = %local.display(), key = %key))]
    async fn upload(
        &self,
        local: &Path,
        key: &ObjectKey,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        let file = File::open(local)
            .await
            .map_err(|e| PipelineError::upload(key.gs_uri(), e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| PipelineError::upload(key.gs_uri(), e))?
            .len();

        let mut media = Media::new(key.path.clone());
        media.content_length = Some(len);
        let request = UploadObjectRequest {
            bucket: key.bucket.clone(),
            ..Default::default()
        };

        // Streaming upload, bounded by the configured timeout.
        tokio::time::timeout(
            timeout,
            self.client
                .upload_object(&request, file, &UploadType::Simple(media)),
        )
        .await
        .map_err(|elapsed| PipelineError::upload(key.gs_uri(), elapsed))?
        .map_err(|e| PipelineError::upload(key.gs_uri(), e))?;

        info!(bytes = len, key = %key, "uploaded");
        Ok(())
    }

    #[instrument(level = "info", skip(self, local), fields(key = %key, dest = %local.display()))]
    async fn download(&self, key: &ObjectKey, local: &Path) -> Result<(), PipelineError> {
        let request = GetObjectRequest {
            bucket: key.bucket.clone(),
            object: key.path.clone(),
            ..Default::default()
        };
        let bytes = self
            .client
            .download_object(&request, &Range(None, None))
            .await
            .map_err(|e| PipelineError::store("download", key.gs_uri(), e))?;
        tokio::fs::write(local, &bytes)
            .await
            .map_err(|e| PipelineError::store("download", key.gs_uri(), e))?;
        info!(bytes = bytes.len(), key = %key, "downloaded staged object");
        Ok(())
    }
}
