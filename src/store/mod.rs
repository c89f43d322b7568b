use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::PipelineError;

pub mod gcs;
pub use gcs::GcsStore;

/// Bucket + object path addressing one staged blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub bucket: String,
    pub path: String,
}

impl ObjectKey {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    pub fn gs_uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.path)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gs_uri())
    }
}

/// Key-addressed staging storage between extraction and warehouse ingestion.
///
/// `exists` re-queries on every call; there is no caching across runs.
/// `upload` failures always propagate.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, key: &ObjectKey) -> Result<bool, PipelineError>;

    async fn upload(
        &self,
        local: &Path,
        key: &ObjectKey,
        timeout: Duration,
    ) -> Result<(), PipelineError>;

    /// Materializes an already-staged object locally, for runs that skip the
    /// download stage but still need to transform.
    async fn download(&self, key: &ObjectKey, local: &Path) -> Result<(), PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gs_uri_formats_bucket_and_path() {
        let key = ObjectKey::new("service-data-lake", "raw/csv/calls-2020.csv");
        assert_eq!(key.gs_uri(), "gs://service-data-lake/raw/csv/calls-2020.csv");
        assert_eq!(key.to_string(), key.gs_uri());
    }
}
