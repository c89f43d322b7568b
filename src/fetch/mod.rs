use async_trait::async_trait;
use futures_util::StreamExt;
use glob::glob;
use reqwest::Client;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, instrument};
use zip::ZipArchive;

use crate::error::PipelineError;

/// Streams the archive for a resolved URL and leaves exactly one decompressed
/// CSV in the destination directory.
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, PipelineError>;
}

/// HTTP implementation. The downloaded zip lives in its own [`TempDir`], which
/// is dropped once decompression completes or fails.
pub struct HttpArchiveFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpArchiveFetcher {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Chunked download of `url` into `dest_dir`, named after the URL's last
    /// path segment.
    async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, PipelineError> {
        let parsed = url::Url::parse(url).map_err(|e| PipelineError::download(url, e))?;
        let filename = parsed
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|name| !name.is_empty())
            .unwrap_or("download.zip");
        let dest_path = dest_dir.join(filename);

        let resp = self
            .client
            .get(parsed.as_str())
            .timeout(self.timeout)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| PipelineError::download(url, e))?;

        let mut out = fs::File::create(&dest_path)
            .await
            .map_err(|e| PipelineError::download(url, e))?;
        let mut stream = resp.bytes_stream();
        let mut bytes: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::download(url, e))?;
            bytes += chunk.len() as u64;
            out.write_all(&chunk)
                .await
                .map_err(|e| PipelineError::download(url, e))?;
        }
        out.flush()
            .await
            .map_err(|e| PipelineError::download(url, e))?;
        info!(url, bytes, "downloaded archive");
        Ok(dest_path)
    }
}

#[async_trait]
impl ArchiveFetcher for HttpArchiveFetcher {
    #[instrument(level = "info", skip(self, dest_dir), fields(dest = %dest_dir.display()))]
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, PipelineError> {
        // Scoped home for the zip itself; reclaimed on every path out of here.
        let zip_dir = TempDir::new().map_err(|e| PipelineError::download(url, e))?;
        let zip_path = self.download(url, zip_dir.path()).await?;

        let dest = dest_dir.to_path_buf();
        let unpacked = tokio::task::spawn_blocking(move || unpack_archive(&zip_path, &dest))
            .await
            .map_err(|e| PipelineError::extraction(url, e))??;

        drop(zip_dir);
        Ok(unpacked)
    }
}

/// Unzips `zip_path` into `dest_dir` and returns the single CSV it contains.
/// Zero or multiple CSVs is an ambiguity, not a guess.
pub fn unpack_archive(zip_path: &Path, dest_dir: &Path) -> Result<PathBuf, PipelineError> {
    let archive_name = zip_path.display().to_string();
    let file = File::open(zip_path).map_err(|e| PipelineError::extraction(&archive_name, e))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| PipelineError::extraction(&archive_name, e))?;
    archive
        .extract(dest_dir)
        .map_err(|e| PipelineError::extraction(&archive_name, e))?;

    single_csv(dest_dir)
}

/// Exactly-one-CSV invariant over the extraction directory.
fn single_csv(dir: &Path) -> Result<PathBuf, PipelineError> {
    let pattern = format!("{}/*.csv", dir.display());
    let mut found: Vec<PathBuf> = glob(&pattern)
        .map_err(|e| PipelineError::extraction(dir.display().to_string(), e))?
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .collect();

    if found.len() == 1 {
        Ok(found.remove(0))
    } else {
        Err(PipelineError::ExtractionAmbiguity { found: found.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::{ExtendedFileOptions, FileOptions};
    use zip::CompressionMethod;

    fn write_zip(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
        let zip_path = dir.join("sample.zip");
        let file = File::create(&zip_path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, body) in entries {
            let options = FileOptions::<ExtendedFileOptions>::default()
                .compression_method(CompressionMethod::Stored);
            zip.start_file(*name, options).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        zip_path
    }

    #[test]
    fn unpacks_single_csv() {
        let scratch = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let zip_path = write_zip(scratch.path(), &[("calls-2020.csv", "a,b\n1,2\n")]);

        let csv = unpack_archive(&zip_path, out.path()).unwrap();
        assert_eq!(csv.file_name().unwrap(), "calls-2020.csv");
        assert_eq!(std::fs::read_to_string(csv).unwrap(), "a,b\n1,2\n");
    }

    #[test]
    fn zero_csvs_is_ambiguous() {
        let scratch = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let zip_path = write_zip(scratch.path(), &[("readme.txt", "no data here")]);

        let err = unpack_archive(&zip_path, out.path()).unwrap_err();
        assert!(matches!(err, PipelineError::ExtractionAmbiguity { found: 0 }));
    }

    #[test]
    fn multiple_csvs_are_ambiguous() {
        let scratch = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let zip_path = write_zip(
            scratch.path(),
            &[("one.csv", "a\n1\n"), ("two.csv", "b\n2\n")],
        );

        let err = unpack_archive(&zip_path, out.path()).unwrap_err();
        assert!(matches!(err, PipelineError::ExtractionAmbiguity { found: 2 }));
    }

    #[test]
    fn corrupt_archive_is_an_extraction_error() {
        let scratch = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let bogus = scratch.path().join("broken.zip");
        std::fs::write(&bogus, b"this is not a zip").unwrap();

        let err = unpack_archive(&bogus, out.path()).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction { .. }));
    }
}
